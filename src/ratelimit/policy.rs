//! Named throttling policies and their per-request evaluation.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::counter::{CounterEntry, CounterStore};
use crate::auth::Role;
use crate::error::GateError;
use crate::request::RequestContext;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_USED: &str = "x-ratelimit-used";

/// The built-in policies the server applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyName {
    General,
    Strict,
    Authentication,
    Upload,
    ApiKey,
}

impl PolicyName {
    pub const ALL: [PolicyName; 5] = [
        PolicyName::General,
        PolicyName::Strict,
        PolicyName::Authentication,
        PolicyName::Upload,
        PolicyName::ApiKey,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyName::General => "general",
            PolicyName::Strict => "strict",
            PolicyName::Authentication => "authentication",
            PolicyName::Upload => "upload",
            PolicyName::ApiKey => "api-key",
        }
    }
}

impl fmt::Display for PolicyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyName {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PolicyName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| GateError::Config(format!("unknown rate limit policy: {}", s)))
    }
}

/// How a request is mapped to its counter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Principal id when authenticated, else client IP.
    PrincipalOrIp,
    /// Principal id and client IP together, else client IP.
    PrincipalAndIp,
    /// Client IP only.
    Ip,
    /// API key id, else principal id, else client IP.
    ApiKeyOrPrincipalOrIp,
}

impl KeyStrategy {
    pub fn derive(&self, prefix: &str, ctx: &RequestContext) -> String {
        let principal = ctx.principal.as_ref();
        match self {
            KeyStrategy::PrincipalOrIp => match principal {
                Some(p) => format!("{}:user:{}", prefix, p.id),
                None => format!("{}:ip:{}", prefix, ctx.ip_key()),
            },
            KeyStrategy::PrincipalAndIp => match principal {
                Some(p) => format!("{}:{}:{}", prefix, p.id, ctx.ip_key()),
                None => format!("{}:ip:{}", prefix, ctx.ip_key()),
            },
            KeyStrategy::Ip => format!("{}:{}", prefix, ctx.ip_key()),
            KeyStrategy::ApiKeyOrPrincipalOrIp => match (&ctx.api_key, principal) {
                (Some(key), _) => format!("{}:key:{}", prefix, key),
                (None, Some(p)) => format!("{}:user:{}", prefix, p.id),
                (None, None) => format!("{}:ip:{}", prefix, ctx.ip_key()),
            },
        }
    }
}

/// Requests a policy leaves alone entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipRule {
    /// Skip principals whose role is unrestricted.
    pub unrestricted_roles: bool,
    /// Additional roles to skip.
    pub roles: Vec<Role>,
    /// Exact request paths to skip.
    pub paths: Vec<String>,
}

impl SkipRule {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn unrestricted() -> Self {
        Self {
            unrestricted_roles: true,
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.push(role);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.paths.push(path.into());
        self
    }

    pub fn matches(&self, ctx: &RequestContext) -> bool {
        if let Some(principal) = &ctx.principal {
            if self.unrestricted_roles && principal.is_unrestricted() {
                return true;
            }
            if self.roles.contains(&principal.role) {
                return true;
            }
        }
        self.paths.iter().any(|path| *path == ctx.path)
    }
}

/// How the downstream handler finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn from_status(status: StatusCode) -> Self {
        if status.as_u16() < 400 {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Which outcomes give their request back to the counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compensation {
    pub on_success: bool,
    pub on_failure: bool,
}

impl Compensation {
    pub fn is_enabled(&self) -> bool {
        self.on_success || self.on_failure
    }

    pub fn applies(&self, outcome: Outcome) -> bool {
        match outcome {
            Outcome::Success => self.on_success,
            Outcome::Failure => self.on_failure,
        }
    }
}

/// Side effect run when a request is rejected. Receives the counter key.
pub type ExceededHook = Arc<dyn Fn(&RequestContext, &str) + Send + Sync>;

/// A named throttling configuration. Immutable once registered.
#[derive(Clone)]
pub struct LimiterPolicy {
    pub name: PolicyName,
    /// Message returned to clients on rejection.
    pub message: String,
    pub window: Duration,
    pub max_requests: u64,
    pub key_prefix: String,
    pub key: KeyStrategy,
    pub skip: SkipRule,
    pub compensate: Compensation,
    pub on_exceeded: Option<ExceededHook>,
}

impl fmt::Debug for LimiterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterPolicy")
            .field("name", &self.name)
            .field("window", &self.window)
            .field("max_requests", &self.max_requests)
            .field("key", &self.key)
            .field("skip", &self.skip)
            .field("compensate", &self.compensate)
            .field("on_exceeded", &self.on_exceeded.is_some())
            .finish()
    }
}

impl LimiterPolicy {
    /// 100 requests per 15 minutes for every endpoint.
    pub fn general(health_path: &str) -> Self {
        Self {
            name: PolicyName::General,
            message: "Too many requests from this client, please try again later.".to_string(),
            window: Duration::from_secs(15 * 60),
            max_requests: 100,
            key_prefix: "general".to_string(),
            key: KeyStrategy::PrincipalOrIp,
            skip: SkipRule::unrestricted().with_path(health_path),
            compensate: Compensation::default(),
            on_exceeded: None,
        }
    }

    /// 10 requests per 5 minutes for sensitive endpoints.
    pub fn strict() -> Self {
        Self {
            name: PolicyName::Strict,
            message: "Too many requests to this endpoint, please slow down.".to_string(),
            window: Duration::from_secs(5 * 60),
            max_requests: 10,
            key_prefix: "strict".to_string(),
            key: KeyStrategy::PrincipalAndIp,
            skip: SkipRule::unrestricted(),
            compensate: Compensation::default(),
            on_exceeded: None,
        }
    }

    /// 5 failed attempts per 15 minutes per client address.
    pub fn authentication() -> Self {
        let hook: ExceededHook = Arc::new(|ctx: &RequestContext, key: &str| {
            tracing::warn!(
                client_ip = %ctx.ip_key(),
                path = %ctx.path,
                key = %key,
                "Authentication attempts throttled"
            );
        });
        Self {
            name: PolicyName::Authentication,
            message: "Too many authentication attempts, please try again later.".to_string(),
            window: Duration::from_secs(15 * 60),
            max_requests: 5,
            key_prefix: "auth".to_string(),
            key: KeyStrategy::Ip,
            skip: SkipRule::none(),
            compensate: Compensation {
                on_success: true,
                on_failure: false,
            },
            on_exceeded: Some(hook),
        }
    }

    /// 50 uploads per hour.
    pub fn upload() -> Self {
        Self {
            name: PolicyName::Upload,
            message: "Upload limit reached, please try again later.".to_string(),
            window: Duration::from_secs(60 * 60),
            max_requests: 50,
            key_prefix: "upload".to_string(),
            key: KeyStrategy::PrincipalOrIp,
            skip: SkipRule::unrestricted().with_role(Role::Developer),
            compensate: Compensation::default(),
            on_exceeded: None,
        }
    }

    /// 1000 requests per hour per API key.
    pub fn api_key() -> Self {
        Self {
            name: PolicyName::ApiKey,
            message: "API key request quota exceeded, please try again later.".to_string(),
            window: Duration::from_secs(60 * 60),
            max_requests: 1000,
            key_prefix: "api".to_string(),
            key: KeyStrategy::ApiKeyOrPrincipalOrIp,
            skip: SkipRule::none(),
            compensate: Compensation::default(),
            on_exceeded: None,
        }
    }

    /// Counter key for a request under this policy.
    pub fn key_for(&self, ctx: &RequestContext) -> String {
        self.key.derive(&self.key_prefix, ctx)
    }

    /// Run skip, key derivation, increment and the limit decision.
    ///
    /// A skipped request never touches the store.
    pub fn evaluate(&self, ctx: &RequestContext, store: &CounterStore) -> Decision {
        if self.skip.matches(ctx) {
            return Decision::Skipped;
        }

        let key = self.key_for(ctx);
        let entry = store.increment(&key, self.window);
        let info = RateLimitInfo::new(self.max_requests, &entry);

        if entry.count <= self.max_requests {
            return Decision::Allowed { key, info };
        }

        let now = store.clock().now();
        let retry_after_secs = retry_after_secs(&entry, now);
        debug!(
            policy = %self.name,
            key = %key,
            count = entry.count,
            limit = self.max_requests,
            retry_after_secs,
            "Rate limit exceeded"
        );
        if let Some(hook) = &self.on_exceeded {
            hook(ctx, &key);
        }

        Decision::Rejected {
            key,
            info,
            retry_after_secs,
        }
    }
}

fn retry_after_secs(entry: &CounterEntry, now: chrono::DateTime<chrono::Utc>) -> u64 {
    let millis = entry.duration_until_reset(now).as_millis() as u64;
    millis.div_ceil(1000)
}

/// Values reported in the `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset_epoch_secs: i64,
    pub used: u64,
}

impl RateLimitInfo {
    pub fn new(limit: u64, entry: &CounterEntry) -> Self {
        Self {
            limit,
            remaining: limit.saturating_sub(entry.count),
            reset_epoch_secs: entry.reset_epoch_secs(),
            used: entry.count,
        }
    }

    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(HeaderName::from_static(HEADER_LIMIT), HeaderValue::from(self.limit));
        headers.insert(
            HeaderName::from_static(HEADER_REMAINING),
            HeaderValue::from(self.remaining),
        );
        headers.insert(
            HeaderName::from_static(HEADER_RESET),
            HeaderValue::from(self.reset_epoch_secs),
        );
        headers.insert(HeaderName::from_static(HEADER_USED), HeaderValue::from(self.used));
    }
}

/// Result of evaluating one policy against one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skipped,
    Allowed {
        key: String,
        info: RateLimitInfo,
    },
    Rejected {
        key: String,
        info: RateLimitInfo,
        retry_after_secs: u64,
    },
}
