//! Per-request facts that throttling policies key and skip on.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method};

use crate::auth::{ApiKeyId, Principal};

/// Placeholder used in counter keys when no client address is known.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Snapshot of the request attributes consulted by a gate.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub client_ip: Option<IpAddr>,
    pub principal: Option<Principal>,
    pub api_key: Option<ApiKeyId>,
}

impl RequestContext {
    /// Build a context from HTTP request parts.
    ///
    /// With `trust_proxy` set, the first `X-Forwarded-For` hop is taken as the
    /// client address; otherwise only the socket peer address is used.
    pub fn from_parts(parts: &Parts, trust_proxy: bool) -> Self {
        let forwarded = if trust_proxy {
            forwarded_for(&parts.headers)
        } else {
            None
        };
        let client_ip = forwarded.or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip())
        });

        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            client_ip,
            principal: parts.extensions.get::<Principal>().cloned(),
            api_key: parts.extensions.get::<ApiKeyId>().cloned(),
        }
    }

    /// A context with only a path, for tests and tooling.
    pub fn anonymous(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            client_ip: None,
            principal: None,
            api_key: None,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn with_api_key(mut self, key: ApiKeyId) -> Self {
        self.api_key = Some(key);
        self
    }

    /// Client address rendered for use inside a counter key.
    pub fn ip_key(&self) -> String {
        self.client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}
