//! Request-processing middleware that applies one policy.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use super::counter::CounterStore;
use super::policy::{
    Compensation, Decision, LimiterPolicy, Outcome, RateLimitInfo, HEADER_LIMIT,
};
use crate::error::GateError;
use crate::request::RequestContext;

/// Admission outcome for a single request.
#[derive(Debug)]
pub enum Admission {
    /// The policy does not apply to this request.
    Skipped,
    /// Counted and allowed; headers should be emitted.
    Admitted { key: String, info: RateLimitInfo },
}

/// A policy bound to the store that holds its counters.
#[derive(Clone, Debug)]
pub struct RequestGate {
    policy: Arc<LimiterPolicy>,
    store: Arc<CounterStore>,
    trust_proxy: bool,
}

impl RequestGate {
    pub fn new(policy: Arc<LimiterPolicy>, store: Arc<CounterStore>, trust_proxy: bool) -> Self {
        Self {
            policy,
            store,
            trust_proxy,
        }
    }

    pub fn policy(&self) -> &LimiterPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    pub fn trust_proxy(&self) -> bool {
        self.trust_proxy
    }

    /// Count the request and decide whether it may proceed.
    ///
    /// On rejection the returned error carries the policy message and retry
    /// delay, and the headers to emit are returned alongside it.
    pub fn admit(
        &self,
        ctx: &RequestContext,
    ) -> std::result::Result<Admission, (GateError, RateLimitInfo)> {
        match self.policy.evaluate(ctx, &self.store) {
            Decision::Skipped => Ok(Admission::Skipped),
            Decision::Allowed { key, info } => Ok(Admission::Admitted { key, info }),
            Decision::Rejected {
                info,
                retry_after_secs,
                ..
            } => Err((
                GateError::RateLimitExceeded {
                    message: self.policy.message.clone(),
                    retry_after_secs,
                },
                info,
            )),
        }
    }

    /// Arm a compensating decrement for an admitted request.
    pub fn compensation_guard(&self, key: String) -> Option<CompensationGuard> {
        if !self.policy.compensate.is_enabled() {
            return None;
        }
        Some(CompensationGuard {
            store: Arc::clone(&self.store),
            key,
            rule: self.policy.compensate,
            outcome: None,
        })
    }
}

/// Gives a request back to its counter once the handler has settled.
///
/// The decrement runs on drop, so it also happens when the handler panics or
/// the request future is cancelled. A request that never recorded an outcome
/// counts as a failure.
///
/// The decrement re-reads the entry by key only, so under contention it may
/// land on a newer window than the one this request was counted in.
#[derive(Debug)]
pub struct CompensationGuard {
    store: Arc<CounterStore>,
    key: String,
    rule: Compensation,
    outcome: Option<Outcome>,
}

impl CompensationGuard {
    pub fn record(&mut self, outcome: Outcome) {
        self.outcome = Some(outcome);
    }
}

impl Drop for CompensationGuard {
    fn drop(&mut self) {
        let outcome = self.outcome.unwrap_or(Outcome::Failure);
        if !self.rule.applies(outcome) {
            return;
        }
        match self.store.decrement(&self.key) {
            Some(entry) => debug!(
                key = %self.key,
                outcome = ?outcome,
                count = entry.count,
                "Compensated rate limit counter"
            ),
            None => debug!(key = %self.key, "Counter expired before compensation"),
        }
    }
}

/// Axum middleware applying a [`RequestGate`].
///
/// ```ignore
/// Router::new()
///     .route("/api/auth/login", post(login))
///     .route_layer(middleware::from_fn_with_state(
///         registry.gate(PolicyName::Authentication).unwrap(),
///         rate_limit,
///     ));
/// ```
pub async fn rate_limit(State(gate): State<RequestGate>, req: Request, next: Next) -> Response {
    let (parts, body) = req.into_parts();
    let ctx = RequestContext::from_parts(&parts, gate.trust_proxy);
    let req = Request::from_parts(parts, body);

    match gate.admit(&ctx) {
        Ok(Admission::Skipped) => next.run(req).await,
        Ok(Admission::Admitted { key, info }) => {
            let mut guard = gate.compensation_guard(key);
            let mut response = next.run(req).await;
            if let Some(guard) = guard.as_mut() {
                guard.record(Outcome::from_status(response.status()));
            }
            drop(guard);
            // A gate closer to the handler has already reported its own limits.
            if !response.headers().contains_key(HEADER_LIMIT) {
                info.apply_headers(response.headers_mut());
            }
            response
        }
        Err((err, info)) => {
            let mut response = err.into_response();
            info.apply_headers(response.headers_mut());
            response
        }
    }
}
