//! Administrative endpoints for inspecting and resetting counters.

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::info;

use super::AppState;
use crate::auth::Principal;
use crate::error::GateError;
use crate::ratelimit::{PolicyName, PolicyStats};

/// Rejects requests that do not carry an unrestricted principal.
pub async fn require_admin(req: Request, next: Next) -> Response {
    let denied = match req.extensions().get::<Principal>() {
        None => Some(GateError::Unauthenticated),
        Some(principal) if !principal.is_unrestricted() => Some(GateError::Forbidden),
        Some(_) => None,
    };
    match denied {
        Some(err) => err.into_response(),
        None => next.run(req).await,
    }
}

pub(super) async fn stats(State(state): State<AppState>) -> Json<Vec<PolicyStats>> {
    Json(state.registry().stats())
}

#[derive(Debug, Serialize)]
pub(super) struct ResetResponse {
    policy: PolicyName,
    key: String,
    removed: bool,
}

pub(super) async fn reset_key(
    State(state): State<AppState>,
    Path((policy, key)): Path<(String, String)>,
) -> Result<Json<ResetResponse>, GateError> {
    let policy: PolicyName = policy
        .parse()
        .map_err(|_| GateError::NotFound(format!("unknown policy: {}", policy)))?;
    let removed = state.registry().reset(policy, &key)?;
    info!(policy = %policy, key = %key, removed, "Rate limit key reset");
    Ok(Json(ResetResponse {
        policy,
        key,
        removed,
    }))
}

pub(super) async fn reset_all(State(state): State<AppState>) -> StatusCode {
    state.registry().reset_all();
    info!("All rate limit counters reset");
    StatusCode::NO_CONTENT
}
