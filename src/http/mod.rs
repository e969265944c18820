//! HTTP surface: shared state, router composition and the server loop.

mod admin;
mod server;

use std::sync::Arc;

use axum::routing::{delete, get};
use axum::{middleware, Json, Router};
use serde_json::json;

use crate::error::{GateError, Result};
use crate::ratelimit::{rate_limit, LimiterRegistry, PolicyName};

pub use admin::require_admin;
pub use server::HttpServer;

/// Shared application state, cloneable across handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    registry: Arc<LimiterRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<LimiterRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }
}

/// Compose `app` with the health and admin endpoints, all behind the
/// general policy.
pub fn router(state: AppState, health_path: &str, app: Router) -> Result<Router> {
    if !health_path.starts_with('/') {
        return Err(GateError::Config(format!(
            "health_path must start with '/': {}",
            health_path
        )));
    }
    let general = state
        .registry
        .gate(PolicyName::General)
        .ok_or_else(|| GateError::Config("general policy is not registered".to_string()))?;

    let admin = Router::new()
        .route(
            "/admin/rate-limits",
            get(admin::stats).delete(admin::reset_all),
        )
        .route(
            "/admin/rate-limits/{policy}/keys/{key}",
            delete(admin::reset_key),
        )
        .route_layer(middleware::from_fn(require_admin))
        .with_state(state);

    Ok(Router::new()
        .route(health_path, get(health))
        .merge(admin)
        .merge(app)
        .layer(middleware::from_fn_with_state(general, rate_limit)))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
