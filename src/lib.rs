pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod redis_store;
pub mod scope;
pub mod state;
pub mod store;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use std::sync::Arc;

use crate::handlers::{
    check_handler, health_handler, metrics_handler, proxy_handler, scopes_handler, status_handler,
};
use crate::state::AppState;

pub use crate::rate_limit::{Decision, FailurePolicy, ThrottleEngine};
pub use crate::scope::{ScopeRegistry, ThrottleScope};

// Gateway endpoints are never throttled; everything else is throttled then proxied
pub fn router(state: Arc<AppState>) -> Router {
    let proxied = Router::new()
        .fallback(proxy_handler)
        .layer(from_fn_with_state(state.clone(), middleware::throttle))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/scopes", get(scopes_handler))
        .route("/v1/throttle/check", post(check_handler))
        .route("/v1/throttle/status", get(status_handler))
        .fallback_service(proxied)
        .with_state(state)
}
