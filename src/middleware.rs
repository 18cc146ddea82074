use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ApiError;
use crate::rate_limit::Decision;
use crate::state::AppState;

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

// path prefix -> scope, longest prefix wins
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<(String, String)>,
}

impl RouteTable {
    pub fn insert(&mut self, prefix: &str, scope: &str) {
        self.entries.retain(|(p, _)| p != prefix);
        self.entries.push((prefix.to_string(), scope.to_string()));
        self.entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    pub fn scope_for(&self, path: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(prefix, _)| prefix_matches(prefix, path))
            .map(|(_, scope)| scope.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// "/api/login" matches "/api/login" and "/api/login/x", not "/api/loginx"
fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

// Whole seconds, rounded up
pub(crate) fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

pub fn throttled_response(wait: Option<Duration>) -> Response {
    let secs = wait.map(ceil_secs);
    let detail = match secs {
        Some(1) => "Request was throttled. Expected available in 1 second.".to_string(),
        Some(n) => format!("Request was throttled. Expected available in {} seconds.", n),
        None => "Request was throttled.".to_string(),
    };

    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({ "detail": detail })),
    )
        .into_response();
    if let Some(n) = secs {
        response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(n));
    }
    response
}

pub async fn throttle(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let Some(identity) = state.resolver.resolve(request.headers(), peer) else {
        return ApiError::BadRequest("cannot determine client identity".to_string()).into_response();
    };

    let scopes = state.scopes_for(request.uri().path(), &identity);
    let key = identity.key();

    // all scopes are checked so each one records the attempt
    let mut tightest: Option<Decision> = None;
    let mut denied = false;
    let mut wait: Option<Duration> = None;
    for scope in scopes {
        match state.engine.check_and_record(scope, &key).await {
            Ok(decision) if decision.allowed => {
                if tightest.is_none_or(|t| decision.remaining < t.remaining) {
                    tightest = Some(decision);
                }
            }
            Ok(decision) => {
                denied = true;
                wait = wait.max(decision.retry_after);
            }
            Err(e) => return ApiError::Internal(e.to_string()).into_response(),
        }
    }

    if denied {
        return throttled_response(wait);
    }

    let mut response = next.run(request).await;
    if let Some(decision) = tightest {
        let headers = response.headers_mut();
        headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(decision.limit));
        headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
    }
    response
}
