use axum::{
    Json,
    body::to_bytes,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use crate::metrics::PROXIED_REQUESTS;
use crate::state::AppState;

pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

// connection-level headers that must not cross the proxy
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let hop_by_hop = [
        header::CONNECTION,
        header::HOST,
        header::CONTENT_LENGTH,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ];
    for name in hop_by_hop {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

fn bad_gateway(reason: String) -> Response {
    tracing::warn!("[proxy] {}", reason);
    (
        StatusCode::BAD_GATEWAY,
        Json(serde_json::json!({ "success": false, "error": "upstream unavailable" })),
    )
        .into_response()
}

// Forward an already-throttled request to the upstream application
pub async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    PROXIED_REQUESTS.inc();

    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({ "success": false, "error": "request body too large" })),
            )
                .into_response();
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.upstream, path_and_query);

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);

    let result = state
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    match result {
        Ok(res) => {
            let status = res.status();
            let mut headers = res.headers().clone();
            strip_hop_by_hop(&mut headers);
            match res.bytes().await {
                Ok(bytes) => (status, headers, bytes).into_response(),
                Err(e) => bad_gateway(format!("reading upstream body from {} failed: {}", url, e)),
            }
        }
        Err(e) => bad_gateway(format!("request to {} failed: {}", url, e)),
    }
}
