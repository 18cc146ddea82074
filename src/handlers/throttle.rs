use axum::{
    Json,
    extract::{Query, State},
};
use std::sync::Arc;
use crate::error::ApiError;
use crate::models::{CheckRequest, CheckResponse, StatusQuery, StatusResponse};
use crate::scope::ScopeView;
use crate::state::AppState;

// Decision API for application workers that throttle in-process handlers
pub async fn check_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CheckRequest>,
) -> Result<Json<CheckResponse>, ApiError> {
    let decision = state
        .engine
        .check_and_record(&payload.scope, &payload.identity)
        .await?;
    Ok(Json(decision.into()))
}

pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let window = state.engine.peek(&query.scope, &query.identity).await?;
    Ok(Json(StatusResponse {
        identity: query.identity,
        window,
    }))
}

pub async fn scopes_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ScopeView>> {
    Json(state.engine.registry().iter().map(ScopeView::from).collect())
}
