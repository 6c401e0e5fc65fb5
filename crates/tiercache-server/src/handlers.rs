use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use tiercache_engine::{CacheEngine, PeerValue, PeerWrite};

use crate::error::ApiError;
use crate::metrics::render_metrics;

#[derive(Clone)]
pub struct AppState {
    pub engine: CacheEngine,
}

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

// ---------------------------------------------------------------------------
// Peer protocol
// ---------------------------------------------------------------------------

pub async fn peer_get(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    match state.engine.peer_read(&key).await? {
        Some(value) => Ok((StatusCode::OK, Json(PeerValue { value })).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

pub async fn peer_put(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<PeerWrite>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.peer_write(&key, body.value, body.ttl).await?;
    Ok((StatusCode::OK, Json(HealthResponse { status: "ok" })))
}

pub async fn peer_delete(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.peer_delete(&key).await?;
    Ok((StatusCode::OK, Json(HealthResponse { status: "ok" })))
}

// ---------------------------------------------------------------------------
// Administration
// ---------------------------------------------------------------------------

pub async fn admin_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.all_metrics())
}

pub async fn admin_reset_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.engine.reset_metrics(None);
    (StatusCode::OK, Json(HealthResponse { status: "reset" }))
}

pub async fn admin_invalidate(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if token.trim().is_empty() {
        return Err(ApiError::BadRequest("token must not be empty".into()));
    }
    let invalidated = state.engine.invalidate(&token).await?;
    tracing::info!(token = %token, invalidated, "Invalidation requested");
    Ok(Json(json!({ "token": token, "invalidated": invalidated })))
}

pub async fn admin_nodes(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.nodes())
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    match render_metrics(&state.engine) {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}
