//! HTTP surface of the daemon.
//!
//!   GET  /health                           → liveness
//!   POST /api/monitor                      → run one cycle, JSON CycleReport
//!   POST /api/track                        → subscribe, JSON outcome
//!   POST /api/untrack                      → unsubscribe, JSON outcome
//!   GET  /api/subscribers/:id/targets      → JSON list of targets
//!
//! Everything under /api requires `Authorization: Bearer <auth_token>`.

use crate::monitor::{AbortReason, CycleState, Monitor};
use crate::registry::{Profile, RegistryError, TargetSpec};
use crate::resolver::ResolveError;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ServerState {
    pub monitor: Arc<Monitor>,
    pub auth_token: Arc<str>,
}

#[derive(Debug, Deserialize)]
pub struct TrackRequest {
    pub subscriber_id: String,
    pub delivery_address: String,
    #[serde(default)]
    pub display_name: String,
    /// Address or handle ("@name").
    pub target: String,
}

#[derive(Debug, Deserialize)]
pub struct UntrackRequest {
    pub subscriber_id: String,
    pub target: String,
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/monitor", post(api_monitor))
        .route("/api/track", post(api_track))
        .route("/api/untrack", post(api_untrack))
        .route("/api/subscribers/:id/targets", get(api_targets))
        .with_state(state)
}

pub async fn serve(state: ServerState, bind_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "trigger server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn authorized(state: &ServerState, headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| !state.auth_token.is_empty() && token == &*state.auth_token)
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response()
}

// --- Handlers ---

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn api_monitor(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let report = state.monitor.run_cycle().await;
    // Partial failures are in the counters; only missing setup is an error.
    let status = match report.state {
        CycleState::Aborted {
            reason: AbortReason::ChannelNotConfigured | AbortReason::RegistryUnavailable,
        } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report)).into_response()
}

async fn api_track(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<TrackRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let display_name = if req.display_name.is_empty() {
        req.subscriber_id.clone()
    } else {
        req.display_name
    };
    let profile = Profile {
        subscriber_id: req.subscriber_id,
        delivery_address: req.delivery_address,
        display_name,
    };
    match state
        .monitor
        .registry()
        .subscribe(&profile, &TargetSpec::parse(&req.target))
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => registry_error(e),
    }
}

async fn api_untrack(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<UntrackRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    match state
        .monitor
        .registry()
        .unsubscribe(&req.subscriber_id, &TargetSpec::parse(&req.target))
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => registry_error(e),
    }
}

async fn api_targets(State(state): State<ServerState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    match state.monitor.registry().targets_of(&id).await {
        Ok(targets) => Json(targets).into_response(),
        Err(e) => registry_error(e),
    }
}

fn registry_error(err: RegistryError) -> Response {
    let (status, retryable) = match &err {
        RegistryError::Resolution(ResolveError::NotFound(_)) => (StatusCode::NOT_FOUND, false),
        RegistryError::Resolution(_) => (StatusCode::BAD_GATEWAY, true),
        RegistryError::ResolutionConflict { .. } => (StatusCode::CONFLICT, false),
        RegistryError::Conflict { retryable, .. } => (StatusCode::CONFLICT, *retryable),
        RegistryError::Store(_) | RegistryError::Cursor(_) => (StatusCode::SERVICE_UNAVAILABLE, true),
        RegistryError::Corrupt { .. } => (StatusCode::INTERNAL_SERVER_ERROR, false),
    };
    warn!(error = %err, status = status.as_u16(), "registry request failed");
    (status, Json(json!({ "error": err.to_string(), "retryable": retryable }))).into_response()
}
