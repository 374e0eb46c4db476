//! JSON API over the control socket.
//!
//! Four routes, delegating everything to the engine handle:
//!
//! | Route | Result |
//! |---|---|
//! | `POST /v1/block` | 204 accepted; 400 missing domain; 500 engine error |
//! | `POST /v1/unblock` | 204 accepted; 400 missing id |
//! | `GET /v1/status` | rule count, uptime, build info |
//! | `GET /v1/rules` | the rule snapshot |
//!
//! A 204 from `block` means the command was enqueued, not that the rule is
//! live; resolution happens asynchronously in the engine worker.

use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use void_core::api::{BlockRequest, StatusResponse, UnblockRequest};
use void_core::buildinfo;

use crate::engine::EngineHandle;

#[derive(Clone)]
struct AppState {
    engine: EngineHandle,
    started_at: Instant,
}

/// Builds the API router around an engine handle.
#[must_use]
pub fn router(engine: EngineHandle) -> Router {
    let state = AppState {
        engine,
        started_at: Instant::now(),
    };
    Router::new()
        .route("/v1/block", post(handle_block))
        .route("/v1/unblock", post(handle_unblock))
        .route("/v1/status", get(handle_status))
        .route("/v1/rules", get(handle_rules))
        .with_state(state)
}

/// Serves the API on the given listener until `shutdown` trips.
pub async fn serve(
    listener: UnixListener,
    engine: EngineHandle,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!("api server listening");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn handle_block(State(state): State<AppState>, Json(req): Json<BlockRequest>) -> Response {
    if req.domain.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "domain required").into_response();
    }

    let ttl = Duration::from_nanos(req.ttl);
    match state.engine.block(req.domain, ttl).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn handle_unblock(
    State(state): State<AppState>,
    Json(req): Json<UnblockRequest>,
) -> Response {
    if req.id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "id required").into_response();
    }

    state.engine.unblock(req.id);
    StatusCode::NO_CONTENT.into_response()
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let uptime = u64::try_from(state.started_at.elapsed().as_nanos()).unwrap_or(u64::MAX);
    Json(StatusResponse {
        rules: state.engine.rule_count(),
        uptime,
        version: buildinfo::VERSION.to_string(),
        commit: buildinfo::COMMIT.to_string(),
    })
}

async fn handle_rules(State(state): State<AppState>) -> Json<Vec<void_core::rules::Rule>> {
    Json(state.engine.snapshot())
}
