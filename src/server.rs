//! HTTP control surface
//!
//! Lets operators and webhooks nudge the event loop.
//!
//! # Routes
//!
//! - `GET /health` - Liveness probe
//! - `GET /metrics` - Prometheus text exposition
//! - `POST /v1/sync` - Ask for a sync
//! - `POST /v1/poll` - Ask for an image poll
//!
//! Asks are debounced by the loop: the response says whether this request
//! queued one or joined one already pending.

use crate::daemon::{metrics, LoopHandle};
use crate::{ReconcilerError, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Shared server state
struct AppState {
    handle: LoopHandle,
}

/// Response to an ask
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AskResponse {
    /// `false` when a request of the same kind was already pending
    pub queued: bool,
}

/// Error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// HTTP server in front of the event loop
pub struct ControlServer {
    state: Arc<AppState>,
}

impl ControlServer {
    /// Create a server that asks the loop through `handle`
    pub fn new(handle: LoopHandle) -> Self {
        Self {
            state: Arc::new(AppState { handle }),
        }
    }

    fn router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/metrics", get(render_metrics))
            .route("/v1/sync", post(ask_for_sync))
            .route("/v1/poll", post(ask_for_image_poll))
            .with_state(state)
    }

    /// Serve on `addr` until `shutdown` completes
    pub async fn run<F>(self, addr: &str, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ReconcilerError::Config(format!("Failed to bind {}: {}", addr, e)))?;

        tracing::info!(addr = addr, "Control server listening");

        axum::serve(listener, Self::router(self.state))
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn render_metrics() -> std::result::Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    match metrics::encode_metrics() {
        Ok(body) => Ok((
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )),
    }
}

async fn ask_for_sync(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let queued = state.handle.ask_for_sync();
    tracing::info!(queued, "Sync requested over HTTP");
    (StatusCode::ACCEPTED, Json(AskResponse { queued }))
}

async fn ask_for_image_poll(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let queued = state.handle.ask_for_image_poll();
    tracing::info!(queued, "Image poll requested over HTTP");
    (StatusCode::ACCEPTED, Json(AskResponse { queued }))
}
