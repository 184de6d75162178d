//! Local HTTP control API.
//!
//! A thin axum facade over the shared agent handle: operators read the
//! machine's snapshot and post intents. Nothing here mutates machine
//! state directly; the daemon interprets intents at the next
//! transition.

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::daemon::{AgentHandle, Intent};
use crate::settings::ApiSettings;

/// API server state
#[derive(Clone)]
pub struct ApiState {
    handle: Arc<AgentHandle>,
}

/// API server
pub struct ApiServer {
    config: ApiSettings,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub fn new(config: ApiSettings, handle: Arc<AgentHandle>) -> Self {
        Self {
            config,
            state: Arc::new(ApiState { handle }),
        }
    }

    pub async fn start(&self) -> Result<tokio::task::JoinHandle<Result<()>>> {
        let app = self.create_router();

        let bind_addr = format!("{}:{}", self.config.bind, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await?;

        info!("control API listening on {}", bind_addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .map_err(|e| anyhow::anyhow!("API server error: {}", e))
        });

        Ok(handle)
    }

    fn create_router(&self) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/status", get(get_status))
            .route("/metadata", get(get_metadata))
            .route("/update", post(start_update))
            .route("/download/abort", post(abort_download))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Current state id, download progress and the most recent error.
async fn get_status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let snapshot = state.handle.snapshot();

    Json(StatusResponse {
        state: snapshot.state.as_str().to_string(),
        package_uid: snapshot.package_uid,
        progress: snapshot.progress,
        last_error: snapshot.last_error,
    })
}

#[derive(Serialize)]
struct StatusResponse {
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    package_uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

/// The in-flight update package, when any state holds one.
async fn get_metadata(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let snapshot = state.handle.snapshot();
    let update = snapshot.update.ok_or(StatusCode::NOT_FOUND)?;

    serde_json::from_slice(update.raw())
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Force an update check. Accepted only while the machine is idle.
async fn start_update(State(state): State<Arc<ApiState>>) -> StatusCode {
    if state.handle.post(Intent::StartUpdate) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    }
}

/// Abort an in-flight download.
async fn abort_download(State(state): State<Arc<ApiState>>) -> StatusCode {
    if state.handle.post(Intent::AbortDownload) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    }
}
