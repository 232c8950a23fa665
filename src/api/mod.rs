//! REST API served in monitor mode.
//!
//! Provides HTTP endpoints for:
//! - Listing and inspecting meetings
//! - Manual meeting entry with an immediate trigger
//! - Operator cancellation

pub mod error;
pub mod routes;

use crate::config::Config;
use crate::db::MeetingStore;
use crate::scheduler::SchedulerHandle;
use anyhow::Result;
use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceBuilder;
use tracing::info;

pub use routes::meetings::MeetingState;

pub struct ApiServer {
    port: u16,
    state: MeetingState,
}

impl ApiServer {
    pub fn new(store: Arc<dyn MeetingStore>, scheduler: SchedulerHandle, config: &Config) -> Self {
        Self {
            port: config.api.port,
            state: MeetingState { store, scheduler },
        }
    }

    pub fn router(state: MeetingState) -> Router {
        Router::new()
            .route("/", get(status))
            .route("/version", get(version))
            .merge(routes::meetings::router(state))
            .layer(ServiceBuilder::new())
    }

    pub async fn start(self) -> Result<()> {
        let app = Self::router(self.state);
        let listener = tokio::net::TcpListener::bind(&format!("127.0.0.1:{}", self.port)).await?;

        info!("API server listening on http://127.0.0.1:{}", self.port);
        info!("Endpoints:");
        info!("  GET  /                     - Service info");
        info!("  GET  /version              - Get version info");
        info!("  GET  /meetings             - List meetings");
        info!("  GET  /meetings/:id         - Get a single meeting");
        info!("  POST /meetings             - Register a meeting and trigger it now");
        info!("  POST /meetings/:id/cancel  - Cancel a meeting");

        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn status() -> Json<Value> {
    Json(json!({
        "service": "interview-capture",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

async fn version() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "name": "interview-capture"
    }))
}
