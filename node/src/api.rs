//! # HTTP API
//!
//! Read-only HTTP view of a serving node. All handlers share [`AppState`]
//! through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path              | Description                              |
//! |--------|-------------------|------------------------------------------|
//! | GET    | `/health`         | Liveness check                           |
//! | GET    | `/status`         | Log summary as JSON                      |
//! | GET    | `/blocks/:index`  | A locally stored block, hex in JSON      |
//! | GET    | `/metrics`        | Prometheus metrics                       |

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use omega_protocol::Omega;

use crate::metrics::{metrics_handler, SharedMetrics};

/// Shared state for every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub log: Omega,
    pub metrics: SharedMetrics,
}

impl axum::extract::FromRef<AppState> for SharedMetrics {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockResponse {
    pub index: u64,
    pub size: usize,
    pub hex: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/blocks/:index", get(block_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error(status: StatusCode, message: impl ToString) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.log.info().await {
        Ok(info) => {
            let mut body = serde_json::to_value(&info).unwrap_or_default();
            body["version"] = serde_json::Value::String(state.version.clone());
            Json(body).into_response()
        }
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Only serves blocks already stored here. Fetching from peers on behalf of
/// an HTTP client would let anyone make this node download arbitrary ranges.
async fn block_handler(
    State(state): State<AppState>,
    Path(index): Path<u64>,
) -> impl IntoResponse {
    match state.log.has(index).await {
        Ok(true) => {}
        Ok(false) => return error(StatusCode::NOT_FOUND, format!("block {} not stored", index)),
        Err(e) => return error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
    match state.log.get(index).await {
        Ok(block) => Json(BlockResponse {
            index,
            size: block.len(),
            hex: hex::encode(&block),
        })
        .into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}
