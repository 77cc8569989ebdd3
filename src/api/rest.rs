//! REST API Handlers
//!
//! Read-only diagnostics over the manager's last computed NodeConfigs.

use crate::network::NetworkManager;
use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

// =============================================================================
// Response Types
// =============================================================================

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    manager: Arc<NetworkManager>,
}

impl RestRouter {
    pub fn new(manager: Arc<NetworkManager>) -> Self {
        Self { manager }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            manager: self.manager,
        };

        Router::new()
            .route("/v1/nodeconfigs", get(list_node_configs))
            .route("/v1/nodeconfigs/:node", get(get_node_config))
            .route("/health", get(health_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

#[derive(Clone)]
struct AppState {
    manager: Arc<NetworkManager>,
}

// =============================================================================
// Handlers
// =============================================================================

/// All NodeConfigs, keyed by node
async fn list_node_configs(State(state): State<AppState>) -> Response {
    debug!("Listing NodeConfigs");
    match state.manager.configs_json() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode NodeConfigs");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiErrorResponse {
                    error: "internal".into(),
                    message: e.to_string(),
                    details: None,
                }),
            )
                .into_response()
        }
    }
}

async fn get_node_config(
    State(state): State<AppState>,
    Path(node): Path<String>,
) -> impl IntoResponse {
    match state.manager.get_configs_by_node_name(&node) {
        Some(spec) => (StatusCode::OK, Json(spec)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiErrorResponse {
                error: "not_found".into(),
                message: format!("No NodeConfig for node {}", node),
                details: None,
            }),
        )
            .into_response(),
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
