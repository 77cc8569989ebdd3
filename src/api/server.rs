//! Diagnostics API Server
//!
//! Serves the REST router until the shared cancellation token fires.

use crate::error::{Error, Result};
use crate::network::NetworkManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::rest::RestRouter;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// Diagnostics API server
pub struct ApiServer {
    config: ApiServerConfig,
    manager: Arc<NetworkManager>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, manager: Arc<NetworkManager>) -> Self {
        Self { config, manager }
    }

    /// Serve until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let app = RestRouter::new(Arc::clone(&self.manager)).build();

        let listener = tokio::net::TcpListener::bind(self.config.rest_addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        info!("REST API listening on {}", self.config.rest_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ManagerConfig;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 8090);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let server = ApiServer::new(
            ApiServerConfig {
                rest_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            },
            Arc::new(NetworkManager::new(ManagerConfig::default())),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        server.run(cancel).await.unwrap();
    }
}
