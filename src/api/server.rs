//! API server using Axum

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::error::{Result, RotorError};
use crate::pool::Pool;
use crate::rotator::Rotator;

use super::routes;

/// API server settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Port to bind on the loopback interface.
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 9090 }
    }
}

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool>,
    pub rotator: Arc<Rotator>,
}

/// API server
pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiConfig, pool: Arc<Pool>, rotator: Arc<Rotator>) -> Self {
        Self {
            config,
            state: AppState { pool, rotator },
        }
    }

    /// Run the API server until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.config.port));
        let router = routes::create_router(self.state.clone());

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("API server listening on http://{}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| RotorError::Internal(e.to_string()))?;

        info!("API server shut down");
        Ok(())
    }
}
