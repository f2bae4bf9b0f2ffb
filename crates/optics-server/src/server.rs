use std::sync::Arc;

use tokio::net::TcpListener;

use optics_api::PigeonOptics;
use optics_lens::Sandbox;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::routes::build_router;
use crate::state::AppState;

/// The Pigeon Optics HTTP server.
pub struct OpticsServer {
    config: ServerConfig,
    state: AppState,
}

impl OpticsServer {
    /// Open the node at the configured data root and prepare the server.
    pub fn open(config: ServerConfig, sandbox: Arc<dyn Sandbox>) -> ServerResult<Self> {
        let node = PigeonOptics::open(&config.data_root, sandbox)?;
        Ok(Self {
            config,
            state: AppState::new(node),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn node(&self) -> &PigeonOptics {
        &self.state.node
    }

    /// Build the router (useful for testing).
    pub fn router(&self) -> axum::Router {
        build_router(self.state.clone())
    }

    /// Start the lens engine and serve requests until shutdown.
    pub async fn serve(self) -> ServerResult<()> {
        let engine = self.state.node.start_engine();
        let app = self.router();
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        tracing::info!("pigeon optics listening on {}", self.config.bind_addr);
        let result = axum::serve(listener, app)
            .await
            .map_err(|err| ServerError::Internal(err.to_string()));
        engine.abort();
        result
    }
}
