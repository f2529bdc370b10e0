use std::sync::Arc;

use error_stack::Report;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio::sync::oneshot;
use tracing::error;
use tracing::info;

use super::errors::ApiError;
use super::handlers::add_gpu;
use super::handlers::remove_gpu;
use super::handlers::status;
use super::handlers::ApiState;

pub fn routes(state: Arc<ApiState>) -> impl Endpoint {
    Route::new()
        .at("/api/v1/gpus/add", post(add_gpu))
        .at("/api/v1/gpus/remove", post(remove_gpu))
        .at("/api/v1/status", get(status))
        .data(state)
        .with(Tracing)
}

/// HTTP API server for GPU mount requests
pub struct ApiServer {
    state: Arc<ApiState>,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(state: Arc<ApiState>, listen_addr: String) -> Self {
        Self { state, listen_addr }
    }

    /// Serves until `shutdown_rx` fires.
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = routes(self.state);
        let server = Server::new(TcpListener::bind(&self.listen_addr));

        tokio::select! {
            result = server.run(app) => match result {
                Ok(()) => {
                    info!("API server stopped normally");
                    Ok(())
                }
                Err(e) => {
                    error!("API server failed: {e}");
                    Err(Report::new(ApiError::ServerError {
                        message: format!("Server failed: {e}"),
                    }))
                }
            },
            _ = &mut shutdown_rx => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}
