//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::admission::router;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::PolicyRegistry;

/// HTTP server for the admission service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Limiters served by this instance
    registry: Arc<PolicyRegistry>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, registry: Arc<PolicyRegistry>) -> Self {
        Self { addr, registry }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TurnstileError::Io(e)
        })?;

        info!(
            addr = %listener.local_addr()?,
            "Starting HTTP admission server with graceful shutdown"
        );

        let app = router(self.registry).into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                TurnstileError::Io(e)
            })
    }
}
