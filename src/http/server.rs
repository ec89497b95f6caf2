//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{admit, Admission};
use crate::error::{Result, TurnstileError};

/// An HTTP listener serving one router.
pub struct HttpServer {
    /// Name used in logs
    name: &'static str,
    /// Address to bind to
    addr: SocketAddr,
    /// Routes to serve
    router: Router,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(name: &'static str, addr: SocketAddr, router: Router) -> Self {
        Self { name, addr, router }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server stops accepting connections when the provided signal
    /// resolves and returns once in-flight requests have completed. Peer
    /// addresses are made available to the admission middleware.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(server = self.name, addr = %self.addr, error = %e, "Failed to bind");
            TurnstileError::Io(e)
        })?;

        info!(server = self.name, addr = %self.addr, "Starting HTTP server");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(server = self.name, error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })?;

        info!(server = self.name, "HTTP server stopped");
        Ok(())
    }
}

/// The rate limited application: every route sits behind [`admit`].
pub fn application_router(admission: Admission) -> Router {
    Router::new()
        .route("/", get(hello))
        .fallback(hello)
        .layer(axum::middleware::from_fn_with_state(admission, admit))
}

async fn hello() -> &'static str {
    "Hello, World!"
}
