//! HTTP server implementation.

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::Result;

/// HTTP server for the rate limited routes.
pub struct HttpServer {
    /// Bound listener
    listener: TcpListener,
    /// Routes to serve
    app: Router,
}

impl HttpServer {
    /// Bind the server to `addr`.
    pub async fn bind(addr: SocketAddr, app: Router) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, app })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the process is stopped.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serve with graceful shutdown.
    ///
    /// The server stops accepting connections when the provided signal
    /// resolves and returns once in-flight requests finish.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Starting HTTP server");

        // peer addresses feed client IP extraction
        let service = self.app.into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(self.listener, service)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}
