//! HTTP server hosting the pairing routes.

use std::net::SocketAddr;

use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::ServerError;

/// Configuration for the HTTP server.
pub struct HttpServerConfig {
    /// Address to bind the server to.
    pub addr: SocketAddr,
}

/// Binds once, serves merged route fragments, shuts down gracefully.
pub struct HttpServer {
    config: HttpServerConfig,
    routes: Vec<Router>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HttpServer {
    pub fn new(config: HttpServerConfig) -> Self {
        Self {
            config,
            routes: Vec::new(),
            local_addr: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Accumulate a route fragment. Fragments carry their own state.
    pub fn add_routes(&mut self, router: Router) {
        self.routes.push(router);
    }

    /// Address actually bound, once started. Differs from the configured
    /// address when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener, merge all route fragments, and spawn the server.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        let mut app = Router::new();
        for fragment in self.routes.drain(..) {
            app = app.merge(fragment);
        }

        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| ServerError::StartupFailed {
                reason: format!("Failed to bind to {}: {}", self.config.addr, e),
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::StartupFailed {
                reason: format!("Failed to read bound address: {e}"),
            })?;

        tracing::info!(addr = %local_addr, "HTTP server listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("HTTP server shutting down");
                })
                .await
            {
                tracing::error!(error = %e, "HTTP server error");
            }
        });

        self.handle = Some(handle);
        Ok(local_addr)
    }

    /// Signal graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
