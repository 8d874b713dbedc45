//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::service::FleetService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5600,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `DBFLEET_HTTP_HOST` and `DBFLEET_HTTP_PORT`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("DBFLEET_HTTP_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("DBFLEET_HTTP_PORT") {
            match port.parse() {
                Ok(port) => config.port = port,
                Err(_) => {
                    tracing::warn!(value = %port, "ignoring unparseable DBFLEET_HTTP_PORT")
                }
            }
        }
        config
    }
}

/// Start the HTTP server. On shutdown (SIGINT, SIGTERM or the /shutdown
/// endpoint) every live instance is torn down before returning; queued
/// requests are dropped.
pub async fn serve(config: ServerConfig, service: Arc<FleetService>) -> anyhow::Result<()> {
    let shutdown_rx = service.shutdown_rx();
    let app = routes(Arc::clone(&service));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("starting dbfleet server on {}", actual_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_rx))
        .await?;

    info!("server shutdown complete, cleaning up fleet");
    service.shutdown_all().await;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM, SIGINT, or the /shutdown endpoint).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when
/// the tokio runtime is not properly initialized. That is an unrecoverable
/// configuration error and should fail fast at startup.
async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let explicit_shutdown = async {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("received SIGTERM, shutting down...");
        }
        _ = explicit_shutdown => {
            info!("shutdown requested via /shutdown endpoint...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5600);
    }
}
