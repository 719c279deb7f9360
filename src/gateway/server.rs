//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::audit::{RequestLogger, spawn_retention_task};
use crate::config::Config;
use crate::relay::Relay;
use crate::store::{Catalog, MemoryStore, Store};
use crate::{Error, Result};

/// AccelMCP gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Catalog, grants, variables and connection logs
    store: Arc<dyn Store>,
}

impl Gateway {
    /// Create a gateway backed by the configured catalog file.
    ///
    /// Without a catalog the gateway starts empty and every request is
    /// answered with service-not-found.
    pub fn new(config: Config) -> Result<Self> {
        let store = match &config.catalog {
            Some(path) => {
                let store = MemoryStore::from_file(path)?;
                info!(catalog = %path.display(), "Loaded catalog");
                store
            }
            None => {
                warn!("No catalog configured - no MCP services will be reachable");
                MemoryStore::new(Catalog::default())?
            }
        };
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Create a gateway over an existing store.
    pub fn with_store(config: Config, store: Arc<dyn Store>) -> Self {
        Self { config, store }
    }

    /// Run until Ctrl-C or SIGTERM, then drain the connection logger.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let logger = Arc::new(RequestLogger::start(
            &self.config.logging,
            Arc::clone(&self.store),
        )?);
        let prune_task = self.config.logging.enabled.then(|| {
            spawn_retention_task(
                Arc::clone(&self.store),
                self.config.logging.retention,
                self.config.logging.prune_interval,
            )
        });

        let state = Arc::new(AppState {
            store: Arc::clone(&self.store),
            relay: Relay::new(self.config.relay.clone())?,
            logger: Arc::clone(&logger),
            server: self.config.server.clone(),
        });
        let app = create_router(state);

        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        info!("============================================================");
        info!(address = %local, "AccelMCP gateway listening");
        info!("  POST http://{local}/{{identifier}}/mcp            (aggregate)");
        info!("  POST http://{local}/{{identifier}}/apps/{{app}}/mcp (single app)");
        match &self.config.server.base_domain {
            Some(domain) => info!("  POST http://{{identifier}}.{domain}/mcp      (subdomain)"),
            None => info!("  Subdomain routing disabled (no server.base_domain)"),
        }
        if self.config.server.routing_fallback {
            info!("  POST http://{local}/mcp?service={{identifier}}  (fallback)");
        }
        if self.config.logging.enabled {
            info!(
                workers = self.config.logging.workers,
                retention_secs = self.config.logging.retention.as_secs(),
                "Connection logging enabled"
            );
        } else {
            warn!("Connection logging disabled");
        }
        info!("============================================================");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        if let Some(task) = prune_task {
            task.abort();
        }

        info!("Draining connection logs...");
        if tokio::time::timeout(self.config.server.shutdown_timeout, logger.shutdown())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = self.config.server.shutdown_timeout.as_secs(),
                "Connection log drain timed out"
            );
        }

        Ok(())
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_catalog_file_fails_construction() {
        let config = Config {
            catalog: Some("/nonexistent/catalog.yaml".into()),
            ..Config::default()
        };
        assert!(Gateway::new(config).is_err());
    }

    #[test]
    fn empty_gateway_without_catalog() {
        assert!(Gateway::new(Config::default()).is_ok());
    }

    #[tokio::test]
    async fn invalid_host_is_config_error() {
        let mut config = Config::default();
        config.server.host = "not a host".to_string();
        let gateway = Gateway::new(config).unwrap();
        assert!(matches!(gateway.run().await, Err(Error::Config(_))));
    }
}
