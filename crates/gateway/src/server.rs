//! gRPC server implementation with graceful shutdown
//!
//! On SIGTERM or Ctrl+C the server stops admitting new transfers and waits
//! up to `shutdown_grace` for in-flight ones before tonic closes connections.

use std::future::Future;
use std::net::SocketAddr;

use gateway_core::config::ServerSettings;
use gateway_core::{Error, Result};
use tokio::signal;
use tonic::transport::Server;
use tracing::{error, info};

use crate::proto::storage_v2_server::StorageV2Server;
use crate::service::StorageService;

/// Storage gateway gRPC server
pub struct GatewayServer {
    settings: ServerSettings,
    service: StorageService,
}

impl GatewayServer {
    /// Create a server with default settings
    pub fn new(service: StorageService) -> Self {
        Self::with_settings(service, ServerSettings::default())
    }

    /// Create with custom settings
    pub fn with_settings(service: StorageService, settings: ServerSettings) -> Self {
        Self { settings, service }
    }

    /// Address the server binds to
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.settings.bind_address, self.settings.port)
            .parse()
            .map_err(|e| Error::InvalidConfig {
                message: format!(
                    "invalid bind address {}:{}: {}",
                    self.settings.bind_address, self.settings.port, e
                ),
            })
    }

    /// Run the server until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the server until `signal` resolves, then drain sessions
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.addr()?;
        let sessions = self.service.sessions();
        let grace = self.settings.shutdown_grace;

        info!(address = %addr, "Starting storage gateway");

        let grpc_service = StorageV2Server::new(self.service)
            .max_decoding_message_size(self.settings.max_message_size)
            .max_encoding_message_size(self.settings.max_message_size);

        let mut server_builder =
            Server::builder().tcp_keepalive(Some(self.settings.tcp_keepalive));

        if let Some(timeout) = self.settings.request_timeout {
            server_builder = server_builder.timeout(timeout);
        }

        let shutdown = async move {
            signal.await;
            sessions.quiesce(grace).await;
        };

        let server = server_builder
            .add_service(grpc_service)
            .serve_with_shutdown(addr, shutdown);

        info!(address = %addr, "Storage gateway listening");

        server.await.map_err(|e| {
            error!(error = %e, "Server error");
            Error::Internal {
                message: format!("gRPC server failed: {}", e),
            }
        })?;

        info!("Storage gateway shutdown complete");
        Ok(())
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use storage::StoreBackend;

    fn service() -> StorageService {
        StorageService::new(Arc::new(StoreBackend::in_memory(None, 10)))
    }

    #[test]
    fn test_addr_from_settings() {
        let server = GatewayServer::new(service());
        assert_eq!(server.addr().unwrap(), "0.0.0.0:50051".parse().unwrap());

        let settings = ServerSettings {
            bind_address: "not an address".to_string(),
            ..Default::default()
        };
        let server = GatewayServer::with_settings(service(), settings);
        assert!(matches!(server.addr(), Err(Error::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_run_until_drains_sessions() {
        let service = service();
        let sessions = service.sessions();
        let settings = ServerSettings {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            shutdown_grace: Duration::from_millis(50),
            ..Default::default()
        };

        GatewayServer::with_settings(service, settings)
            .run_until(async {})
            .await
            .unwrap();

        assert!(!sessions.is_accepting());
    }
}
