pub mod artifacts;
pub mod convert;
pub mod logs;
pub mod service;

pub use service::{AgentRpcService, CLIENT_SECRET_METADATA, TASK_ID_METADATA};

use localci_proto::agent::agent_service_server::AgentServiceServer;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::transport::Server;

use crate::build::Build;
use crate::config::EngineConfig;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RpcOptions {
    pub listen_address: String,
    /// Host name under which containers reach this machine.
    pub container_host_alias: String,
    pub shutdown_grace: Duration,
    pub artifacts_dir: Option<PathBuf>,
    pub logs_dir: Option<PathBuf>,
    /// Overrides merged last into every task's environment.
    pub environment: HashMap<String, String>,
    pub dirty_mode: bool,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl RpcOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            listen_address: config.rpc.listen_address.clone(),
            container_host_alias: config.rpc.container_host_alias.clone(),
            shutdown_grace: config.rpc.shutdown_grace(),
            artifacts_dir: config.artifacts_dir.clone(),
            logs_dir: config.logs_dir.clone(),
            environment: config.environment.clone(),
            dirty_mode: config.dirty_mode,
        }
    }
}

/// gRPC server the agents of one build connect back to.
///
/// The secrets are generated per server, so every build gets its own pair.
pub struct RpcServer {
    local_addr: SocketAddr,
    container_host_alias: String,
    shutdown_grace: Duration,
    server_secret: String,
    client_secret: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<std::result::Result<(), tonic::transport::Error>>>,
}

impl RpcServer {
    pub async fn start(build: Arc<Build>, options: RpcOptions) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(&options.listen_address).await?;
        let local_addr = listener.local_addr()?;

        let server_secret = uuid::Uuid::new_v4().to_string();
        let client_secret = uuid::Uuid::new_v4().to_string();

        let container_host_alias = options.container_host_alias.clone();
        let shutdown_grace = options.shutdown_grace;
        let service = AgentRpcService::new(
            build,
            server_secret.clone(),
            client_secret.clone(),
            Arc::new(options),
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(
            Server::builder()
                .add_service(AgentServiceServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::TcpListenerStream::new(listener),
                    async {
                        let _ = shutdown_rx.await;
                    },
                ),
        );

        tracing::info!("RPC server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            container_host_alias,
            shutdown_grace,
            server_secret,
            client_secret,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Endpoint for agents running inside containers.
    pub fn container_endpoint(&self) -> String {
        format!("{}:{}", self.container_host_alias, self.local_addr.port())
    }

    /// Endpoint for agents running as processes on this host.
    pub fn direct_endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.local_addr.port())
    }

    pub fn server_secret(&self) -> &str {
        &self.server_secret
    }

    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Stops accepting calls and waits for in-flight ones, at most for the
    /// shutdown grace period. Calling it again is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        match tokio::time::timeout(self.shutdown_grace, &mut handle).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => tracing::warn!("RPC server task failed: {}", e),
            Err(_) => {
                tracing::warn!(
                    "RPC server did not drain within {:?}, aborting",
                    self.shutdown_grace
                );
                handle.abort();
                let _ = handle.await;
            }
        }

        tracing::debug!("RPC server on {} stopped", self.local_addr);
        Ok(())
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let mut config = EngineConfig::default();
        config.dirty_mode = true;
        config.environment.insert("FOO".to_string(), "bar".to_string());

        let options = RpcOptions::from_config(&config);
        assert!(options.dirty_mode);
        assert_eq!(options.listen_address, "0.0.0.0:0");
        assert_eq!(options.shutdown_grace, Duration::from_secs(5));
        assert_eq!(options.environment.get("FOO").map(String::as_str), Some("bar"));
    }
}
