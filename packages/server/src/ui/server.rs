//! TCP accept loop.

use std::{future::Future, io, net::SocketAddr, sync::Arc};

use thiserror::Error;
use tokio::net::TcpListener;

use crate::{
    config::ServerConfig,
    domain::{ChatStore, StoreError},
    usecase::{ChatContext, ManagerHandle, ServerManager},
};

use super::{session::serve_connection, signal::shutdown_signal};

/// Startup failures
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to load chats: {0}")]
    Store(#[from] StoreError),

    #[error("network error: {0}")]
    Io(#[from] io::Error),
}

/// Line-oriented chat server
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(SqliteChatStore::connect("sqlite://hiroba.db").await?);
/// let server = Server::bind(ServerConfig::default(), store).await?;
/// server.run().await?;
/// ```
pub struct Server {
    listener: TcpListener,
    manager: ManagerHandle,
    config: ServerConfig,
}

impl Server {
    /// Start the manager and room actors, then bind the listener
    pub async fn bind(config: ServerConfig, store: Arc<dyn ChatStore>) -> Result<Self, ServerError> {
        let ctx = ChatContext::new(store).with_history_limit(config.history_limit);
        let (manager, _task) = ServerManager::start(ctx).await?;

        let listener = TcpListener::bind(config.bind_addr()).await?;
        tracing::info!("Chat server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            manager,
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until Ctrl+C
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Press Ctrl+C to shutdown gracefully");
        self.run_until(shutdown_signal()).await
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        tracing::info!("Accepted connection from {}", peer);
                        if let Err(e) = socket.set_nodelay(true) {
                            tracing::debug!("Failed to set TCP_NODELAY: {}", e);
                        }
                        tokio::spawn(serve_connection(
                            socket,
                            self.manager.clone(),
                            self.config.outbox_capacity,
                        ));
                    }
                    Err(e) => tracing::warn!("Failed to accept connection: {}", e),
                },
            }
        }
        tracing::info!("Server shutdown complete");
        Ok(())
    }
}
