//! Relay listener
//!
//! Binds a TCP listener, upgrades every accepted connection to WebSocket and
//! hands it to [`handle_connection`]. The returned [`RelayServerHandle`] stops
//! the accept loop and closes live channels.

use super::events::RelayEvent;
use super::handler::handle_connection;
use super::registry::Relay;
use crate::config::RelayConfig;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// WebSocket relay server
pub struct RelayServer {
    config: RelayConfig,
    relay: Arc<Relay>,
}

impl RelayServer {
    /// Create a relay server without event forwarding
    pub fn new(config: RelayConfig) -> Result<Self> {
        Self::new_with_events(config, None)
    }

    /// Create a relay server with event forwarding
    ///
    /// When `event_tx` is provided, registrations, disconnects and forwards
    /// are reported through it.
    pub fn new_with_events(
        config: RelayConfig,
        event_tx: Option<mpsc::Sender<RelayEvent>>,
    ) -> Result<Self> {
        config.validate()?;
        let relay = Arc::new(Relay::new_with_events(config.clone(), event_tx));
        Ok(Self { config, relay })
    }

    /// Shared relay state
    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    /// Bind the listener and spawn the accept loop
    ///
    /// # Example
    ///
    /// ```
    /// use peerline_signaling::{RelayConfig, RelayServer};
    ///
    /// # tokio_test::block_on(async {
    /// let server = RelayServer::new(RelayConfig::ephemeral()).unwrap();
    /// let handle = server.start().await.unwrap();
    /// assert!(handle.url().starts_with("ws://127.0.0.1:"));
    /// handle.shutdown().await;
    /// # });
    /// ```
    pub async fn start(self) -> Result<RelayServerHandle> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!("Relay server listening on ws://{}", local_addr);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let conn_shutdown_tx = shutdown_tx.clone();
        let relay = Arc::clone(&self.relay);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let relay = Arc::clone(&relay);
                                let conn_shutdown_rx = conn_shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, relay, conn_shutdown_rx).await {
                                        error!("Relay connection error from {}: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept relay connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Relay server received shutdown signal");
                        break;
                    }
                }
            }

            info!("Relay server accept loop exited");
        });

        Ok(RelayServerHandle {
            local_addr,
            relay: self.relay,
            shutdown_tx,
            task: Some(task),
        })
    }
}

/// Handle for controlling a running relay server
pub struct RelayServerHandle {
    local_addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl RelayServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients connect to
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Shared relay state
    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    /// Stop accepting, close live channels and wait for the accept loop
    pub async fn shutdown(mut self) {
        info!("Sending shutdown signal to relay server");
        let _ = self.shutdown_tx.send(());

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Relay accept loop ended abnormally: {}", e);
            }
        }
    }
}
