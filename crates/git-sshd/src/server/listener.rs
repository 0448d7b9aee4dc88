//! SSH server listener
//!
//! Accepts incoming connections and spawns handlers for each client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::registry::ConnectionId;
use crate::server::handler::ClientHandler;
use crate::server::ConnectionEvent;
use crate::state::ServerState;

/// SSH server that listens for incoming connections
pub struct SshServer {
    /// russh server configuration
    ssh_config: Arc<russh::server::Config>,
    /// Shared server state
    state: Arc<ServerState>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
    /// Event sender for connection events
    event_tx: mpsc::Sender<ConnectionEvent>,
    next_conn_id: AtomicU64,
}

impl SshServer {
    /// Create a new SSH server
    pub fn new(
        ssh_config: Arc<russh::server::Config>,
        state: Arc<ServerState>,
        cancel: CancellationToken,
        event_tx: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            ssh_config,
            state,
            cancel,
            event_tx,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Bind `bind_addr` and serve until shutdown
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;

        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("SSH server listening on {}", local_addr);

        loop {
            tokio::select! {
                // Check for shutdown
                _ = self.cancel.cancelled() => {
                    tracing::info!("SSH server shutting down");
                    break;
                }

                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a new incoming connection
    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let Some(slot) = self.state.try_acquire_connection() else {
            tracing::warn!("Connection limit reached, dropping connection from {}", peer_addr);
            return;
        };

        let conn_id = ConnectionId::new(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        tracing::info!("New connection {} from {}", conn_id, peer_addr);

        let config = Arc::clone(&self.ssh_config);
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let cancel = self.cancel.child_token();

        // Spawn a task to handle this connection
        tokio::spawn(async move {
            let _slot = slot;
            let _ = event_tx
                .send(ConnectionEvent::Connected { conn_id, peer_addr })
                .await;

            let handler =
                ClientHandler::new(state, conn_id, peer_addr, event_tx.clone(), cancel.clone());

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Connection handler cancelled for {}", peer_addr);
                    Ok(())
                }
                result = serve_connection(config, socket, handler) => result,
            };

            match result {
                Ok(()) => {
                    tracing::info!("Connection {} from {} closed", conn_id, peer_addr);
                }
                Err(e) => {
                    tracing::warn!(
                        "Connection {} from {} closed with error: {}",
                        conn_id,
                        peer_addr,
                        e
                    );
                }
            }

            cancel.cancel();
            let _ = event_tx.send(ConnectionEvent::Disconnected { conn_id }).await;
        });
    }
}

/// Run the SSH protocol on one socket until the session ends
async fn serve_connection(
    config: Arc<russh::server::Config>,
    socket: TcpStream,
    handler: ClientHandler,
) -> Result<()> {
    let session = russh::server::run_stream(config, socket, handler).await?;
    session.await
}
