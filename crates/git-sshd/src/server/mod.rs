//! SSH server implementation

mod handler;
mod host_key;
mod listener;
mod transport;

pub use handler::ClientHandler;
pub use host_key::load_or_generate_host_key;
pub use listener::SshServer;
pub use transport::build_ssh_config;

use std::net::SocketAddr;

use sshd_core::KeyIdentity;

use crate::channel::ChannelOutcome;
use crate::registry::ConnectionId;

/// Events emitted by connection handlers
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A TCP connection was accepted
    Connected {
        conn_id: ConnectionId,
        peer_addr: SocketAddr,
    },
    /// The connection authenticated as an identity
    Authenticated {
        conn_id: ConnectionId,
        key_id: KeyIdentity,
        /// Identification string the client sent, e.g. `SSH-2.0-OpenSSH_9.6`
        client_version: String,
    },
    /// A channel's dispatched work finished
    ChannelFinished {
        conn_id: ConnectionId,
        outcome: ChannelOutcome,
    },
    /// The connection is gone
    Disconnected { conn_id: ConnectionId },
}
