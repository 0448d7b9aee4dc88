//! Registry of live connections
//!
//! Fed by [`ConnectionEvent`]s so the owning process can observe which
//! identities are connected and how their channels ended.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;

use sshd_core::KeyIdentity;

use crate::channel::ChannelOutcome;
use crate::server::ConnectionEvent;

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What the registry knows about one connection
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    /// Set once the connection authenticated
    pub key_id: Option<KeyIdentity>,
    /// Client identification string, known once authenticated
    pub client_version: Option<String>,
    pub connected_at: Instant,
    /// Channels whose work finished on this connection
    pub channels_finished: u64,
    pub last_outcome: Option<ChannelOutcome>,
}

/// Totals across all connections seen so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub active: usize,
    pub total_connections: u64,
    pub channels_succeeded: u64,
    pub channels_failed: u64,
}

/// Live connections indexed by id
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionRecord>,
    total_connections: AtomicU64,
    channels_succeeded: AtomicU64,
    channels_failed: AtomicU64,
}

impl ConnectionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the registry
    pub fn apply(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { conn_id, peer_addr } => {
                self.total_connections.fetch_add(1, Ordering::Relaxed);
                self.connections.insert(
                    *conn_id,
                    ConnectionRecord {
                        id: *conn_id,
                        peer_addr: *peer_addr,
                        key_id: None,
                        client_version: None,
                        connected_at: Instant::now(),
                        channels_finished: 0,
                        last_outcome: None,
                    },
                );
            }
            ConnectionEvent::Authenticated {
                conn_id,
                key_id,
                client_version,
            } => {
                if let Some(mut record) = self.connections.get_mut(conn_id) {
                    record.key_id = Some(key_id.clone());
                    record.client_version = Some(client_version.clone());
                }
            }
            ConnectionEvent::ChannelFinished { conn_id, outcome, .. } => {
                if outcome.is_success() {
                    self.channels_succeeded.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.channels_failed.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(mut record) = self.connections.get_mut(conn_id) {
                    record.channels_finished += 1;
                    record.last_outcome = Some(outcome.clone());
                }
            }
            ConnectionEvent::Disconnected { conn_id } => {
                self.connections.remove(conn_id);
            }
        }
    }

    /// Get a connection by id
    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionRecord> {
        self.connections.get(id).map(|r| r.clone())
    }

    /// List all connections
    pub fn list(&self) -> Vec<ConnectionRecord> {
        self.connections.iter().map(|r| r.clone()).collect()
    }

    /// Connections authenticated as `key_id`
    pub fn by_identity(&self, key_id: &KeyIdentity) -> Vec<ConnectionRecord> {
        self.connections
            .iter()
            .filter(|r| r.key_id.as_ref() == Some(key_id))
            .map(|r| r.clone())
            .collect()
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if no connection is live
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active: self.connections.len(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            channels_succeeded: self.channels_succeeded.load(Ordering::Relaxed),
            channels_failed: self.channels_failed.load(Ordering::Relaxed),
        }
    }
}
