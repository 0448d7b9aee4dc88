//! Shared daemon state

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use sshd_core::config::ServerConfig;
use sshd_core::error::ProcessError;

use crate::auth::Authenticator;
use crate::process::Credentials;
use crate::registry::ConnectionRegistry;

/// A held connection or process slot, released on drop
#[derive(Debug)]
pub struct Slot(#[allow(dead_code)] Option<OwnedSemaphorePermit>);

/// State shared by the listener and every connection handler
pub struct ServerState {
    /// Configuration
    pub config: ServerConfig,
    /// Public-key authenticator
    pub authenticator: Authenticator,
    /// Live connections
    pub registry: Arc<ConnectionRegistry>,
    /// Credentials applied to every spawned process
    pub credentials: Credentials,
    /// `env` names clients may set, shared by every channel
    pub accept_env: Arc<[String]>,
    connection_slots: Option<Arc<Semaphore>>,
    process_slots: Option<Arc<Semaphore>>,
}

impl ServerState {
    /// Create server state, sizing limits from the configuration
    pub fn new(config: ServerConfig, authenticator: Authenticator) -> Self {
        let semaphore = |limit: Option<u32>| limit.map(|n| Arc::new(Semaphore::new(n as usize)));

        Self {
            connection_slots: semaphore(config.max_connections),
            process_slots: semaphore(config.max_processes),
            accept_env: config.accept_env.iter().cloned().collect(),
            config,
            authenticator,
            registry: Arc::new(ConnectionRegistry::new()),
            credentials: Credentials::effective(),
        }
    }

    /// Take a connection slot, or `None` when the limit is reached
    pub fn try_acquire_connection(&self) -> Option<Slot> {
        acquire(&self.connection_slots)
    }

    /// Take a process slot
    pub fn try_acquire_process(&self) -> Result<Slot, ProcessError> {
        acquire(&self.process_slots).ok_or(ProcessError::LimitExceeded)
    }
}

fn acquire(slots: &Option<Arc<Semaphore>>) -> Option<Slot> {
    match slots {
        None => Some(Slot(None)),
        Some(semaphore) => Arc::clone(semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| Slot(Some(permit))),
    }
}
