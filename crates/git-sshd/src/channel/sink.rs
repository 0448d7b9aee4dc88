//! Outbound side of a session channel

use async_trait::async_trait;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use thiserror::Error;

/// Extended data type code for stderr
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// The peer side of the channel is gone
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Channel is closed")]
pub struct ChannelClosed;

/// Where a channel's output goes
///
/// Every call after the session went away fails with [`ChannelClosed`].
#[async_trait]
pub trait ChannelSink: Send + Sync {
    /// Send regular channel data (stdout)
    async fn data(&self, data: &[u8]) -> Result<(), ChannelClosed>;

    /// Send extended channel data (stderr)
    async fn extended_data(&self, data: &[u8]) -> Result<(), ChannelClosed>;

    /// Report the exit status of the channel's process
    async fn exit_status(&self, status: u32) -> Result<(), ChannelClosed>;

    /// Signal end of output
    async fn eof(&self) -> Result<(), ChannelClosed>;

    /// Close the channel
    async fn close(&self) -> Result<(), ChannelClosed>;
}

/// Channel sink writing through a russh session handle
#[derive(Clone)]
pub struct SshChannel {
    handle: Handle,
    id: ChannelId,
}

impl SshChannel {
    /// Create a sink for `id` on the session behind `handle`
    pub fn new(handle: Handle, id: ChannelId) -> Self {
        Self { handle, id }
    }
}

#[async_trait]
impl ChannelSink for SshChannel {
    async fn data(&self, data: &[u8]) -> Result<(), ChannelClosed> {
        self.handle
            .data(self.id, CryptoVec::from_slice(data))
            .await
            .map_err(|_| ChannelClosed)
    }

    async fn extended_data(&self, data: &[u8]) -> Result<(), ChannelClosed> {
        self.handle
            .extended_data(self.id, SSH_EXTENDED_DATA_STDERR, CryptoVec::from_slice(data))
            .await
            .map_err(|_| ChannelClosed)
    }

    async fn exit_status(&self, status: u32) -> Result<(), ChannelClosed> {
        self.handle
            .exit_status_request(self.id, status)
            .await
            .map_err(|_| ChannelClosed)
    }

    async fn eof(&self) -> Result<(), ChannelClosed> {
        self.handle.eof(self.id).await.map_err(|_| ChannelClosed)
    }

    async fn close(&self) -> Result<(), ChannelClosed> {
        self.handle.close(self.id).await.map_err(|_| ChannelClosed)
    }
}
