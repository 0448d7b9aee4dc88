//! `cat <path>` upload fast path
//!
//! Channel input is written straight to the destination file without
//! spawning anything. The client gets EOF and close once its own EOF has
//! been consumed, but no exit status.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ChannelOutcome, ChannelSink, KillReason};

/// An opened upload destination
#[derive(Debug)]
pub struct UploadTarget {
    path: PathBuf,
    file: File,
}

impl UploadTarget {
    /// Create (or truncate) the destination file
    pub async fn create(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path).await?;
        tracing::debug!("Upload target opened: {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Destination path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy channel input into the file until the client sends EOF
    ///
    /// Cancellation stops the channel from taking new input, but chunks it
    /// already received are still written before returning.
    pub async fn receive(
        mut self,
        mut input: mpsc::Receiver<Bytes>,
        sink: &dyn ChannelSink,
        cancel: CancellationToken,
    ) -> ChannelOutcome {
        let mut bytes = 0u64;
        let mut cancelled = false;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancelled => {
                    input.close();
                    cancelled = true;
                    continue;
                }
                chunk = input.recv() => chunk,
            };

            let Some(chunk) = chunk else { break };

            if let Err(e) = self.file.write_all(&chunk).await {
                tracing::error!("Failed to write upload to {:?}: {}", self.path, e);
                let _ = sink.close().await;
                return ChannelOutcome::Failed {
                    reason: e.to_string(),
                };
            }
            bytes += chunk.len() as u64;
        }

        if let Err(e) = self.file.flush().await {
            tracing::error!("Failed to flush upload to {:?}: {}", self.path, e);
            let _ = sink.close().await;
            return ChannelOutcome::Failed {
                reason: e.to_string(),
            };
        }

        if cancelled {
            tracing::debug!("Upload to {:?} cancelled after {} bytes", self.path, bytes);
            return ChannelOutcome::Killed {
                reason: KillReason::Cancelled,
                status: None,
            };
        }

        tracing::info!("Uploaded {} bytes to {:?}", bytes, self.path);

        let _ = sink.eof().await;
        let _ = sink.close().await;

        ChannelOutcome::Uploaded { bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{MemorySink, SinkEvent};

    #[tokio::test]
    async fn test_upload_writes_input_until_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        std::fs::write(&path, "previous content that is longer").unwrap();

        let target = UploadTarget::create(&path).await.unwrap();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Bytes::from_static(b"hello ")).await.unwrap();
        tx.send(Bytes::from_static(b"world")).await.unwrap();
        drop(tx);

        let sink = MemorySink::new();
        let outcome = target.receive(rx, &sink, CancellationToken::new()).await;

        assert_eq!(outcome, ChannelOutcome::Uploaded { bytes: 11 });
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        // No exit status on the upload path
        assert_eq!(sink.events(), [SinkEvent::Eof, SinkEvent::Close]);
    }

    #[tokio::test]
    async fn test_upload_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let target = UploadTarget::create(&dir.path().join("out")).await.unwrap();
        let (_tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let sink = MemorySink::new();
        let outcome = target.receive(rx, &sink, cancel).await;

        assert!(matches!(
            outcome,
            ChannelOutcome::Killed { reason: KillReason::Cancelled, status: None }
        ));
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_keeps_received_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");

        for _ in 0..20 {
            let target = UploadTarget::create(&path).await.unwrap();
            let (tx, rx) = mpsc::channel(4);
            tx.send(Bytes::from_static(b"hello")).await.unwrap();
            tx.send(Bytes::from_static(b" again")).await.unwrap();
            drop(tx);

            let cancel = CancellationToken::new();
            cancel.cancel();

            let sink = MemorySink::new();
            let outcome = target.receive(rx, &sink, cancel).await;

            assert!(matches!(
                outcome,
                ChannelOutcome::Killed { reason: KillReason::Cancelled, status: None }
            ));
            assert_eq!(std::fs::read(&path).unwrap(), b"hello again");
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_taking_new_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let target = UploadTarget::create(&path).await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(Bytes::from_static(b"kept")).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let sink = MemorySink::new();
        target.receive(rx, &sink, cancel).await;

        // The sender is still alive but the input was closed
        assert!(tx.send(Bytes::from_static(b"late")).await.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"kept");
    }

    #[tokio::test]
    async fn test_create_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(UploadTarget::create(&dir.path().join("missing/out")).await.is_err());
    }
}
