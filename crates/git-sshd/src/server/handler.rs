//! SSH client handler implementation
//!
//! Implements the russh server handler for one git client connection:
//! public-key authentication, session channels and their `env`/`exec`
//! requests, and the relay of channel input to dispatched work.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sshd_core::KeyIdentity;

use crate::channel::{
    ChannelOutcome, ChannelRequest, ChannelSession, ChannelState, Dispatch, RequestOutcome,
    SshChannel, UploadTarget,
};
use crate::process::ProcessHandle;
use crate::registry::ConnectionId;
use crate::server::ConnectionEvent;
use crate::state::ServerState;

/// Buffered input chunks per channel
const CHANNEL_INPUT_CAPACITY: usize = 256;

/// Per-channel bookkeeping held by the connection
struct ChannelEntry {
    session: ChannelSession,
    /// Dropped on client EOF
    input_tx: Option<mpsc::Sender<Bytes>>,
    /// Taken by the dispatched work
    input_rx: Option<mpsc::Receiver<Bytes>>,
    cancel: CancellationToken,
}

/// Handler for a single SSH client connection
pub struct ClientHandler {
    /// Shared server state
    state: Arc<ServerState>,
    conn_id: ConnectionId,
    /// Peer address of the connecting client
    peer_addr: SocketAddr,
    /// Identity resolved at authentication
    key_id: Option<KeyIdentity>,
    /// Open session channels
    channels: HashMap<ChannelId, ChannelEntry>,
    /// Sender to notify the server of events
    event_tx: mpsc::Sender<ConnectionEvent>,
    /// Cancelled when the connection goes away; parent of every channel token
    cancel: CancellationToken,
}

impl ClientHandler {
    /// Create a new client handler with an external cancellation token
    pub fn new(
        state: Arc<ServerState>,
        conn_id: ConnectionId,
        peer_addr: SocketAddr,
        event_tx: mpsc::Sender<ConnectionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            conn_id,
            peer_addr,
            key_id: None,
            channels: HashMap::new(),
            event_tx,
            cancel,
        }
    }

    async fn report(&self, outcome: ChannelOutcome) {
        let _ = self
            .event_tx
            .send(ConnectionEvent::ChannelFinished {
                conn_id: self.conn_id,
                outcome,
            })
            .await;
    }

    /// Run a channel's work in its own task and report how it ended
    fn spawn_channel_task<F>(&self, channel: ChannelId, work: F)
    where
        F: Future<Output = ChannelOutcome> + Send + 'static,
    {
        let conn_id = self.conn_id;
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let outcome = work.await;
            tracing::debug!("{} channel {:?} finished: {}", conn_id, channel, outcome);
            let _ = event_tx
                .send(ConnectionEvent::ChannelFinished { conn_id, outcome })
                .await;
        });
    }

    /// Refuse an exec request that was accepted by the state machine
    async fn refuse(&self, channel: ChannelId, session: &mut Session, outcome: ChannelOutcome) {
        let _ = session.channel_failure(channel);
        let _ = session.close(channel);
        self.report(outcome).await;
    }

    /// Start the work planned for an exec request
    async fn dispatch(&mut self, channel: ChannelId, dispatch: Dispatch, session: &mut Session) {
        let Some(entry) = self.channels.get_mut(&channel) else {
            return;
        };
        let cancel = entry.cancel.clone();
        let Some(input) = entry.input_rx.take() else {
            tracing::error!("Channel {:?} input already taken", channel);
            return;
        };
        let sink = SshChannel::new(session.handle(), channel);

        match dispatch {
            Dispatch::Upload { path } => {
                let target = match UploadTarget::create(&path).await {
                    Ok(target) => target,
                    Err(e) => {
                        tracing::error!("Failed to open upload target {:?}: {}", path, e);
                        let reason = format!("upload to {}: {}", path.display(), e);
                        self.refuse(channel, session, ChannelOutcome::Failed { reason })
                            .await;
                        return;
                    }
                };

                tracing::info!("Receiving upload into {:?} for {}", target.path(), self.conn_id);
                let _ = session.channel_success(channel);
                self.spawn_channel_task(channel, async move {
                    target.receive(input, &sink, cancel).await
                });
            }

            Dispatch::Spawn(spec) => {
                let slot = match self.state.try_acquire_process() {
                    Ok(slot) => slot,
                    Err(e) => {
                        tracing::warn!("Refusing exec from {}: {}", self.peer_addr, e);
                        let reason = e.to_string();
                        self.refuse(channel, session, ChannelOutcome::Rejected { reason })
                            .await;
                        return;
                    }
                };

                let process = match ProcessHandle::spawn(&spec, self.state.credentials) {
                    Ok(process) => process,
                    Err(e) => {
                        tracing::error!("Failed to start process for {}: {}", self.peer_addr, e);
                        let reason = e.to_string();
                        self.refuse(channel, session, ChannelOutcome::Failed { reason })
                            .await;
                        return;
                    }
                };

                tracing::info!(
                    "Started {:?} (pid {:?}) for {}",
                    spec.program,
                    process.id(),
                    self.conn_id
                );

                let _ = session.channel_success(channel);
                let timeout = self.state.config.exec_timeout;
                self.spawn_channel_task(channel, async move {
                    let outcome = process.supervise(&sink, input, cancel, timeout).await;
                    drop(slot);
                    outcome
                });
            }
        }
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        // Kills every process still running for this connection
        self.cancel.cancel();
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = anyhow::Error;

    /// Handle public key authentication
    ///
    /// The key must resolve to an identity; any lookup failure rejects the
    /// attempt.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint();

        tracing::debug!(
            "Auth attempt from {} ({}), key fingerprint: {}",
            self.peer_addr,
            user,
            fingerprint
        );

        let key_id = match self.state.authenticator.authenticate(public_key).await {
            Ok(permissions) => permissions.key_id(),
            Err(e) => {
                tracing::warn!("Authentication rejected for {}: {}", self.peer_addr, e);
                None
            }
        };

        let Some(key_id) = key_id else {
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        };

        tracing::info!("{} authenticated as key-{} ({})", self.peer_addr, key_id, fingerprint);
        self.key_id = Some(key_id);

        Ok(Auth::Accept)
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        let Some(key_id) = self.key_id.clone() else {
            return Ok(());
        };
        let client_version = String::from_utf8_lossy(session.remote_sshid()).into_owned();
        tracing::debug!("{} client version: {}", self.conn_id, client_version);

        let _ = self
            .event_tx
            .send(ConnectionEvent::Authenticated {
                conn_id: self.conn_id,
                key_id,
                client_version,
            })
            .await;

        Ok(())
    }

    /// Handle channel open request
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(key_id) = self.key_id.clone() else {
            tracing::warn!("Refusing channel from unauthenticated {}", self.peer_addr);
            return Ok(false);
        };

        let channel_id = channel.id();
        tracing::debug!("Channel opened: {:?}", channel_id);

        let (input_tx, input_rx) = mpsc::channel(CHANNEL_INPUT_CAPACITY);
        self.channels.insert(
            channel_id,
            ChannelEntry {
                session: ChannelSession::new(
                    key_id,
                    self.state.config.dispatch.clone(),
                    Arc::clone(&self.state.accept_env),
                ),
                input_tx: Some(input_tx),
                input_rx: Some(input_rx),
                cancel: self.cancel.child_token(),
            },
        );

        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(entry) = self.channels.get_mut(&channel) {
            entry
                .session
                .handle(ChannelRequest::Env {
                    name: variable_name,
                    value: variable_value,
                })
                .await;
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(entry) = self.channels.get_mut(&channel) else {
            tracing::warn!("Exec request on unknown channel {:?}", channel);
            return Ok(());
        };

        let outcome = entry.session.handle(ChannelRequest::Exec { command: data }).await;
        match outcome {
            RequestOutcome::Dispatch(dispatch) => {
                self.dispatch(channel, dispatch, session).await;
            }
            RequestOutcome::Abort(e) => {
                tracing::error!("Aborting channel {:?} from {}: {}", channel, self.peer_addr, e);
                let _ = session.close(channel);
                self.report(ChannelOutcome::Rejected {
                    reason: e.to_string(),
                })
                .await;
            }
            RequestOutcome::Ignored | RequestOutcome::EnvRecorded => {}
        }

        Ok(())
    }

    /// Handle incoming data on a channel
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(entry) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        let Some(tx) = entry.input_tx.as_ref() else {
            tracing::trace!("Dropping {} bytes after EOF on {:?}", data.len(), channel);
            return Ok(());
        };

        let chunk = Bytes::copy_from_slice(data);
        match entry.session.state() {
            // Buffered until the exec request arrives
            ChannelState::Open => {
                if tx.try_send(chunk).is_err() {
                    tracing::warn!("Input buffer full on {:?} before exec, dropping data", channel);
                }
            }
            ChannelState::Dispatched => {
                if tx.send(chunk).await.is_err() {
                    // The work is done with its input
                    entry.input_tx = None;
                }
            }
            ChannelState::Closed => {}
        }

        Ok(())
    }

    /// Handle channel EOF
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel EOF: {:?}", channel);
        if let Some(entry) = self.channels.get_mut(&channel) {
            entry.input_tx = None;
        }
        Ok(())
    }

    /// Handle channel close
    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel closed: {:?}", channel);
        if let Some(entry) = self.channels.remove(&channel) {
            entry.cancel.cancel();
        }
        Ok(())
    }

    /// Out-of-band forwarding requests are never served
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "Rejecting tcpip-forward {}:{} from {}",
            address,
            port,
            self.peer_addr
        );
        Ok(false)
    }
}
