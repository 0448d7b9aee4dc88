//! Per-channel request handling
//!
//! Every session channel owns a [`ChannelSession`], a small state machine fed
//! with the channel's requests in arrival order. It records `env` pairs,
//! turns the single `exec` request into a [`Dispatch`] plan and ignores
//! everything that arrives once the channel has been served.

mod sink;
mod upload;

pub use sink::{ChannelClosed, ChannelSink, SshChannel};
pub use upload::UploadTarget;

#[cfg(test)]
pub(crate) use sink::testing;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use sshd_core::config::DispatchMode;
use sshd_core::error::CommandError;
use sshd_core::KeyIdentity;

use crate::command::{resolve_executable, CommandLine};
use crate::process::ProcessSpec;

/// Environment variable carrying the client's command in `serv` dispatch
pub const ORIGINAL_COMMAND_ENV: &str = "SSH_ORIGINAL_COMMAND";

/// A typed request received on a session channel
#[derive(Debug, Clone, Copy)]
pub enum ChannelRequest<'a> {
    /// `env` request
    Env { name: &'a str, value: &'a str },
    /// `exec` request with its raw command-line payload
    Exec { command: &'a [u8] },
    /// Any other request kind
    Other(&'a str),
}

/// Lifecycle of a channel's request loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Accepting requests
    Open,
    /// The exec request was dispatched; the channel closes when it finishes
    Dispatched,
    /// The exec request was aborted before anything ran
    Closed,
}

/// What the connection handler has to do with a request
#[derive(Debug)]
pub enum RequestOutcome {
    /// Nothing to do
    Ignored,
    /// An environment pair was recorded for the future process
    EnvRecorded,
    /// Run the planned work
    Dispatch(Dispatch),
    /// Abort the channel without running anything
    Abort(CommandError),
}

/// Work planned for an exec request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// `cat <path>`: copy channel input into a file
    Upload { path: PathBuf },
    /// Spawn a supervised process
    Spawn(ProcessSpec),
}

/// Why a process was stopped before it exited on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// The configured exec timeout elapsed
    TimedOut,
    /// The channel or connection went away
    Cancelled,
}

/// Final result of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// A process ran to completion with this exit status
    Exited { status: u32 },
    /// The upload fast path stored this many bytes
    Uploaded { bytes: u64 },
    /// A process was killed; `status` is what the client was told, if anything
    Killed { reason: KillReason, status: Option<u32> },
    /// Nothing ran because the request was refused
    Rejected { reason: String },
    /// Starting or supervising the work failed
    Failed { reason: String },
}

impl ChannelOutcome {
    /// Whether the channel's work completed without error
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ChannelOutcome::Exited { status: 0 } | ChannelOutcome::Uploaded { .. }
        )
    }
}

impl fmt::Display for ChannelOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelOutcome::Exited { status } => write!(f, "exited with status {}", status),
            ChannelOutcome::Uploaded { bytes } => write!(f, "uploaded {} bytes", bytes),
            ChannelOutcome::Killed { reason, .. } => write!(f, "killed ({:?})", reason),
            ChannelOutcome::Rejected { reason } => write!(f, "rejected: {}", reason),
            ChannelOutcome::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Request state machine for one session channel
#[derive(Debug)]
pub struct ChannelSession {
    key_id: KeyIdentity,
    dispatch_mode: DispatchMode,
    /// Variable names a client may set with `env`
    accept_env: Arc<[String]>,
    state: ChannelState,
    env: Vec<(String, String)>,
}

impl ChannelSession {
    /// Create a channel session for an authenticated identity
    pub fn new(key_id: KeyIdentity, dispatch_mode: DispatchMode, accept_env: Arc<[String]>) -> Self {
        Self {
            key_id,
            dispatch_mode,
            accept_env,
            state: ChannelState::Open,
            env: Vec::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Environment recorded so far
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Feed the next request
    pub async fn handle(&mut self, request: ChannelRequest<'_>) -> RequestOutcome {
        if self.state != ChannelState::Open {
            tracing::debug!("Ignoring {:?} on a channel that was already served", request);
            return RequestOutcome::Ignored;
        }

        match request {
            ChannelRequest::Env { name, value } => {
                if name.is_empty() || value.is_empty() {
                    tracing::warn!("Invalid env arguments: name={:?} value={:?}", name, value);
                    return RequestOutcome::Ignored;
                }
                if !self.accept_env.iter().any(|accepted| accepted == name) {
                    tracing::debug!("Ignoring env {} not listed in accept_env", name);
                    return RequestOutcome::Ignored;
                }
                self.env.push((name.to_string(), value.to_string()));
                RequestOutcome::EnvRecorded
            }
            ChannelRequest::Exec { command } => match self.plan(command).await {
                Ok(dispatch) => {
                    self.state = ChannelState::Dispatched;
                    RequestOutcome::Dispatch(dispatch)
                }
                Err(e) => {
                    self.state = ChannelState::Closed;
                    RequestOutcome::Abort(e)
                }
            },
            ChannelRequest::Other(kind) => {
                tracing::trace!("Ignoring {} request", kind);
                RequestOutcome::Ignored
            }
        }
    }

    async fn plan(&self, payload: &[u8]) -> Result<Dispatch, CommandError> {
        let command = CommandLine::from_bytes(payload)?;
        tracing::info!("Exec payload for key-{}: {}", self.key_id, command);

        if command.is_upload() {
            let path = command.args().first().ok_or(CommandError::MissingUploadPath)?;
            return Ok(Dispatch::Upload {
                path: PathBuf::from(path),
            });
        }

        let spec = match &self.dispatch_mode {
            DispatchMode::Direct => ProcessSpec {
                program: resolve_executable(command.program()).await?,
                args: command.args().to_vec(),
                env: self.env.clone(),
            },
            DispatchMode::Serv { program, config } => {
                let mut env = self.env.clone();
                env.push((ORIGINAL_COMMAND_ENV.to_string(), command.to_string()));
                ProcessSpec {
                    program: resolve_executable(program).await?,
                    args: vec![
                        "serv".to_string(),
                        format!("key-{}", self.key_id),
                        format!("--config={}", config.display()),
                    ],
                    env,
                }
            }
        };

        Ok(Dispatch::Spawn(spec))
    }
}
