//! Spawning and supervising a channel's process

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sshd_core::error::ProcessError;

use super::{Credentials, ProcessSpec};
use crate::channel::{ChannelOutcome, ChannelSink, KillReason};

/// Read buffer size for output relays
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Which channel stream an output relay feeds
#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Map a process exit status to the value reported to the client
///
/// Signal deaths are reported as `128 + signal`.
pub fn exit_code(status: ExitStatus) -> u32 {
    if let Some(code) = status.code() {
        return code.try_into().unwrap_or(1);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal as u32;
        }
    }

    1
}

/// A running process bound to one channel
#[derive(Debug)]
pub struct ProcessHandle {
    program: String,
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

impl ProcessHandle {
    /// Start `spec` with all three stdio streams piped
    pub fn spawn(spec: &ProcessSpec, creds: Credentials) -> Result<Self, ProcessError> {
        let program = spec.program.display().to_string();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            // Own process group so a kill reaches anything the program forks
            command.uid(creds.uid).gid(creds.gid).process_group(0);
        }
        #[cfg(not(unix))]
        let _ = creds;

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or(ProcessError::Pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(ProcessError::Pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ProcessError::Pipe("stderr"))?;

        tracing::debug!("Spawned {} (pid {:?})", program, child.id());

        Ok(Self {
            program,
            child,
            stdin,
            stdout,
            stderr,
        })
    }

    /// OS process id, while the process is running
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Relay stdio until the process exits, then report and close the channel
    ///
    /// `input` carries the channel's inbound data; dropping its sender closes
    /// the process's stdin. The process is killed when `cancel` fires or
    /// `timeout` elapses.
    pub async fn supervise(
        self,
        sink: &dyn ChannelSink,
        input: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> ChannelOutcome {
        let Self {
            program,
            mut child,
            stdin,
            stdout,
            stderr,
        } = self;

        let stdin_task = tokio::spawn(feed_stdin(stdin, input));

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let wait = async {
            tokio::select! {
                status = child.wait() => (status, None),
                _ = cancel.cancelled() => {
                    kill(&mut child);
                    (child.wait().await, Some(KillReason::Cancelled))
                }
                _ = deadline => {
                    tracing::warn!("{} exceeded its exec timeout, killing it", program);
                    kill(&mut child);
                    (child.wait().await, Some(KillReason::TimedOut))
                }
            }
        };

        let (sent_out, sent_err, (status, killed)) = tokio::join!(
            relay(stdout, sink, OutputStream::Stdout),
            relay(stderr, sink, OutputStream::Stderr),
            wait,
        );
        stdin_task.abort();

        tracing::trace!("{} relayed {} stdout / {} stderr bytes", program, sent_out, sent_err);

        let status = match status {
            Ok(status) => exit_code(status),
            Err(e) => {
                let err = ProcessError::Wait(e);
                tracing::error!("{}: {}", program, err);
                let _ = sink.eof().await;
                let _ = sink.close().await;
                return ChannelOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };

        tracing::info!("{} finished with status {}", program, status);

        let _ = sink.exit_status(status).await;
        let _ = sink.eof().await;
        let _ = sink.close().await;

        match killed {
            Some(reason) => ChannelOutcome::Killed {
                reason,
                status: Some(status),
            },
            None => ChannelOutcome::Exited { status },
        }
    }
}

/// Kill the process and everything in its process group
fn kill(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain signal delivery to the group we created at spawn
            let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
            if rc == 0 {
                return;
            }
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!("Failed to kill process: {}", e);
    }
}

/// Copy channel input into the process's stdin until the sender goes away
async fn feed_stdin(mut stdin: ChildStdin, mut input: mpsc::Receiver<Bytes>) {
    while let Some(chunk) = input.recv().await {
        if let Err(e) = stdin.write_all(&chunk).await {
            tracing::debug!("Process stdin closed: {}", e);
            return;
        }
    }
    // Dropping stdin delivers EOF to the process
}

/// Copy one output pipe to the channel until the pipe closes
///
/// Once the channel is gone the pipe is still drained so the process never
/// blocks on a full pipe.
async fn relay<R>(mut reader: R, sink: &dyn ChannelSink, stream: OutputStream) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut sent = 0u64;
    let mut channel_open = true;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Failed to read process {:?}: {}", stream, e);
                break;
            }
        };

        if !channel_open {
            continue;
        }

        let result = match stream {
            OutputStream::Stdout => sink.data(&buf[..n]).await,
            OutputStream::Stderr => sink.extended_data(&buf[..n]).await,
        };

        match result {
            Ok(()) => sent += n as u64,
            Err(e) => {
                tracing::debug!("Dropping process {:?}: {}", stream, e);
                channel_open = false;
            }
        }
    }

    sent
}
