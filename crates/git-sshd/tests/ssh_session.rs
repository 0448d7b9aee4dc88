//! End-to-end tests driving the daemon with a russh client

#![cfg(unix)]

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{Channel, ChannelMsg};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use git_sshd::auth::{Authenticator, AuthorizedKeyStore};
use git_sshd::channel::ChannelOutcome;
use git_sshd::server::{build_ssh_config, ConnectionEvent, SshServer};
use git_sshd::ServerState;
use sshd_core::config::ServerConfig;
use sshd_core::KeyIdentity;

const TIMEOUT: Duration = Duration::from_secs(10);

struct TestClient;

#[async_trait]
impl client::Handler for TestClient {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct TestServer {
    addr: SocketAddr,
    events: mpsc::Receiver<ConnectionEvent>,
    cancel: CancellationToken,
}

impl TestServer {
    async fn start(store: AuthorizedKeyStore, config: ServerConfig) -> Self {
        let host_key = KeyPair::generate_ed25519().unwrap();
        let ssh_config = build_ssh_config(host_key, &config).unwrap();
        let state = Arc::new(ServerState::new(config, Authenticator::new(Arc::new(store))));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (event_tx, events) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let server = SshServer::new(ssh_config, state, cancel.clone(), event_tx);
        tokio::spawn(async move { server.serve(listener).await });

        Self {
            addr,
            events,
            cancel,
        }
    }

    /// Wait for the next channel outcome
    async fn next_outcome(&mut self) -> ChannelOutcome {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                match self.events.recv().await {
                    Some(ConnectionEvent::ChannelFinished { outcome, .. }) => return outcome,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("no channel outcome")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        listen_host: "127.0.0.1".to_string(),
        auth_rejection_time: Duration::ZERO,
        ..Default::default()
    }
}

/// A client key registered as `key_id`
fn registered_key(store: &mut AuthorizedKeyStore, key_id: &str) -> KeyPair {
    let key = KeyPair::generate_ed25519().unwrap();
    store.add_key(
        &key.clone_public_key().unwrap(),
        KeyIdentity::new(key_id).unwrap(),
    );
    key
}

async fn connect(addr: SocketAddr, key: KeyPair) -> (client::Handle<TestClient>, bool) {
    let mut session = client::connect(Arc::new(client::Config::default()), addr, TestClient)
        .await
        .unwrap();
    let authenticated = session
        .authenticate_publickey("git", Arc::new(key))
        .await
        .unwrap();
    (session, authenticated)
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Everything the server sent on a channel until it closed
#[derive(Debug, Default)]
struct Transcript {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
    successes: usize,
    failures: usize,
    eof: bool,
    closed: bool,
}

async fn collect(channel: &mut Channel<client::Msg>) -> Transcript {
    let mut transcript = Transcript::default();
    tokio::time::timeout(TIMEOUT, async {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => transcript.stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    transcript.stderr.extend_from_slice(&data)
                }
                ChannelMsg::ExitStatus { exit_status } => transcript.exit_status = Some(exit_status),
                ChannelMsg::Success => transcript.successes += 1,
                ChannelMsg::Failure => transcript.failures += 1,
                ChannelMsg::Eof => transcript.eof = true,
                ChannelMsg::Close => {
                    transcript.closed = true;
                    break;
                }
                _ => {}
            }
        }
    })
    .await
    .expect("channel did not close");
    transcript
}

#[tokio::test]
async fn test_unknown_key_rejected() {
    let mut store = AuthorizedKeyStore::new();
    registered_key(&mut store, "1");
    let server = TestServer::start(store, test_config()).await;

    let stranger = KeyPair::generate_ed25519().unwrap();
    let (_session, authenticated) = connect(server.addr, stranger).await;
    assert!(!authenticated);
}

#[tokio::test]
async fn test_exec_relays_output_and_true_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "hook", "echo \"out:$1\"\necho err >&2\nexit 7");

    let mut store = AuthorizedKeyStore::new();
    let key = registered_key(&mut store, "5");
    let mut server = TestServer::start(store, test_config()).await;

    let (session, authenticated) = connect(server.addr, key).await;
    assert!(authenticated);

    let mut channel = session.channel_open_session().await.unwrap();
    channel
        .exec(true, format!("{} hello", script.display()))
        .await
        .unwrap();
    channel.eof().await.unwrap();

    let transcript = collect(&mut channel).await;
    assert_eq!(transcript.successes, 1);
    assert_eq!(transcript.stdout, b"out:hello\n");
    assert_eq!(transcript.stderr, b"err\n");
    assert_eq!(transcript.exit_status, Some(7));
    assert!(transcript.eof);

    assert_eq!(server.next_outcome().await, ChannelOutcome::Exited { status: 7 });
}

#[tokio::test]
async fn test_channel_input_reaches_stdin() {
    let mut store = AuthorizedKeyStore::new();
    let key = registered_key(&mut store, "5");
    let server = TestServer::start(store, test_config()).await;

    let (session, _) = connect(server.addr, key).await;
    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, "/bin/cat").await.unwrap();
    channel.data(&b"0032want deadbeef\n"[..]).await.unwrap();
    channel.eof().await.unwrap();

    let transcript = collect(&mut channel).await;
    assert_eq!(transcript.stdout, b"0032want deadbeef\n");
    assert_eq!(transcript.exit_status, Some(0));
}

#[tokio::test]
async fn test_env_reaches_process() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "proto",
        "printf '%s|%s' \"$GIT_PROTOCOL\" \"$GIT_SSHD_UNLISTED\"",
    );

    let mut store = AuthorizedKeyStore::new();
    let key = registered_key(&mut store, "5");
    let server = TestServer::start(store, test_config()).await;

    let (session, _) = connect(server.addr, key).await;
    let mut channel = session.channel_open_session().await.unwrap();
    channel.set_env(false, "GIT_PROTOCOL", "version=2").await.unwrap();
    channel.set_env(false, "EMPTY", "").await.unwrap();
    channel.set_env(false, "GIT_SSHD_UNLISTED", "set").await.unwrap();
    channel.exec(true, script.display().to_string()).await.unwrap();
    channel.eof().await.unwrap();

    let transcript = collect(&mut channel).await;
    // Only names in accept_env are passed through
    assert_eq!(transcript.stdout, b"version=2|");
    assert_eq!(transcript.exit_status, Some(0));
}

#[tokio::test]
async fn test_cat_uploads_without_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("upload.pack");

    let mut store = AuthorizedKeyStore::new();
    let key = registered_key(&mut store, "5");
    let mut server = TestServer::start(store, test_config()).await;

    let (session, _) = connect(server.addr, key).await;
    let mut channel = session.channel_open_session().await.unwrap();
    channel
        .exec(true, format!("cat {}", target.display()))
        .await
        .unwrap();
    channel.data(&b"PACK"[..]).await.unwrap();
    channel.data(&b"\x00\x00\x00\x02"[..]).await.unwrap();
    channel.eof().await.unwrap();

    let transcript = collect(&mut channel).await;
    assert_eq!(transcript.successes, 1);
    assert_eq!(transcript.exit_status, None);
    assert!(transcript.eof);
    assert!(transcript.closed);

    assert_eq!(server.next_outcome().await, ChannelOutcome::Uploaded { bytes: 8 });
    assert_eq!(std::fs::read(&target).unwrap(), b"PACK\x00\x00\x00\x02");
}

#[tokio::test]
async fn test_unresolvable_program_closes_without_spawning() {
    let mut store = AuthorizedKeyStore::new();
    let key = registered_key(&mut store, "5");
    let mut server = TestServer::start(store, test_config()).await;

    let (session, _) = connect(server.addr, key).await;
    let mut channel = session.channel_open_session().await.unwrap();
    channel
        .exec(true, "git-sshd-no-such-command 'repo.git'")
        .await
        .unwrap();

    let transcript = collect(&mut channel).await;
    assert_eq!(transcript.exit_status, None);
    assert!(transcript.stdout.is_empty());

    assert!(matches!(
        server.next_outcome().await,
        ChannelOutcome::Rejected { .. }
    ));
}

#[tokio::test]
async fn test_second_exec_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "once", "cat >/dev/null\necho \"ran:$1\"");

    let mut store = AuthorizedKeyStore::new();
    let key = registered_key(&mut store, "5");
    let server = TestServer::start(store, test_config()).await;

    let (session, _) = connect(server.addr, key).await;
    let mut channel = session.channel_open_session().await.unwrap();
    channel
        .exec(true, format!("{} first", script.display()))
        .await
        .unwrap();
    channel
        .exec(true, format!("{} second", script.display()))
        .await
        .unwrap();
    channel.eof().await.unwrap();

    let transcript = collect(&mut channel).await;
    assert_eq!(transcript.successes, 1);
    assert_eq!(transcript.stdout, b"ran:first\n");
    assert_eq!(transcript.exit_status, Some(0));
}

#[tokio::test]
async fn test_exec_timeout_kills_process() {
    let mut store = AuthorizedKeyStore::new();
    let key = registered_key(&mut store, "5");
    let config = ServerConfig {
        exec_timeout: Some(Duration::from_millis(200)),
        ..test_config()
    };
    let mut server = TestServer::start(store, config).await;

    let (session, _) = connect(server.addr, key).await;
    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, "/bin/sleep 30").await.unwrap();

    let transcript = collect(&mut channel).await;
    assert_eq!(transcript.exit_status, Some(128 + 9));

    assert!(matches!(
        server.next_outcome().await,
        ChannelOutcome::Killed { status: Some(137), .. }
    ));
}

#[tokio::test]
async fn test_process_limit_refuses_exec() {
    let mut store = AuthorizedKeyStore::new();
    let key = registered_key(&mut store, "5");
    let config = ServerConfig {
        max_processes: Some(1),
        ..test_config()
    };
    let server = TestServer::start(store, config).await;

    let (session, _) = connect(server.addr, key).await;

    // Holds the only process slot until its stdin closes
    let busy = session.channel_open_session().await.unwrap();
    busy.exec(true, "/bin/cat").await.unwrap();

    let mut refused = session.channel_open_session().await.unwrap();
    refused.exec(true, "/bin/cat").await.unwrap();

    let transcript = collect(&mut refused).await;
    assert_eq!(transcript.failures, 1);
    assert_eq!(transcript.exit_status, None);

    busy.eof().await.unwrap();
}
