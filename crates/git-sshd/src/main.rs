//! git-sshd daemon
//!
//! Serves git over SSH: authenticates client keys against the key registry
//! and runs the requested git command for each session channel.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use git_sshd::auth::{Authenticator, AuthorizedKeyStore};
use git_sshd::server::{build_ssh_config, load_or_generate_host_key, ConnectionEvent, SshServer};
use git_sshd::{ConnectionRegistry, ServerState};
use sshd_core::config::{self, ServerConfig};

#[derive(Parser)]
#[command(name = "git-sshd")]
#[command(about = "SSH front-end for git hosting")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides config)
    #[arg(short, long, env = "GIT_SSHD_PORT")]
    port: Option<u16>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("git-sshd starting...");

    // Load configuration
    let mut config: ServerConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path)
                .with_context(|| format!("Failed to load config from {:?}", default_path))?
        } else {
            tracing::info!("Using default configuration");
            ServerConfig::default()
        }
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate().context("Invalid configuration")?;

    // Load or generate host key
    let host_key_path = config.host_key_path();
    let host_key = load_or_generate_host_key(&host_key_path).await?;
    if let Ok(public) = host_key.clone_public_key() {
        tracing::info!("Host key fingerprint: {}", public.fingerprint());
    }

    // Load the key registry
    let key_store = if config.authorized_keys.exists() {
        AuthorizedKeyStore::load_from_file(&config.authorized_keys)?
    } else {
        tracing::warn!("Key registry {:?} not found", config.authorized_keys);
        AuthorizedKeyStore::new()
    };

    if key_store.is_empty() {
        tracing::warn!("No valid authorized keys found - all connections will be rejected");
    }

    let ssh_config = build_ssh_config(host_key, &config).context("Invalid transport settings")?;
    let bind_addr = config.bind_address();

    let state = Arc::new(ServerState::new(
        config,
        Authenticator::new(Arc::new(key_store)),
    ));

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    // Create event channel for connection events
    let (event_tx, mut event_rx) = mpsc::channel::<ConnectionEvent>(256);

    // Spawn event handler
    let registry = Arc::clone(&state.registry);
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            handle_connection_event(&registry, event);
        }
    });

    // Create and run SSH server
    let server = SshServer::new(ssh_config, Arc::clone(&state), cancel.clone(), event_tx);

    tracing::info!("Starting SSH server on {}", bind_addr);
    server.run(&bind_addr).await?;

    for record in state.registry.list() {
        tracing::debug!(
            "{} from {} still open at shutdown (key {:?}, {} channels)",
            record.id,
            record.peer_addr,
            record.key_id,
            record.channels_finished
        );
    }

    let stats = state.registry.stats();
    tracing::info!(
        "git-sshd shutdown complete ({} connections served, {} channels ok, {} failed)",
        stats.total_connections,
        stats.channels_succeeded,
        stats.channels_failed
    );
    Ok(())
}

/// Handle connection events from SSH handlers
fn handle_connection_event(registry: &ConnectionRegistry, event: ConnectionEvent) {
    match &event {
        ConnectionEvent::Connected { conn_id, peer_addr } => {
            tracing::debug!("Connection {} opened from {}", conn_id, peer_addr);
        }

        ConnectionEvent::Authenticated {
            conn_id,
            key_id,
            client_version,
        } => {
            tracing::debug!(
                "Connection {} is key-{} ({}), {} already open for this key",
                conn_id,
                key_id,
                client_version,
                registry.by_identity(key_id).len()
            );
        }

        ConnectionEvent::ChannelFinished { conn_id, outcome } => {
            if outcome.is_success() {
                tracing::debug!("Channel on {} {}", conn_id, outcome);
            } else {
                tracing::warn!("Channel on {} {}", conn_id, outcome);
            }
        }

        ConnectionEvent::Disconnected { conn_id } => {
            tracing::debug!("Connection {} gone", conn_id);
        }
    }

    registry.apply(&event);
}
