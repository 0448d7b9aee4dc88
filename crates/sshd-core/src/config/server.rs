//! SSH daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_secs, option_duration_secs};
use crate::error::ConfigError;

/// Port used when neither the config file nor the CLI sets one
pub const DEFAULT_PORT: u16 = 9393;

/// Configuration for the SSH daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind the SSH server to
    pub listen_host: String,

    /// Port to bind the SSH server to
    pub port: u16,

    /// Directory holding generated host keys
    pub data_dir: PathBuf,

    /// Explicit host key path (defaults to a per-port file under `data_dir`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_key_path: Option<PathBuf>,

    /// Key registry consulted during public-key authentication
    pub authorized_keys: PathBuf,

    /// Allowed transport ciphers, in preference order (empty = transport default)
    pub ciphers: Vec<String>,

    /// Allowed MAC algorithms, in preference order (empty = transport default)
    pub macs: Vec<String>,

    /// What an `exec` request ends up running
    pub dispatch: DispatchMode,

    /// Environment variable names a client may set with `env`
    pub accept_env: Vec<String>,

    /// Upper bound on a spawned process's lifetime
    #[serde(
        with = "option_duration_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub exec_timeout: Option<Duration>,

    /// Maximum number of concurrent connections
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,

    /// Maximum number of concurrently running processes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<u32>,

    /// Delay before answering a rejected authentication attempt
    #[serde(with = "duration_secs")]
    pub auth_rejection_time: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            data_dir: super::default_data_dir(),
            host_key_path: None,
            authorized_keys: super::default_config_dir().join("authorized_keys"),
            ciphers: vec![
                "aes128-ctr".to_string(),
                "aes192-ctr".to_string(),
                "aes256-ctr".to_string(),
                "aes256-gcm@openssh.com".to_string(),
                "chacha20-poly1305@openssh.com".to_string(),
            ],
            macs: vec![
                "hmac-sha2-256-etm@openssh.com".to_string(),
                "hmac-sha2-256".to_string(),
                "hmac-sha1".to_string(),
            ],
            dispatch: DispatchMode::Direct,
            accept_env: vec!["GIT_PROTOCOL".to_string()],
            exec_timeout: None,
            max_connections: None,
            max_processes: None,
            auth_rejection_time: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    /// Address the listener binds to (`host:port`)
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.port)
    }

    /// Host key location; one RSA key per listening port
    pub fn host_key_path(&self) -> PathBuf {
        self.host_key_path.clone().unwrap_or_else(|| {
            self.data_dir
                .join("ssh")
                .join(format!("git-sshd_{}.rsa", self.port))
        })
    }

    /// Reject settings that cannot work at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_host.trim().is_empty() {
            return Err(ConfigError::Invalid("listen_host must not be empty".into()));
        }
        if self.max_connections == Some(0) {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if self.max_processes == Some(0) {
            return Err(ConfigError::Invalid("max_processes must be at least 1".into()));
        }
        if self.exec_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid("exec_timeout must be positive".into()));
        }
        if let DispatchMode::Serv { program, .. } = &self.dispatch {
            if program.trim().is_empty() {
                return Err(ConfigError::Invalid("dispatch.program must not be empty".into()));
            }
        }
        Ok(())
    }
}

/// How a sanitized `exec` command is turned into a process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DispatchMode {
    /// Run the client's sanitized command itself
    #[default]
    Direct,
    /// Run a fixed trusted program as `<program> serv key-<id> --config=<config>`,
    /// passing the client's command in `SSH_ORIGINAL_COMMAND`
    Serv { program: String, config: PathBuf },
}
