//! Core error types for git-sshd

use std::path::PathBuf;
use thiserror::Error;

/// Authentication-related errors
#[derive(Error, Debug)]
pub enum AuthError {
    /// The key is not registered with any identity
    #[error("Public key is not registered: {0}")]
    UnknownKey(String),

    /// The identity lookup collaborator failed
    #[error("Identity lookup failed: {0}")]
    Lookup(String),

    /// A lookup returned an identity that cannot be used
    #[error("Invalid key identity: {0}")]
    InvalidIdentity(String),
}

/// Errors produced while turning an exec payload into a runnable command
#[derive(Error, Debug)]
pub enum CommandError {
    /// Nothing left after sanitization
    #[error("Command line is empty after sanitization")]
    Empty,

    /// The program could not be resolved to an executable file
    #[error("Executable not found: {0}")]
    NotFound(String),

    /// The upload fast path was requested without a destination
    #[error("Upload command is missing a destination path")]
    MissingUploadPath,
}

/// Process lifecycle errors
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The process could not be started
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A stdio pipe was not available after spawn
    #[error("Process {0} pipe unavailable")]
    Pipe(&'static str),

    /// Waiting for the process failed
    #[error("Failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),

    /// The concurrent process limit has been reached
    #[error("Process limit reached")]
    LimitExceeded,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Algorithm name that the transport does not support
    #[error("Unsupported {kind} algorithm: {name}")]
    UnsupportedAlgorithm { kind: &'static str, name: String },
}
