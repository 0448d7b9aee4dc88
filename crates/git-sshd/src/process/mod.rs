//! Process supervision
//!
//! A [`ProcessHandle`] owns one spawned process bound to one channel. The
//! process runs with the daemon's effective credentials re-applied and its
//! stdio wired to the channel.

mod credentials;
mod supervisor;

pub use credentials::Credentials;
pub use supervisor::{exit_code, ProcessHandle};

use std::path::PathBuf;

/// Everything needed to start a process for a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Resolved executable
    pub program: PathBuf,
    /// Arguments after the program
    pub args: Vec<String>,
    /// Environment added on top of the daemon's own
    pub env: Vec<(String, String)>,
}
