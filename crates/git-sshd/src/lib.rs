//! git-sshd: SSH front-end for git hosting
//!
//! Authenticates clients by public key, accepts session channels, sanitizes
//! the command a git client asks to run and supervises the resulting
//! process with its stdio relayed over the channel.

pub mod auth;
pub mod channel;
pub mod command;
pub mod process;
pub mod registry;
pub mod server;
pub mod state;

pub use registry::ConnectionRegistry;
pub use state::ServerState;
