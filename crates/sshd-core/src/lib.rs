//! sshd-core: Core abstractions and configuration for git-sshd
//!
//! This crate provides the shared identity types, the error taxonomy and
//! the configuration model used by the SSH daemon.

pub mod config;
pub mod error;
pub mod types;

pub use types::{KeyIdentity, Permissions, KEY_ID_EXTENSION};
