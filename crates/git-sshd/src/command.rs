//! Exec payload sanitization and program resolution
//!
//! A client's exec payload is never handed to a shell. It is normalized into
//! a whitespace-split argument list:
//!
//! 1. everything before the first literal `git` is dropped (clients and
//!    proxies sometimes prefix the command),
//! 2. leading `'`, `(` and `)` characters are trimmed,
//! 3. the line is split on whitespace,
//! 4. non-printable characters (control, format, private use and
//!    noncharacters) are removed from every token,
//! 5. tokens left empty are dropped.
//!
//! Quoting is not interpreted, so `'/repo.git'` keeps its quotes.

use std::env;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use sshd_core::error::CommandError;

/// Program name that selects the upload fast path
pub const UPLOAD_PROGRAM: &str = "cat";

/// A sanitized, non-empty argument list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    args: Vec<String>,
}

impl CommandLine {
    /// Sanitize a raw exec payload
    pub fn parse(raw: &str) -> Result<Self, CommandError> {
        let line = match raw.find("git") {
            Some(idx) => &raw[idx..],
            None => raw,
        };
        let line = line.trim_start_matches(['\'', '(', ')']);

        let args: Vec<String> = line
            .split_whitespace()
            .map(|token| token.chars().filter(|c| is_printable(*c)).collect::<String>())
            .filter(|token| !token.is_empty())
            .collect();

        if args.is_empty() {
            return Err(CommandError::Empty);
        }

        Ok(Self { args })
    }

    /// Sanitize a raw exec payload received as bytes
    pub fn from_bytes(raw: &[u8]) -> Result<Self, CommandError> {
        Self::parse(&String::from_utf8_lossy(raw))
    }

    /// The program token
    pub fn program(&self) -> &str {
        &self.args[0]
    }

    /// Tokens after the program
    pub fn args(&self) -> &[String] {
        &self.args[1..]
    }

    /// All tokens, program first
    pub fn tokens(&self) -> &[String] {
        &self.args
    }

    /// Whether this is the `cat <path>` upload fast path
    pub fn is_upload(&self) -> bool {
        self.program() == UPLOAD_PROGRAM
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args.join(" "))
    }
}

/// Whether a character survives sanitization
///
/// Whitespace never reaches this point since tokens are already split on it.
fn is_printable(c: char) -> bool {
    !(c.is_control() || is_format(c) || is_private_use(c) || is_noncharacter(c))
}

/// Unicode general category Cf
fn is_format(c: char) -> bool {
    matches!(
        c,
        '\u{00AD}'
            | '\u{0600}'..='\u{0605}'
            | '\u{061C}'
            | '\u{06DD}'
            | '\u{070F}'
            | '\u{0890}'..='\u{0891}'
            | '\u{08E2}'
            | '\u{180E}'
            | '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{206F}'
            | '\u{FEFF}'
            | '\u{FFF9}'..='\u{FFFB}'
            | '\u{110BD}'
            | '\u{110CD}'
            | '\u{13430}'..='\u{1343F}'
            | '\u{1BCA0}'..='\u{1BCA3}'
            | '\u{1D173}'..='\u{1D17A}'
            | '\u{E0001}'
            | '\u{E0020}'..='\u{E007F}'
    )
}

/// Unicode general category Co
fn is_private_use(c: char) -> bool {
    matches!(
        c,
        '\u{E000}'..='\u{F8FF}' | '\u{F0000}'..='\u{FFFFD}' | '\u{100000}'..='\u{10FFFD}'
    )
}

fn is_noncharacter(c: char) -> bool {
    matches!(c, '\u{FDD0}'..='\u{FDEF}') || (c as u32) & 0xFFFE == 0xFFFE
}

/// Resolve a program name to an executable file
///
/// Names containing a `/` are checked as given; bare names are searched in
/// `PATH`. The filesystem probes run on the blocking pool.
pub async fn resolve_executable(name: &str) -> Result<PathBuf, CommandError> {
    let owned = name.to_string();
    tokio::task::spawn_blocking(move || resolve_in(&owned, env::var_os("PATH").as_deref()))
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Executable lookup for {} did not complete: {}", name, e);
            Err(CommandError::NotFound(name.to_string()))
        })
}

fn resolve_in(name: &str, search_path: Option<&OsStr>) -> Result<PathBuf, CommandError> {
    if name.is_empty() {
        return Err(CommandError::NotFound(name.to_string()));
    }

    if name.contains('/') {
        let path = PathBuf::from(name);
        return if is_executable(&path) {
            Ok(path)
        } else {
            Err(CommandError::NotFound(name.to_string()))
        };
    }

    search_path
        .into_iter()
        .flat_map(|paths| env::split_paths(paths))
        .map(|dir| {
            // Empty PATH entries mean the current directory
            if dir.as_os_str().is_empty() {
                PathBuf::from(".").join(name)
            } else {
                dir.join(name)
            }
        })
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| CommandError::NotFound(name.to_string()))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
