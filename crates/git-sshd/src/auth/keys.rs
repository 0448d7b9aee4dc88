//! File-backed key registry
//!
//! Each line holds one public key in authorized_keys format, optionally
//! prefixed with the identity it maps to:
//!
//! ```text
//! id=42 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAA... alice@example.com
//! ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQ...
//! ```
//!
//! Keys without an `id=` prefix are identified by their 1-based position in
//! the registry.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use russh_keys::key::PublicKey;

use sshd_core::error::AuthError;
use sshd_core::KeyIdentity;

use super::{canonical_key, IdentityLookup};

/// In-memory registry of public keys and the identities they map to
#[derive(Debug, Default)]
pub struct AuthorizedKeyStore {
    /// Canonical key content to identity
    identities: HashMap<String, KeyIdentity>,
}

impl AuthorizedKeyStore {
    /// Create a new empty key store
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a key registry file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        tracing::info!("Loading authorized keys from {:?}", path);

        let file = std::fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let reader = BufReader::new(file);
        let mut store = Self::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line
                .with_context(|| format!("Failed to read line {} of {:?}", line_num + 1, path))?;

            if let Err(e) = store.add_line(&line) {
                tracing::warn!(
                    "Skipping key on line {} of {:?}: {}",
                    line_num + 1,
                    path,
                    e
                );
            }
        }

        tracing::info!("Loaded {} authorized keys from {:?}", store.len(), path);
        Ok(store)
    }

    /// Parse one registry line
    ///
    /// Returns `Ok(false)` for blank and comment lines.
    pub fn add_line(&mut self, line: &str) -> Result<bool, AuthError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(false);
        }

        let mut parts = line.split_whitespace().peekable();
        let explicit_id = match parts.peek() {
            Some(first) if first.starts_with("id=") => {
                let id = parts.next().unwrap_or_default().trim_start_matches("id=");
                Some(KeyIdentity::new(id)?)
            }
            _ => None,
        };

        let (Some(_key_type), Some(blob)) = (parts.next(), parts.next()) else {
            return Err(AuthError::InvalidIdentity(format!(
                "expected '<type> <base64>' in {:?}",
                line
            )));
        };

        let key = russh_keys::parse_public_key_base64(blob)
            .map_err(|e| AuthError::InvalidIdentity(format!("bad key data: {}", e)))?;

        let identity = match explicit_id {
            Some(id) => id,
            None => KeyIdentity::new((self.identities.len() + 1).to_string())?,
        };

        self.add_key(&key, identity);
        Ok(true)
    }

    /// Register a public key under an identity
    ///
    /// The first registration of a key wins.
    pub fn add_key(&mut self, key: &PublicKey, identity: KeyIdentity) {
        let content = canonical_key(key);
        if self.identities.contains_key(&content) {
            tracing::warn!("Duplicate key {} ignored", key.fingerprint());
            return;
        }

        tracing::debug!("Registered key {} as {}", key.fingerprint(), identity);
        self.identities.insert(content, identity);
    }

    /// Identity registered for canonical key content
    pub fn identity_for(&self, content: &str) -> Option<&KeyIdentity> {
        self.identities.get(content.trim())
    }

    /// Get the number of registered keys
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Check if there are no registered keys
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[async_trait]
impl IdentityLookup for AuthorizedKeyStore {
    async fn find_by_content(&self, content: &str) -> Result<Option<KeyIdentity>, AuthError> {
        Ok(self.identity_for(content).cloned())
    }
}
