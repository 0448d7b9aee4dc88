//! Core domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::AuthError;

/// Extension name under which the resolved identity is exposed
pub const KEY_ID_EXTENSION: &str = "key-id";

/// Identity a public key resolves to
///
/// Never empty. Once attached to a connection it is trusted for the
/// connection's whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyIdentity(String);

impl KeyIdentity {
    /// Create a key identity, rejecting empty or blank values
    pub fn new(id: impl Into<String>) -> Result<Self, AuthError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(AuthError::InvalidIdentity("identity is empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get the raw identity string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for KeyIdentity {
    type Error = AuthError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<KeyIdentity> for String {
    fn from(id: KeyIdentity) -> Self {
        id.0
    }
}

/// Connection-scoped permissions granted at authentication time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permissions {
    extensions: BTreeMap<String, String>,
}

impl Permissions {
    /// Permissions carrying a resolved key identity
    pub fn for_identity(identity: &KeyIdentity) -> Self {
        let mut extensions = BTreeMap::new();
        extensions.insert(KEY_ID_EXTENSION.to_string(), identity.as_str().to_string());
        Self { extensions }
    }

    /// Look up an extension value
    pub fn extension(&self, name: &str) -> Option<&str> {
        self.extensions.get(name).map(String::as_str)
    }

    /// The identity stored under `key-id`
    pub fn key_id(&self) -> Option<KeyIdentity> {
        self.extension(KEY_ID_EXTENSION)
            .and_then(|id| KeyIdentity::new(id).ok())
    }
}
