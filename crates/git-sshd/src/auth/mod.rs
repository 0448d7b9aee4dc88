//! Authentication module for the SSH daemon
//!
//! A presented public key is canonicalized to its `<algorithm> <base64>`
//! form and resolved through an [`IdentityLookup`]. A resolved identity is
//! the only authorization decision the daemon makes.

mod keys;

pub use keys::AuthorizedKeyStore;

use std::sync::Arc;

use async_trait::async_trait;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;

use sshd_core::error::AuthError;
use sshd_core::{KeyIdentity, Permissions};

/// Resolves canonical public-key content to an identity
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// Find the identity owning `content` (`<algorithm> <base64>`)
    ///
    /// `Ok(None)` means the key is simply not registered.
    async fn find_by_content(&self, content: &str) -> Result<Option<KeyIdentity>, AuthError>;
}

/// Standard textual encoding of a public key, without comment
pub fn canonical_key(key: &PublicKey) -> String {
    format!("{} {}", key_type(key), key.public_key_base64())
}

/// Key type as written in authorized_keys files
///
/// RSA keys report their negotiated signature algorithm as their name, but
/// the key blob is always `ssh-rsa`.
fn key_type(key: &PublicKey) -> &'static str {
    match key.name() {
        "rsa-sha2-256" | "rsa-sha2-512" => "ssh-rsa",
        other => other,
    }
}

/// Public-key authenticator backed by an identity lookup
#[derive(Clone)]
pub struct Authenticator {
    lookup: Arc<dyn IdentityLookup>,
}

impl Authenticator {
    /// Create an authenticator over the given lookup
    pub fn new(lookup: Arc<dyn IdentityLookup>) -> Self {
        Self { lookup }
    }

    /// Resolve a presented key to connection permissions
    pub async fn authenticate(&self, key: &PublicKey) -> Result<Permissions, AuthError> {
        let content = canonical_key(key);
        match self.lookup.find_by_content(&content).await? {
            Some(identity) => Ok(Permissions::for_identity(&identity)),
            None => Err(AuthError::UnknownKey(key.fingerprint())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIL1NHvF3sONw8VMX1YLrJkuuPNsJR0jMG9yDjTPfFvFd";
    const BOB: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIAKtaj1iPMi+tV0ncy97JC9chjcO82GsW0fw/kYXbFrw";

    struct FailingLookup;

    #[async_trait]
    impl IdentityLookup for FailingLookup {
        async fn find_by_content(&self, _content: &str) -> Result<Option<KeyIdentity>, AuthError> {
            Err(AuthError::Lookup("store offline".into()))
        }
    }

    fn store_with_alice() -> AuthorizedKeyStore {
        let mut store = AuthorizedKeyStore::new();
        store
            .add_line(&format!("id=7 ssh-ed25519 {} alice@example.com", ALICE))
            .unwrap();
        store
    }

    #[test]
    fn test_canonical_key_has_no_comment() {
        let key = russh_keys::parse_public_key_base64(ALICE).unwrap();
        assert_eq!(canonical_key(&key), format!("ssh-ed25519 {}", ALICE));
    }

    #[tokio::test]
    async fn test_authenticate_known_key() {
        let auth = Authenticator::new(Arc::new(store_with_alice()));
        let key = russh_keys::parse_public_key_base64(ALICE).unwrap();

        let perms = auth.authenticate(&key).await.unwrap();
        assert_eq!(perms.extension(sshd_core::KEY_ID_EXTENSION), Some("7"));
    }

    #[tokio::test]
    async fn test_authenticate_unknown_key() {
        let auth = Authenticator::new(Arc::new(store_with_alice()));
        let key = russh_keys::parse_public_key_base64(BOB).unwrap();

        let err = auth.authenticate(&key).await.unwrap_err();
        assert!(matches!(err, AuthError::UnknownKey(_)));
    }

    #[tokio::test]
    async fn test_authenticate_lookup_failure() {
        let auth = Authenticator::new(Arc::new(FailingLookup));
        let key = russh_keys::parse_public_key_base64(ALICE).unwrap();

        let err = auth.authenticate(&key).await.unwrap_err();
        assert!(matches!(err, AuthError::Lookup(_)));
    }
}
