//! russh server configuration

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use russh::server::Config;
use russh::{cipher, mac, MethodSet, Preferred};
use russh_keys::key::KeyPair;

use sshd_core::config::ServerConfig;
use sshd_core::error::ConfigError;

fn cipher_by_name(name: &str) -> Option<cipher::Name> {
    let cipher = match name {
        "aes128-ctr" => cipher::AES_128_CTR,
        "aes192-ctr" => cipher::AES_192_CTR,
        "aes256-ctr" => cipher::AES_256_CTR,
        "aes256-gcm@openssh.com" => cipher::AES_256_GCM,
        "chacha20-poly1305@openssh.com" => cipher::CHACHA20_POLY1305,
        _ => return None,
    };
    Some(cipher)
}

fn mac_by_name(name: &str) -> Option<mac::Name> {
    let mac = match name {
        "hmac-sha1" => mac::HMAC_SHA1,
        "hmac-sha2-256" => mac::HMAC_SHA256,
        "hmac-sha2-512" => mac::HMAC_SHA512,
        "hmac-sha1-etm@openssh.com" => mac::HMAC_SHA1_ETM,
        "hmac-sha2-256-etm@openssh.com" => mac::HMAC_SHA256_ETM,
        "hmac-sha2-512-etm@openssh.com" => mac::HMAC_SHA512_ETM,
        _ => return None,
    };
    Some(mac)
}

fn resolve_all<T>(
    kind: &'static str,
    names: &[String],
    lookup: fn(&str) -> Option<T>,
) -> Result<Vec<T>, ConfigError> {
    names
        .iter()
        .map(|name| {
            lookup(name).ok_or_else(|| ConfigError::UnsupportedAlgorithm {
                kind,
                name: name.clone(),
            })
        })
        .collect()
}

/// Build the russh server configuration for `host_key`
///
/// Only public-key authentication is offered. Empty cipher or MAC lists keep
/// the transport's own defaults.
pub fn build_ssh_config(host_key: KeyPair, config: &ServerConfig) -> Result<Arc<Config>, ConfigError> {
    let ciphers = resolve_all("cipher", &config.ciphers, cipher_by_name)?;
    let macs = resolve_all("MAC", &config.macs, mac_by_name)?;

    let mut preferred = Preferred::default();
    if !ciphers.is_empty() {
        preferred.cipher = Cow::Owned(ciphers);
    }
    if !macs.is_empty() {
        preferred.mac = Cow::Owned(macs);
    }

    Ok(Arc::new(Config {
        methods: MethodSet::PUBLICKEY,
        keys: vec![host_key],
        preferred,
        auth_rejection_time: config.auth_rejection_time,
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    }))
}
