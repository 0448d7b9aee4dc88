//! Shared serialization/deserialization utilities for configuration
//!
//! This module provides common serde helpers used across configuration types.

/// Helper module for Duration serialization as seconds
///
/// This module serializes `std::time::Duration` as a u64 representing seconds,
/// which is more human-readable in TOML configuration files.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Config {
///     #[serde(with = "sshd_core::config::serde_utils::duration_secs")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a Duration as seconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    /// Deserialize a Duration from seconds (u64)
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Same as [`duration_secs`] for optional durations
///
/// A missing field deserializes to `None` when combined with `#[serde(default)]`.
pub mod option_duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize an optional Duration as seconds
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize an optional Duration from seconds
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
