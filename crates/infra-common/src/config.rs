//! Configuration loading.
//!
//! Every configuration struct in the stack derives `serde::Deserialize` with
//! `#[serde(default)]`, so a TOML file only needs the keys it overrides.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::errors::types::{Error, Result};

/// Parse a configuration value from TOML text.
pub fn from_toml_str<T: DeserializeOwned>(text: &str) -> Result<T> {
    toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
}

/// Read and parse a TOML configuration file.
pub fn load_toml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.display().to_string(),
        source,
    })?;
    from_toml_str(&text)
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
///
/// Use with `#[serde(with = "sipflow_infra_common::config::duration_ms")]`.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Convenience for building millisecond durations in defaults.
pub const fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
