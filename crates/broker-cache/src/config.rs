//! Cache configuration.
//!
//! All values are optional bounds on broker calls. Loaded from TOML or from
//! environment variables; anything unset falls back to the defaults below.
//!
//! ```toml
//! connect_timeout_ms = 30000
//! send_timeout_ms = 5000
//! close_timeout_ms = 10000
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default timeout for opening a broker session.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Default timeout for each disposal call during teardown.
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 10_000;

/// Environment variable overriding `connect_timeout_ms`.
pub const ENV_CONNECT_TIMEOUT_MS: &str = "BROKER_CACHE_CONNECT_TIMEOUT_MS";

/// Environment variable overriding `send_timeout_ms`.
pub const ENV_SEND_TIMEOUT_MS: &str = "BROKER_CACHE_SEND_TIMEOUT_MS";

/// Environment variable overriding `close_timeout_ms`.
pub const ENV_CLOSE_TIMEOUT_MS: &str = "BROKER_CACHE_CLOSE_TIMEOUT_MS";

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML could not be parsed
    #[error("Invalid cache configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment variable held something other than a number of milliseconds
    #[error("Invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Timeouts applied by the cache around broker calls.
///
/// `None` means wait indefinitely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Bound on `BrokerClient::connect`
    pub connect_timeout_ms: Option<u64>,
    /// Default deadline for `send` when the caller gives none
    pub send_timeout_ms: Option<u64>,
    /// Bound on each sender/session close during teardown
    pub close_timeout_ms: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: Some(DEFAULT_CONNECT_TIMEOUT_MS),
            send_timeout_ms: None,
            close_timeout_ms: Some(DEFAULT_CLOSE_TIMEOUT_MS),
        }
    }
}

impl CacheConfig {
    /// Parse configuration from a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Defaults overridden by any `BROKER_CACHE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ms) = parse_ms(&lookup, ENV_CONNECT_TIMEOUT_MS)? {
            config.connect_timeout_ms = Some(ms);
        }
        if let Some(ms) = parse_ms(&lookup, ENV_SEND_TIMEOUT_MS)? {
            config.send_timeout_ms = Some(ms);
        }
        if let Some(ms) = parse_ms(&lookup, ENV_CLOSE_TIMEOUT_MS)? {
            config.close_timeout_ms = Some(ms);
        }
        Ok(config)
    }

    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Default send deadline as a `Duration`.
    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    /// Close timeout as a `Duration`.
    pub fn close_timeout(&self) -> Option<Duration> {
        self.close_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_ms(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
    }
}
