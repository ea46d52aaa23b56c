//! Configuration surface for the proxy.
//!
//! Assembled from, lowest to highest precedence: built-in defaults, an
//! optional TOML file, and `MQTTRL_`-prefixed environment variables. Uses
//! the `config` crate for the merge, matching the layering the project's
//! other configuration loaders use.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::rate_limiter::RateLimitPolicy;

const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
const DEFAULT_LISTEN_PORT: u16 = 1883;
const DEFAULT_BROKER_HOST: &str = "localhost";
const DEFAULT_BROKER_PORT: u16 = 1884;
const DEFAULT_MAX_MESSAGES_PER_SEC: f64 = 10.0;
const DEFAULT_BURST_SIZE: u32 = 20;
const DEFAULT_BLOCK_DURATION_SEC: u64 = 60;

/// Errors produced while assembling or validating a [`ProxyConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The underlying `config` crate failed to merge or deserialize sources.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// One or more fields failed validation. Carries every violation found,
    /// not just the first.
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Raw, pre-validation configuration shape deserialized directly from the
/// merged sources.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawConfig {
    listen_address: String,
    listen_port: u16,
    broker_host: String,
    broker_port: u16,
    max_messages_per_sec: f64,
    burst_size: u32,
    block_duration_sec: u64,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            broker_host: DEFAULT_BROKER_HOST.to_string(),
            broker_port: DEFAULT_BROKER_PORT,
            max_messages_per_sec: DEFAULT_MAX_MESSAGES_PER_SEC,
            burst_size: DEFAULT_BURST_SIZE,
            block_duration_sec: DEFAULT_BLOCK_DURATION_SEC,
        }
    }
}

/// Validated, in-memory configuration for the proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_address: IpAddr,
    pub listen_port: u16,
    pub broker_host: String,
    pub broker_port: u16,
    pub default_policy: RateLimitPolicy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::from_raw(RawConfig::default()).expect("built-in defaults are always valid")
    }
}

impl ProxyConfig {
    /// Loads configuration from built-in defaults, optionally layered with
    /// a TOML file, then `MQTTRL_`-prefixed environment variables.
    pub fn load(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("listen_address", DEFAULT_LISTEN_ADDRESS)?
            .set_default("listen_port", i64::from(DEFAULT_LISTEN_PORT))?
            .set_default("broker_host", DEFAULT_BROKER_HOST)?
            .set_default("broker_port", i64::from(DEFAULT_BROKER_PORT))?
            .set_default("max_messages_per_sec", DEFAULT_MAX_MESSAGES_PER_SEC)?
            .set_default("burst_size", i64::from(DEFAULT_BURST_SIZE))?
            .set_default("block_duration_sec", DEFAULT_BLOCK_DURATION_SEC as i64)?;

        if let Some(path) = toml_path {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MQTTRL").try_parsing(true),
        );

        let raw: RawConfig = builder.build()?.try_deserialize()?;
        Self::from_raw(raw)
    }

    /// Loads configuration purely from built-in defaults, useful for tests
    /// and as the zero-config fallback.
    pub fn load_or_default() -> Self {
        Self::load(None).unwrap_or_default()
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut errors = Vec::new();

        let listen_address = raw
            .listen_address
            .parse::<IpAddr>()
            .unwrap_or_else(|_| {
                errors.push(format!("listen_address {:?} is not a valid IP", raw.listen_address));
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            });

        if raw.listen_port == 0 {
            errors.push("listen_port must be in 1..=65535".to_string());
        }
        if raw.broker_port == 0 {
            errors.push("broker_port must be in 1..=65535".to_string());
        }
        if raw.broker_host.trim().is_empty() {
            errors.push("broker_host must not be empty".to_string());
        }
        if !(raw.max_messages_per_sec > 0.0) {
            errors.push("max_messages_per_sec must be positive".to_string());
        }
        if raw.burst_size == 0 {
            errors.push("burst_size must be positive".to_string());
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(Self {
            listen_address,
            listen_port: raw.listen_port,
            broker_host: raw.broker_host,
            broker_port: raw.broker_port,
            default_policy: RateLimitPolicy {
                refill_rate_per_sec: raw.max_messages_per_sec,
                burst_capacity: raw.burst_size,
                block_duration: Duration::from_secs(raw.block_duration_sec),
            },
        })
    }

    /// Overrides the listen address, consuming and returning `self`.
    #[must_use]
    pub fn with_listen_address(mut self, addr: IpAddr) -> Self {
        self.listen_address = addr;
        self
    }

    /// Overrides the listen port, consuming and returning `self`.
    #[must_use]
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    /// Overrides the broker host, consuming and returning `self`.
    #[must_use]
    pub fn with_broker_host(mut self, host: impl Into<String>) -> Self {
        self.broker_host = host.into();
        self
    }

    /// Overrides the broker port, consuming and returning `self`.
    #[must_use]
    pub fn with_broker_port(mut self, port: u16) -> Self {
        self.broker_port = port;
        self
    }
}
