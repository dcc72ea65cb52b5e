//! Configuration for the pool client.
//!
//! Defines the user-configurable connection and timing settings. Financial
//! parameters live in `protocol::session::MixParams`; they are per-session
//! values rather than configuration.

use crate::protocol::session::Network;
use core::fmt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The JSON document could not be parsed.
    Parse(String),
    /// A field holds a value the client cannot work with.
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse(msg) => write!(f, "Malformed configuration: {}", msg),
            ConfigError::Invalid(field) => write!(f, "Invalid configuration value: {}", field),
        }
    }
}

impl std::error::Error for ConfigError {}

/// What the orchestrator does when a bootstrap stage fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the first failing stage and tear the session down.
    #[default]
    ShortCircuit,
    /// Log the failure and attempt the next stage anyway.
    BestEffort,
}

/// Main configuration structure for the pool client.
///
/// Usually loaded from JSON by the host application; every field has a
/// default so partial documents are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Pool server host name or address.
    pub host: String,

    /// Pool server port.
    pub port: u16,

    /// Coin network the round will operate on.
    pub network: Network,

    /// Wrap the pool connection in a Noise XX session.
    pub use_transport_encryption: bool,

    /// Upper bound on how long a blocked receive goes without checking the
    /// cancellation signal.
    pub poll_interval_ms: u64,

    /// Pause after a wake sentinel before receiving again.
    pub not_ready_backoff_ms: u64,

    pub connect_timeout_secs: u64,

    /// Largest frame accepted from or sent to the pool.
    pub max_frame_len: usize,

    pub failure_policy: FailurePolicy,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 8080,
            network: Network::Mainnet,
            use_transport_encryption: false,
            poll_interval_ms: 50,
            not_ready_backoff_ms: 100,
            connect_timeout_secs: 10,
            max_frame_len: 1024 * 1024, // 1 MiB
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl MixerConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host"));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms"));
        }
        if self.not_ready_backoff_ms == 0 {
            return Err(ConfigError::Invalid("not_ready_backoff_ms"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("connect_timeout_secs"));
        }
        if self.max_frame_len < 64 {
            return Err(ConfigError::Invalid("max_frame_len"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn not_ready_backoff(&self) -> Duration {
        Duration::from_millis(self.not_ready_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
