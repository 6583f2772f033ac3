//! Session configuration
//!
//! Every field has a default, so a JSON config file only needs to name the
//! values it overrides. Durations are written as milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Upper bound accepted for any timeout or retry delay.
pub const MAX_DURATION: Duration = Duration::from_secs(60 * 60 * 24);

/// Tunables for a [`GattSession`](crate::session::GattSession).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Deadline for a dispatched read/write/notify/discover to complete.
    #[serde(with = "millis")]
    pub operation_timeout: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "millis")]
    pub discovery_timeout: Duration,
    /// How long a caller disconnect waits for the platform to confirm.
    #[serde(with = "millis")]
    pub disconnect_timeout: Duration,
    /// Reconnect automatically after an unsolicited disconnect.
    pub auto_reconnect: bool,
    pub retry: RetryPolicy,
    /// Capacity of the status and notification broadcast channels.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(2),
            auto_reconnect: true,
            retry: RetryPolicy::default(),
            event_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("operation_timeout", self.operation_timeout),
            ("connect_timeout", self.connect_timeout),
            ("discovery_timeout", self.discovery_timeout),
            ("disconnect_timeout", self.disconnect_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
            if value > MAX_DURATION {
                return Err(ConfigError::Invalid(format!(
                    "{} exceeds {:?}",
                    name, MAX_DURATION
                )));
            }
        }
        if self.retry.max_delay > MAX_DURATION {
            return Err(ConfigError::Invalid(format!(
                "retry.max_delay exceeds {:?}",
                MAX_DURATION
            )));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be at least 1.0".into(),
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid(
                "retry.initial_delay exceeds retry.max_delay".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be non-zero".into()));
        }
        Ok(())
    }
}

/// Serde adapter: `Duration` <-> integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
