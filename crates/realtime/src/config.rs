//! Session configuration.
//!
//! Stored as TOML; every key is optional. Durations are milliseconds:
//!
//! ```toml
//! endpoint = "wss://fleet.example.com/api/socket?userId={user_id}"
//! heartbeat_interval_ms = 30000
//!
//! [reconnect]
//! max_delay_ms = 30000
//! attempt_ceiling = 5
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleetsync_protocol::constants::{HANDSHAKE_TIMEOUT, HEARTBEAT_INTERVAL};

use crate::types::ReconnectConfig;

/// Placeholder substituted with the session's user id.
pub const USER_ID_PLACEHOLDER: &str = "{user_id}";

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for one synchronization session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Push channel URL. `{user_id}` is replaced with the session identity.
    pub endpoint: String,

    /// Time allowed for the low-level socket open.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,

    /// Time allowed for the identify acknowledgment.
    #[serde(rename = "handshake_timeout_ms", with = "millis")]
    pub handshake_timeout: Duration,

    /// Heartbeat period once open. Silence for twice this long closes the
    /// channel.
    #[serde(rename = "heartbeat_interval_ms", with = "millis")]
    pub heartbeat_interval: Duration,

    pub reconnect: ReconnectConfig,

    /// Size of the recent-events feed.
    pub recent_events_capacity: usize,

    /// Size of the side history holding out-of-order positions.
    pub stale_history_capacity: usize,

    /// Number of event ids remembered for duplicate suppression.
    pub event_id_memory: usize,

    /// Capacity of the update broadcast. Slower receivers lag and skip.
    pub update_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8082/api/socket?userId={user_id}".into(),
            connect_timeout: Duration::from_secs(15),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reconnect: ReconnectConfig::default(),
            recent_events_capacity: 200,
            stale_history_capacity: 100,
            event_id_memory: 1024,
            update_buffer: 256,
        }
    }
}

impl SyncConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from disk, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Rejects values the session cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.endpoint.contains("://") {
            return Err(invalid(format!("endpoint {:?} is not a URL", self.endpoint)));
        }
        if self.connect_timeout.is_zero()
            || self.handshake_timeout.is_zero()
            || self.heartbeat_interval.is_zero()
        {
            return Err(invalid("timeouts and heartbeat interval must be non-zero"));
        }
        let r = &self.reconnect;
        if r.initial_delay.is_zero() || r.max_delay < r.initial_delay {
            return Err(invalid(
                "reconnect delays must satisfy 0 < initial_delay <= max_delay",
            ));
        }
        if !(r.backoff_factor >= 1.0) {
            return Err(invalid("backoff_factor must be >= 1.0"));
        }
        if !(0.0..1.0).contains(&r.jitter) {
            return Err(invalid("jitter must be in [0, 1)"));
        }
        if self.recent_events_capacity == 0
            || self.stale_history_capacity == 0
            || self.event_id_memory == 0
            || self.update_buffer == 0
        {
            return Err(invalid("capacities must be non-zero"));
        }
        Ok(())
    }

    /// Resolves the endpoint for a user id.
    pub fn endpoint_for(&self, user_id: &str) -> String {
        self.endpoint.replace(USER_ID_PLACEHOLDER, user_id)
    }

    /// Inbound silence tolerated before the channel is presumed dead.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
