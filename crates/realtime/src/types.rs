//! Public types for the synchronization core.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::reconciler::{DeviceSnapshot, EventRecord, PositionSnapshot};

/// Lifecycle state of the session's push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No channel and no pending retry.
    Disconnected,
    /// Socket open in progress.
    Connecting,
    /// Socket open, waiting for the server to acknowledge the identify frame.
    Authenticating,
    /// Handshake acknowledged; data flows.
    Open,
    /// A deliberate local close is in progress.
    Closing,
    /// Waiting to retry. `next_retry_at` is `None` while parked until the
    /// credential provider publishes a new credential.
    Backoff {
        attempt: u32,
        next_retry_at: Option<Instant>,
    },
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Returns true when parked waiting for a new credential.
    pub fn is_parked(&self) -> bool {
        matches!(
            self,
            ConnectionState::Backoff {
                next_retry_at: None,
                ..
            }
        )
    }
}

/// Identity and bearer token used to open the channel.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub user_id: String,
    pub token: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Out-of-band signals surfaced to the application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    /// The server pushed an `error` frame.
    ServerError { code: Option<i32>, message: String },
    /// The server pushed an `info` frame.
    ServerInfo { message: String },
    /// The reconnect attempt ceiling was reached. Retries continue at the
    /// maximum delay.
    PersistentFailure { attempts: u32 },
    /// The server rejected the credential. No retry until a new one arrives.
    AuthRejected { reason: String },
    /// No credential is available to open the channel.
    CredentialMissing,
}

/// Items of the facade's update stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum SyncUpdate {
    Position(PositionSnapshot),
    DeviceStatus(DeviceSnapshot),
    Event(EventRecord),
    Signal(Signal),
}

/// Errors returned to callers of `send`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("channel is not open")]
    NotOpen,

    #[error("channel did not open before the send deadline")]
    Timeout,

    #[error("session stopped before the frame was sent")]
    Stopped,

    #[error("outbound queue is full")]
    ChannelFull,

    #[error("session is shut down")]
    SessionClosed,

    #[error("frame could not be encoded: {0}")]
    Encode(String),
}

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    #[serde(rename = "initial_delay_ms", with = "crate::config::millis")]
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    #[serde(rename = "max_delay_ms", with = "crate::config::millis")]
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Jitter as a fraction of the computed delay, in `[0, 1)`.
    pub jitter: f64,
    /// Failed attempts before a persistent-failure signal is raised.
    pub attempt_ceiling: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.25,
            attempt_ceiling: 5,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retrying after `attempt` previous failures (0-based),
    /// without jitter: `min(max_delay, initial_delay * factor^attempt)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// [`base_delay`](Self::base_delay) shifted by `unit * jitter`, where
    /// `unit` lies in `[-1.0, 1.0]`. Never exceeds `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let offset = base * self.jitter * unit.clamp(-1.0, 1.0);
        let secs = (base + offset).clamp(0.0, self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}
