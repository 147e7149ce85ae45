use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time allowed for the server to acknowledge the identify frame.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often a heartbeat frame is sent on an open channel.
///
/// The channel is presumed dead when nothing arrives for twice this long.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum inbound frame size in bytes (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Close code sent by the server when the bearer token is rejected or revoked.
pub const CLOSE_CODE_UNAUTHORIZED: u16 = 4001;

/// Normal closure (RFC 6455).
pub const CLOSE_CODE_NORMAL: u16 = 1000;

/// Client name advertised in the identify frame.
pub const CLIENT_NAME: &str = concat!("fleetsync/", env!("CARGO_PKG_VERSION"));

/// Push channel frame type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    // Handshake
    #[serde(rename = "identify")]
    Identify,
    #[serde(rename = "identified")]
    Identified,

    // Control frames from client to server
    #[serde(rename = "subscribe")]
    Subscribe,
    #[serde(rename = "unsubscribe")]
    Unsubscribe,

    // Liveness (both directions)
    #[serde(rename = "heartbeat")]
    Heartbeat,

    // Data frames from server to client
    #[serde(rename = "position")]
    Position,
    #[serde(rename = "device_status")]
    DeviceStatus,
    #[serde(rename = "event")]
    Event,

    // Out-of-band signals
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "info")]
    Info,

    /// Forward compatibility: unknown frame types deserialize here.
    #[serde(other)]
    Unknown,
}

impl FrameType {
    /// The wire name of this frame type.
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Identify => "identify",
            FrameType::Identified => "identified",
            FrameType::Subscribe => "subscribe",
            FrameType::Unsubscribe => "unsubscribe",
            FrameType::Heartbeat => "heartbeat",
            FrameType::Position => "position",
            FrameType::DeviceStatus => "device_status",
            FrameType::Event => "event",
            FrameType::Error => "error",
            FrameType::Info => "info",
            FrameType::Unknown => "unknown",
        }
    }
}

/// Error codes the server uses for authentication rejections.
pub const ERR_CODE_UNAUTHORIZED: i32 = 401;
pub const ERR_CODE_FORBIDDEN: i32 = 403;

/// Returns true if an error code reported during the handshake means the
/// credential was rejected.
pub fn is_auth_error_code(code: i32) -> bool {
    matches!(code, ERR_CODE_UNAUTHORIZED | ERR_CODE_FORBIDDEN)
}
