use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::{FrameType, MAX_FRAME_SIZE};
use crate::messages::{IdentifyRequest, SubscriptionRequest};

/// Errors from decoding an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too large ({0} bytes)")]
    Oversized(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} frame has no data")]
    MissingData(&'static str),

    #[error("invalid payload: {0}")]
    Invalid(String),
}

/// Envelope for every frame the server pushes.
///
/// The `data` field uses `serde_json::value::RawValue` so the payload is only
/// decoded once the frame type is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<serde_json::value::RawValue>>,
    /// Server emission time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Optional per-channel monotonic counter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl InboundFrame {
    /// Decodes a text frame, enforcing [`MAX_FRAME_SIZE`].
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(FrameError::Oversized(text.len()));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Deserializes the payload into the given type.
    pub fn parse_data<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        match &self.data {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Deserializes a payload that may be a single object or an array of
    /// objects. Array order is preserved.
    pub fn parse_batch<T: DeserializeOwned>(&self) -> Result<Vec<T>, FrameError> {
        let raw = self
            .data
            .as_ref()
            .ok_or(FrameError::MissingData(self.frame_type.as_str()))?
            .get();
        if raw.trim_start().starts_with('[') {
            Ok(serde_json::from_str(raw)?)
        } else {
            Ok(vec![serde_json::from_str(raw)?])
        }
    }
}

/// A frame sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl OutboundFrame {
    /// Creates a frame with an arbitrary type and optional payload.
    pub fn new(frame_type: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            frame_type: frame_type.into(),
            data,
        }
    }

    /// Creates a payload-less heartbeat frame.
    pub fn heartbeat() -> Self {
        Self::new(FrameType::Heartbeat.as_str(), None)
    }

    /// Creates the identify frame sent right after the socket opens.
    pub fn identify(req: &IdentifyRequest) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            FrameType::Identify.as_str(),
            Some(serde_json::to_value(req)?),
        ))
    }

    /// Creates a subscribe control frame.
    pub fn subscribe(req: &SubscriptionRequest) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            FrameType::Subscribe.as_str(),
            Some(serde_json::to_value(req)?),
        ))
    }

    /// Creates an unsubscribe control frame.
    pub fn unsubscribe(req: &SubscriptionRequest) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            FrameType::Unsubscribe.as_str(),
            Some(serde_json::to_value(req)?),
        ))
    }

    /// Serializes the frame to its wire text.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
