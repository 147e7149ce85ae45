//! Inbound frame classification.
//!
//! The router never fails: undecodable frames, unknown types and payloads that
//! fail validation are logged and dropped so one bad frame cannot tear down a
//! healthy channel.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use fleetsync_protocol::constants::FrameType;
use fleetsync_protocol::envelope::{FrameError, InboundFrame};
use fleetsync_protocol::messages::{
    DeviceStatusPayload, ErrorPayload, EventPayload, InfoPayload, PositionPayload,
};

/// Result of routing one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Routed {
    Identified,
    Heartbeat,
    Positions(Vec<PositionPayload>),
    DeviceStatuses(Vec<DeviceStatusPayload>),
    Events(Vec<EventPayload>),
    ServerError(ErrorPayload),
    Info(InfoPayload),
    Dropped,
}

/// Per-channel frame counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RouterStats {
    pub(crate) frames: u64,
    pub(crate) malformed: u64,
    pub(crate) unknown: u64,
}

#[derive(Debug, Default)]
pub(crate) struct MessageRouter {
    last_sequence: Option<u64>,
    stats: RouterStats,
}

/// Used only to name an unknown frame type in diagnostics.
#[derive(Deserialize)]
struct TypeProbe {
    #[serde(rename = "type")]
    frame_type: String,
}

impl MessageRouter {
    /// Clears per-channel state. Called for every new channel.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn stats(&self) -> RouterStats {
        self.stats
    }

    pub(crate) fn route(&mut self, text: &str) -> Routed {
        self.stats.frames += 1;

        let frame = match InboundFrame::decode(text) {
            Ok(f) => f,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(error = %e, "dropping undecodable frame");
                return Routed::Dropped;
            }
        };
        self.track_sequence(frame.sequence);
        trace!(frame_type = frame.frame_type.as_str(), "routing frame");

        match frame.frame_type {
            FrameType::Identified => Routed::Identified,
            FrameType::Heartbeat => Routed::Heartbeat,
            FrameType::Position => self
                .batch(&frame, PositionPayload::validate)
                .map_or(Routed::Dropped, Routed::Positions),
            FrameType::DeviceStatus => self
                .batch(&frame, |_: &DeviceStatusPayload| Ok(()))
                .map_or(Routed::Dropped, Routed::DeviceStatuses),
            FrameType::Event => self
                .batch(&frame, |e: &EventPayload| {
                    if e.event_type.is_empty() {
                        Err(FrameError::Invalid("empty event type".into()))
                    } else {
                        Ok(())
                    }
                })
                .map_or(Routed::Dropped, Routed::Events),
            FrameType::Error => match frame.parse_data::<ErrorPayload>() {
                Ok(Some(p)) => Routed::ServerError(p),
                Ok(None) => Routed::ServerError(ErrorPayload {
                    code: None,
                    message: "unspecified server error".into(),
                }),
                Err(e) => self.malformed(&frame, &e),
            },
            FrameType::Info => match frame.parse_data::<InfoPayload>() {
                Ok(Some(p)) => Routed::Info(p),
                Ok(None) => self.malformed(&frame, &FrameError::MissingData("info")),
                Err(e) => self.malformed(&frame, &e),
            },
            FrameType::Unknown => {
                self.stats.unknown += 1;
                let name = serde_json::from_str::<TypeProbe>(text)
                    .map(|p| p.frame_type)
                    .unwrap_or_default();
                debug!(frame_type = %name, "dropping frame of unknown type");
                Routed::Dropped
            }
            FrameType::Identify | FrameType::Subscribe | FrameType::Unsubscribe => {
                debug!(
                    frame_type = frame.frame_type.as_str(),
                    "ignoring client-only frame from server"
                );
                Routed::Dropped
            }
        }
    }

    /// Decodes a single-or-array payload and drops elements that fail
    /// validation. Returns `None` when nothing usable remains.
    fn batch<T: DeserializeOwned>(
        &mut self,
        frame: &InboundFrame,
        validate: impl Fn(&T) -> Result<(), FrameError>,
    ) -> Option<Vec<T>> {
        let items = match frame.parse_batch::<T>() {
            Ok(items) => items,
            Err(e) => {
                self.malformed(frame, &e);
                return None;
            }
        };
        let mut valid = Vec::with_capacity(items.len());
        for item in items {
            match validate(&item) {
                Ok(()) => valid.push(item),
                Err(e) => {
                    self.malformed(frame, &e);
                }
            }
        }
        if valid.is_empty() { None } else { Some(valid) }
    }

    fn malformed(&mut self, frame: &InboundFrame, error: &dyn std::fmt::Display) -> Routed {
        self.stats.malformed += 1;
        warn!(
            frame_type = frame.frame_type.as_str(),
            error = %error,
            "dropping malformed payload"
        );
        Routed::Dropped
    }

    /// Logs gaps and rewinds. Never reorders or drops on sequence alone.
    fn track_sequence(&mut self, sequence: Option<u64>) {
        let Some(seq) = sequence else { return };
        if let Some(last) = self.last_sequence {
            if seq <= last {
                debug!(last, seq, "sequence rewind or duplicate");
            } else if seq > last.saturating_add(1) {
                debug!(last, seq, missed = seq - last - 1, "sequence gap");
            }
        }
        self.last_sequence = Some(seq);
    }
}
