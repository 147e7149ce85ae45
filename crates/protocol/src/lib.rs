pub mod constants;
pub mod envelope;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::FrameType;
pub use envelope::{FrameError, InboundFrame, OutboundFrame};
pub use messages::{
    DeviceStatus, DeviceStatusPayload, EntityId, ErrorPayload, EventPayload, IdentifyRequest,
    InfoPayload, PositionPayload, SubscriptionRequest,
};
