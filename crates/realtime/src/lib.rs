//! Real-time synchronization core for the fleet dashboard.
//!
//! Maintains one long-lived push channel per session, replays topic
//! subscriptions on every reconnect, and reconciles position, device-status
//! and event pushes into a read-only entity view.

mod buffer;
pub mod config;
pub mod credentials;
mod facade;
mod manager;
mod pumps;
pub mod reconciler;
mod registry;
pub(crate) mod retry;
mod router;
mod timers;
pub mod transport;
pub mod types;
pub mod ws_client;

#[cfg(test)]
pub(crate) mod testing;

pub use fleetsync_protocol::envelope::OutboundFrame;
pub use fleetsync_protocol::messages::EntityId;

pub use config::{ConfigError, SyncConfig};
pub use credentials::{CredentialError, CredentialProvider, StaticCredentials, TokenStore};
pub use facade::SyncSession;
pub use reconciler::{DeviceSnapshot, EventRecord, PositionSnapshot};
pub use registry::Subscription;
pub use transport::{Channel, ChannelEvent, ConnectRequest, Connector, TransportError};
pub use types::{ConnectionState, Credential, ReconnectConfig, SendError, Signal, SyncUpdate};
pub use ws_client::WsConnector;
