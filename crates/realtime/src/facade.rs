//! The application-facing session handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::debug;

use fleetsync_protocol::envelope::OutboundFrame;
use fleetsync_protocol::messages::EntityId;

use crate::config::{ConfigError, SyncConfig};
use crate::credentials::CredentialProvider;
use crate::manager::{Command, ConnectionManager, ManagerHandles};
use crate::reconciler::{DeviceSnapshot, EventRecord, PositionSnapshot, Reconciler};
use crate::registry::Subscription;
use crate::transport::Connector;
use crate::types::{ConnectionState, SendError, SyncUpdate};
use crate::ws_client::WsConnector;

/// One synchronization session.
///
/// Cheap to clone; every clone drives the same event loop. The loop stops on
/// [`shutdown`](Self::shutdown) or once every clone is dropped.
///
/// Failures never surface as errors here: they show up as state transitions
/// and [`Signal`](crate::Signal)s on the update stream. Only sends report
/// errors, because the caller needs to know the frame was not delivered.
#[derive(Clone)]
pub struct SyncSession {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    subscriptions: watch::Receiver<Vec<Subscription>>,
    updates: broadcast::Sender<SyncUpdate>,
    reconciler: Reconciler,
}

impl SyncSession {
    /// Spawns the session loop on the current Tokio runtime. The session
    /// starts `Disconnected`.
    pub fn spawn(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        credentials: &dyn CredentialProvider,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (subscriptions_tx, subscriptions_rx) = watch::channel(Vec::new());
        let (updates, _) = broadcast::channel(config.update_buffer);
        let reconciler = Reconciler::new(&config);

        let manager = ConnectionManager::new(
            config,
            connector,
            credentials.watch(),
            ManagerHandles {
                state_tx,
                subscriptions_tx,
                updates: updates.clone(),
                reconciler: reconciler.clone(),
            },
        );
        tokio::spawn(manager.run(commands_rx));

        Ok(Self {
            commands: commands_tx,
            state: state_rx,
            subscriptions: subscriptions_rx,
            updates,
            reconciler,
        })
    }

    /// [`spawn`](Self::spawn) with the WebSocket transport.
    pub fn with_websocket(
        config: SyncConfig,
        credentials: &dyn CredentialProvider,
    ) -> Result<Self, ConfigError> {
        Self::spawn(config, Arc::new(WsConnector::new()), credentials)
    }

    fn command(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            debug!("session already shut down, command ignored");
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receiver of the latest connection state.
    ///
    /// Transitions are coalesced: a receiver that falls behind only sees the
    /// newest value, so transient states such as `Closing` may be skipped.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stream of reconciled entity updates and out-of-band signals.
    ///
    /// Receivers that fall more than `update_buffer` items behind skip ahead
    /// (`RecvError::Lagged`); the entity view stays authoritative.
    pub fn updates(&self) -> broadcast::Receiver<SyncUpdate> {
        self.updates.subscribe()
    }

    /// Opens the channel if the session is `Disconnected`.
    pub fn start(&self) {
        self.command(Command::Start);
    }

    /// Closes the channel and cancels every pending retry. Subscriptions are
    /// kept and replayed on the next `start`.
    pub fn stop(&self) {
        self.command(Command::Stop);
    }

    /// Adds a topic. Starts the session if it is `Disconnected`.
    pub fn subscribe(&self, subscription: Subscription) {
        self.command(Command::Subscribe(subscription));
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.command(Command::Unsubscribe(subscription));
    }

    /// Topics currently registered.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.borrow().clone()
    }

    /// Sends a control frame on the open channel. Rejected with
    /// [`SendError::NotOpen`] in any other state.
    pub async fn send(&self, frame: OutboundFrame) -> Result<(), SendError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { frame, reply })
            .map_err(|_| SendError::SessionClosed)?;
        rx.await.unwrap_or(Err(SendError::SessionClosed))
    }

    /// Sends a control frame once the channel is open, or fails with
    /// [`SendError::Timeout`] if that does not happen within `timeout`.
    pub async fn send_when_open(
        &self,
        frame: OutboundFrame,
        timeout: Duration,
    ) -> Result<(), SendError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SendWhenOpen {
                frame,
                timeout,
                reply,
            })
            .map_err(|_| SendError::SessionClosed)?;
        rx.await.unwrap_or(Err(SendError::SessionClosed))
    }

    pub fn current_position_of(&self, device_id: impl Into<EntityId>) -> Option<PositionSnapshot> {
        self.reconciler.read().position_of(&device_id.into())
    }

    pub fn current_status_of(&self, device_id: impl Into<EntityId>) -> Option<DeviceSnapshot> {
        self.reconciler.read().status_of(&device_id.into())
    }

    /// Recent events, oldest first.
    pub fn recent_events(&self) -> Vec<EventRecord> {
        self.reconciler.read().recent_events()
    }

    /// Positions that arrived older than the live snapshot, oldest first.
    pub fn stale_positions(&self) -> Vec<PositionSnapshot> {
        self.reconciler.read().stale_positions()
    }

    /// Stops the session and ends its event loop. Later calls are no-ops and
    /// sends fail with [`SendError::SessionClosed`].
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done)).is_ok() {
            let _ = rx.await;
        }
    }
}
