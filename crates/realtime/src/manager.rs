//! The session event loop.
//!
//! One task owns the channel, the registry, the timers and the retry state.
//! Facade commands, connect results, channel events, deadlines and credential
//! changes are handled one at a time, so nothing here needs locking. Every
//! connect attempt and every timer carries a generation; results tagged with
//! an older generation are discarded.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace, warn};

use fleetsync_protocol::constants::{CLIENT_NAME, CLOSE_CODE_UNAUTHORIZED, is_auth_error_code};
use fleetsync_protocol::envelope::OutboundFrame;
use fleetsync_protocol::messages::IdentifyRequest;

use crate::config::SyncConfig;
use crate::reconciler::Reconciler;
use crate::registry::{Subscription, SubscriptionRegistry, unsubscribe_frame};
use crate::retry::RetryState;
use crate::router::{MessageRouter, Routed};
use crate::timers::{TimerKind, Timers};
use crate::transport::{Channel, ChannelEvent, ConnectRequest, Connector, TransportError};
use crate::types::{ConnectionState, Credential, SendError, Signal, SyncUpdate};

pub(crate) type Reply = oneshot::Sender<Result<(), SendError>>;

/// Requests from the facade.
#[derive(Debug)]
pub(crate) enum Command {
    Start,
    Stop,
    Subscribe(Subscription),
    Unsubscribe(Subscription),
    Send {
        frame: OutboundFrame,
        reply: Reply,
    },
    SendWhenOpen {
        frame: OutboundFrame,
        timeout: Duration,
        reply: Reply,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Result of a connect attempt, tagged with the generation that started it.
struct Attempt {
    generation: u64,
    result: Result<Channel, TransportError>,
}

struct QueuedSend {
    frame: OutboundFrame,
    /// `None` when the timeout is too large to represent; waits until open
    /// or stopped.
    deadline: Option<Instant>,
    reply: Reply,
}

/// Handles shared between the loop and the facade.
pub(crate) struct ManagerHandles {
    pub(crate) state_tx: watch::Sender<ConnectionState>,
    pub(crate) subscriptions_tx: watch::Sender<Vec<Subscription>>,
    pub(crate) updates: broadcast::Sender<SyncUpdate>,
    pub(crate) reconciler: Reconciler,
}

pub(crate) struct ConnectionManager {
    config: SyncConfig,
    connector: Arc<dyn Connector>,
    credentials: watch::Receiver<Option<Credential>>,
    credentials_live: bool,

    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    subscriptions_tx: watch::Sender<Vec<Subscription>>,
    updates: broadcast::Sender<SyncUpdate>,

    registry: SubscriptionRegistry,
    router: MessageRouter,
    reconciler: Reconciler,
    retry: RetryState,
    timers: Timers,

    generation: u64,
    channel: Option<Channel>,
    /// Credential the current attempt or channel was opened with.
    identity: Option<Credential>,
    attempt_task: Option<JoinHandle<()>>,
    attempts_tx: mpsc::UnboundedSender<Attempt>,
    attempts_rx: mpsc::UnboundedReceiver<Attempt>,
    heartbeat_acked: bool,
    queued: VecDeque<QueuedSend>,
}

impl ConnectionManager {
    pub(crate) fn new(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        credentials: watch::Receiver<Option<Credential>>,
        handles: ManagerHandles,
    ) -> Self {
        let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();
        Self {
            config,
            connector,
            credentials,
            credentials_live: true,
            state: ConnectionState::Disconnected,
            state_tx: handles.state_tx,
            subscriptions_tx: handles.subscriptions_tx,
            updates: handles.updates,
            registry: SubscriptionRegistry::default(),
            router: MessageRouter::default(),
            reconciler: handles.reconciler,
            retry: RetryState::default(),
            timers: Timers::default(),
            generation: 0,
            channel: None,
            identity: None,
            attempt_task: None,
            attempts_tx,
            attempts_rx,
            heartbeat_acked: false,
            queued: VecDeque::new(),
        }
    }

    /// Runs until shutdown or until every facade handle is dropped.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;

                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).is_break() {
                            break;
                        }
                    }
                    None => {
                        self.stop();
                        break;
                    }
                },

                Some(attempt) = self.attempts_rx.recv() => self.on_attempt(attempt),

                event = recv_channel(&mut self.channel) => self.on_channel_event(event),

                () = sleep_until_opt(deadline) => self.on_deadline(),

                changed = self.credentials.changed(), if self.credentials_live => {
                    match changed {
                        Ok(()) => self.on_credential_changed(),
                        Err(_) => {
                            debug!("credential provider dropped");
                            self.credentials_live = false;
                        }
                    }
                }
            }
        }
        debug!("session loop exited");
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn handle_command(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::Start => self.start(),
            Command::Stop => self.stop(),
            Command::Subscribe(sub) => {
                if self.registry.subscribe(sub.clone()) {
                    debug!(topic = %sub.topic, total = self.registry.len(), "subscribed");
                    self.publish_subscriptions();
                    if self.state.is_open()
                        && let Some(frame) = self.registry.frame_for(&sub)
                    {
                        let _ = self.write(&frame);
                    }
                }
                if self.state == ConnectionState::Disconnected {
                    self.start();
                }
            }
            Command::Unsubscribe(sub) => {
                let was_sent = self.registry.unsubscribe(&sub);
                self.publish_subscriptions();
                if self.registry.is_empty() {
                    debug!("no topics left, channel stays up");
                }
                if was_sent
                    && self.state.is_open()
                    && let Some(frame) = unsubscribe_frame(&sub)
                {
                    let _ = self.write(&frame);
                }
            }
            Command::Send { frame, reply } => {
                let result = if self.state.is_open() {
                    self.write(&frame)
                } else {
                    Err(SendError::NotOpen)
                };
                let _ = reply.send(result);
            }
            Command::SendWhenOpen {
                frame,
                timeout,
                reply,
            } => {
                if self.state.is_open() {
                    let _ = reply.send(self.write(&frame));
                } else {
                    trace!(frame_type = %frame.frame_type, "queueing frame until open");
                    self.queued.push_back(QueuedSend {
                        frame,
                        deadline: Instant::now().checked_add(timeout),
                        reply,
                    });
                }
            }
            Command::Shutdown(done) => {
                self.stop();
                let _ = done.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn start(&mut self) {
        if self.state != ConnectionState::Disconnected {
            return;
        }
        info!("starting session");
        self.retry.reset();
        self.connect();
    }

    /// Closes everything and returns to `Disconnected`. Subscriptions stay.
    ///
    /// `Closing` and `Disconnected` are published in the same loop turn, so a
    /// watch receiver usually only observes `Disconnected`.
    fn stop(&mut self) {
        if self.state != ConnectionState::Disconnected {
            info!(state = ?self.state, "stopping session");
            self.set_state(ConnectionState::Closing);
        }
        self.teardown();
        self.timers.cancel_all();
        self.retry.reset();
        self.generation += 1;
        self.identity = None;
        for q in self.queued.drain(..) {
            let _ = q.reply.send(Err(SendError::Stopped));
        }
        self.set_state(ConnectionState::Disconnected);
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Starts a new attempt under a fresh generation.
    fn connect(&mut self) {
        self.teardown();
        self.generation += 1;
        let generation = self.generation;

        let current = self.credentials.borrow_and_update().clone();
        let Some(credential) = current else {
            warn!(generation, "no credential available");
            self.identity = None;
            self.park(Signal::CredentialMissing);
            return;
        };

        let request = ConnectRequest {
            url: self.config.endpoint_for(&credential.user_id),
            credential: credential.clone(),
            timeout: self.config.connect_timeout,
        };
        self.identity = Some(credential);
        self.set_state(ConnectionState::Connecting);
        info!(generation, attempt = self.retry.attempt(), url = %request.url, "connecting");

        let connector = self.connector.clone();
        let tx = self.attempts_tx.clone();
        self.attempt_task = Some(tokio::spawn(async move {
            let result = connector.connect(request).await;
            let _ = tx.send(Attempt { generation, result });
        }));
    }

    fn on_attempt(&mut self, attempt: Attempt) {
        if attempt.generation != self.generation || self.state != ConnectionState::Connecting {
            debug!(
                generation = attempt.generation,
                current = self.generation,
                "discarding stale connect result"
            );
            return;
        }
        self.attempt_task = None;

        let channel = match attempt.result {
            Ok(channel) => channel,
            Err(e) if e.is_auth() => {
                self.auth_rejected(e.to_string());
                return;
            }
            Err(e) => {
                warn!(generation = self.generation, error = %e, "connect failed");
                self.schedule_reconnect();
                return;
            }
        };

        self.router.reset();
        self.heartbeat_acked = false;
        self.channel = Some(channel);
        self.set_state(ConnectionState::Authenticating);

        let user_id = self
            .identity
            .as_ref()
            .map(|c| c.user_id.clone())
            .unwrap_or_default();
        let identify = match OutboundFrame::identify(&IdentifyRequest {
            user_id,
            client: CLIENT_NAME.into(),
        }) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "cannot encode identify frame");
                self.fail_channel("identify encoding failed");
                return;
            }
        };
        if self.write(&identify).is_err() {
            return;
        }
        self.timers.schedule(
            TimerKind::Handshake,
            self.generation,
            Instant::now() + self.config.handshake_timeout,
        );
    }

    fn on_identified(&mut self) {
        self.timers.cancel(TimerKind::Handshake);
        self.set_state(ConnectionState::Open);
        info!(generation = self.generation, "channel open");

        let now = Instant::now();
        self.timers.schedule(
            TimerKind::Heartbeat,
            self.generation,
            now + self.config.heartbeat_interval,
        );
        self.timers.schedule(
            TimerKind::Liveness,
            self.generation,
            now + self.config.liveness_timeout(),
        );

        let replay = self.registry.replay();
        debug!(count = replay.len(), "replaying subscriptions");
        for frame in &replay {
            if self.write(frame).is_err() {
                return;
            }
        }

        while self.state.is_open() {
            let Some(q) = self.queued.pop_front() else {
                break;
            };
            let result = self.write(&q.frame);
            let _ = q.reply.send(result);
        }
    }

    /// Handles an unexpected loss of the channel or attempt.
    fn fail_channel(&mut self, reason: &str) {
        warn!(generation = self.generation, state = ?self.state, reason, "channel lost");
        let healthy = self.state.is_open() && self.heartbeat_acked;
        self.teardown();
        if healthy {
            self.retry.reset();
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let reconnect = &self.config.reconnect;
        let delay = self.retry.on_failure(reconnect);
        let attempt = self.retry.attempt();
        if self.retry.take_ceiling_crossing(reconnect) {
            warn!(attempt, "reconnect attempt ceiling reached");
            self.emit(SyncUpdate::Signal(Signal::PersistentFailure { attempts: attempt }));
        }

        let at = Instant::now() + delay;
        self.timers.schedule(TimerKind::Backoff, self.generation, at);
        info!(attempt, delay_secs = delay.as_secs_f64(), "reconnecting after backoff");
        self.set_state(ConnectionState::Backoff {
            attempt,
            next_retry_at: Some(at),
        });
    }

    fn auth_rejected(&mut self, reason: String) {
        warn!(generation = self.generation, %reason, "credential rejected");
        self.teardown();
        self.park(Signal::AuthRejected { reason });
    }

    /// Waits for a new credential with no retry scheduled.
    fn park(&mut self, signal: Signal) {
        self.timers.cancel(TimerKind::Backoff);
        self.set_state(ConnectionState::Backoff {
            attempt: self.retry.attempt(),
            next_retry_at: None,
        });
        self.emit(SyncUpdate::Signal(signal));
    }

    /// Drops the channel and any in-flight attempt along with their timers.
    /// The registry forgets what it sent.
    fn teardown(&mut self) {
        if let Some(task) = self.attempt_task.take() {
            task.abort();
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
            let stats = self.router.stats();
            debug!(
                generation = self.generation,
                frames = stats.frames,
                malformed = stats.malformed,
                unknown = stats.unknown,
                "channel closed"
            );
        }
        self.timers.cancel(TimerKind::Handshake);
        self.timers.cancel(TimerKind::Heartbeat);
        self.timers.cancel(TimerKind::Liveness);
        self.timers.cancel(TimerKind::Backoff);
        self.registry.reset_runtime();
        self.heartbeat_acked = false;
    }

    fn on_credential_changed(&mut self) {
        let current = self.credentials.borrow_and_update().clone();
        if self.state == ConnectionState::Disconnected {
            return;
        }
        match current {
            None => {
                info!("credential revoked, closing channel");
                self.teardown();
                self.park(Signal::CredentialMissing);
            }
            Some(credential) => {
                let same_user = self
                    .identity
                    .as_ref()
                    .is_some_and(|c| c.user_id == credential.user_id);
                if self.state.is_open() && same_user {
                    debug!("token refreshed, keeping open channel");
                    self.identity = Some(credential);
                    return;
                }
                info!(user_id = %credential.user_id, "new credential, reconnecting");
                self.retry.reset();
                self.connect();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Channel traffic
    // -----------------------------------------------------------------------

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Frame(text) => self.on_frame(&text),
            ChannelEvent::Closed { code, reason } => {
                if code == Some(CLOSE_CODE_UNAUTHORIZED) {
                    let reason = if reason.is_empty() {
                        "credential revoked by server".to_string()
                    } else {
                        reason
                    };
                    self.auth_rejected(reason);
                } else {
                    self.fail_channel(&format!("closed by peer (code {code:?}): {reason}"));
                }
            }
        }
    }

    fn on_frame(&mut self, text: &str) {
        if self.state.is_open() {
            self.timers.schedule(
                TimerKind::Liveness,
                self.generation,
                Instant::now() + self.config.liveness_timeout(),
            );
        }

        match self.router.route(text) {
            Routed::Identified => {
                if self.state == ConnectionState::Authenticating {
                    self.on_identified();
                } else {
                    debug!(state = ?self.state, "unexpected identified frame");
                }
            }
            Routed::Heartbeat => {
                if self.state.is_open() {
                    trace!("heartbeat acknowledged");
                    self.heartbeat_acked = true;
                }
            }
            Routed::Positions(batch) => {
                let updates = self.reconciler.positions(batch);
                self.emit_all(updates);
            }
            Routed::DeviceStatuses(batch) => {
                let updates = self.reconciler.device_statuses(batch);
                self.emit_all(updates);
            }
            Routed::Events(batch) => {
                let updates = self.reconciler.events(batch);
                self.emit_all(updates);
            }
            Routed::ServerError(payload) => {
                if self.state == ConnectionState::Authenticating
                    && payload.code.is_some_and(is_auth_error_code)
                {
                    self.auth_rejected(payload.message);
                    return;
                }
                warn!(code = ?payload.code, message = %payload.message, "server error");
                self.emit(SyncUpdate::Signal(Signal::ServerError {
                    code: payload.code,
                    message: payload.message,
                }));
            }
            Routed::Info(payload) => {
                info!(message = %payload.message, "server info");
                self.emit(SyncUpdate::Signal(Signal::ServerInfo {
                    message: payload.message,
                }));
            }
            Routed::Dropped => {}
        }
    }

    /// Queues a frame on the current channel. A full or closed queue fails the
    /// channel.
    fn write(&mut self, frame: &OutboundFrame) -> Result<(), SendError> {
        let text = frame
            .to_text()
            .map_err(|e| SendError::Encode(e.to_string()))?;
        let Some(channel) = &self.channel else {
            return Err(SendError::NotOpen);
        };
        match channel.try_send(text) {
            Ok(()) => {
                trace!(frame_type = %frame.frame_type, "frame queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.fail_channel("outbound queue full");
                Err(SendError::ChannelFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.fail_channel("outbound queue closed");
                Err(SendError::NotOpen)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn next_deadline(&self) -> Option<Instant> {
        let queued = self.queued.iter().filter_map(|q| q.deadline).min();
        match (self.timers.next_deadline(), queued) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();

        let mut i = 0;
        while i < self.queued.len() {
            if self.queued[i].deadline.is_some_and(|d| d <= now) {
                if let Some(q) = self.queued.remove(i) {
                    debug!(frame_type = %q.frame.frame_type, "queued frame timed out");
                    let _ = q.reply.send(Err(SendError::Timeout));
                }
            } else {
                i += 1;
            }
        }

        for (kind, generation) in self.timers.take_due(now) {
            if generation != self.generation {
                trace!(?kind, generation, "ignoring stale timer");
                continue;
            }
            match kind {
                TimerKind::Handshake => {
                    if self.state == ConnectionState::Authenticating {
                        self.fail_channel("handshake timed out");
                    }
                }
                TimerKind::Liveness => {
                    if self.state.is_open() {
                        self.fail_channel("no inbound traffic within liveness window");
                    }
                }
                TimerKind::Heartbeat => {
                    if self.state.is_open() && self.write(&OutboundFrame::heartbeat()).is_ok() {
                        self.timers.schedule(
                            TimerKind::Heartbeat,
                            self.generation,
                            now + self.config.heartbeat_interval,
                        );
                    }
                }
                TimerKind::Backoff => {
                    if matches!(
                        self.state,
                        ConnectionState::Backoff {
                            next_retry_at: Some(_),
                            ..
                        }
                    ) {
                        self.connect();
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Outputs
    // -----------------------------------------------------------------------

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "state transition");
        self.state = state.clone();
        self.state_tx.send_replace(state);
    }

    fn emit(&self, update: SyncUpdate) {
        // No receivers is fine.
        let _ = self.updates.send(update);
    }

    fn emit_all(&self, updates: Vec<SyncUpdate>) {
        for update in updates {
            self.emit(update);
        }
    }

    fn publish_subscriptions(&self) {
        self.subscriptions_tx.send_replace(self.registry.snapshot());
    }
}

async fn recv_channel(channel: &mut Option<Channel>) -> ChannelEvent {
    match channel {
        Some(ch) => ch.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
