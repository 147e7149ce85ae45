//! The seam between the session loop and the network.
//!
//! A [`Connector`] opens one [`Channel`] per attempt. The channel is a pair of
//! queues plus a cancellation token; whatever drives the socket (the
//! WebSocket pumps, or an in-memory peer in tests) sits on the other side.

use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use crate::types::Credential;

/// Errors from opening a channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("connect timed out")]
    Timeout,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("connection refused: {0}")]
    Refused(String),
}

impl TransportError {
    /// Returns true if retrying with the same credential is pointless.
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_))
    }
}

/// Parameters for one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: String,
    pub credential: Credential,
    pub timeout: Duration,
}

/// What the transport reports to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A text frame.
    Frame(String),
    /// The channel ended. `code` is the close code if the peer sent one.
    Closed { code: Option<u16>, reason: String },
}

/// An established channel.
///
/// Dropping the channel cancels its token, which stops the pumps and sends a
/// close frame.
#[derive(Debug)]
pub struct Channel {
    outbound: mpsc::Sender<String>,
    inbound: mpsc::Receiver<ChannelEvent>,
    cancel: CancellationToken,
}

impl Channel {
    pub fn new(
        outbound: mpsc::Sender<String>,
        inbound: mpsc::Receiver<ChannelEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            inbound,
            cancel,
        }
    }

    /// Queues a text frame without waiting.
    pub(crate) fn try_send(&self, text: String) -> Result<(), TrySendError<String>> {
        self.outbound.try_send(text)
    }

    /// Next event. A transport that went away without a close frame reports
    /// `Closed` with no code.
    pub(crate) async fn recv(&mut self) -> ChannelEvent {
        match self.inbound.recv().await {
            Some(event) => event,
            None => ChannelEvent::Closed {
                code: None,
                reason: "transport ended".into(),
            },
        }
    }

    /// Starts a graceful close.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens channels.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Channel, TransportError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display() {
        assert_eq!(TransportError::Timeout.to_string(), "connect timed out");
        let err = TransportError::Unauthorized("HTTP 401".into());
        assert_eq!(err.to_string(), "unauthorized: HTTP 401");
        assert!(err.is_auth());
        assert!(!TransportError::Refused("no route".into()).is_auth());
    }

    #[tokio::test]
    async fn dropped_channel_cancels_token() {
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (_in_tx, in_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let channel = Channel::new(out_tx, in_rx, cancel.clone());
        assert!(!cancel.is_cancelled());
        drop(channel);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn recv_reports_closed_when_transport_gone() {
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (in_tx, in_rx) = mpsc::channel(1);
        let mut channel = Channel::new(out_tx, in_rx, CancellationToken::new());

        in_tx.send(ChannelEvent::Frame("{}".into())).await.unwrap();
        drop(in_tx);
        assert_eq!(channel.recv().await, ChannelEvent::Frame("{}".into()));
        assert!(matches!(
            channel.recv().await,
            ChannelEvent::Closed { code: None, .. }
        ));
    }

    #[tokio::test]
    async fn try_send_reports_full_queue() {
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let (_in_tx, in_rx) = mpsc::channel(1);
        let channel = Channel::new(out_tx, in_rx, CancellationToken::new());
        channel.try_send("a".into()).unwrap();
        assert!(matches!(
            channel.try_send("b".into()),
            Err(TrySendError::Full(_))
        ));
        assert_eq!(out_rx.recv().await.as_deref(), Some("a"));
    }
}
