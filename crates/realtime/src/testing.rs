//! In-memory transport for session tests.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::transport::{Channel, ChannelEvent, ConnectRequest, Connector, TransportError};

/// Connector that hands every attempt to the test.
pub(crate) struct MockConnector {
    attempts: mpsc::UnboundedSender<MockAttempt>,
}

pub(crate) fn mock_connector() -> (Arc<MockConnector>, mpsc::UnboundedReceiver<MockAttempt>) {
    let (attempts, rx) = mpsc::unbounded_channel();
    (Arc::new(MockConnector { attempts }), rx)
}

impl Connector for MockConnector {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Channel, TransportError>> {
        let (reply, rx) = oneshot::channel();
        let _ = self.attempts.send(MockAttempt { request, reply });
        Box::pin(async move {
            rx.await
                .unwrap_or_else(|_| Err(TransportError::Refused("mock attempt dropped".into())))
        })
    }
}

/// A pending connect attempt.
pub(crate) struct MockAttempt {
    pub(crate) request: ConnectRequest,
    reply: oneshot::Sender<Result<Channel, TransportError>>,
}

impl MockAttempt {
    /// Completes the attempt with a channel and returns the server end.
    pub(crate) fn accept(self) -> ServerSide {
        let (out_tx, from_client) = mpsc::channel(64);
        let (to_client, in_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let _ = self
            .reply
            .send(Ok(Channel::new(out_tx, in_rx, cancel.clone())));
        ServerSide {
            from_client,
            to_client,
            cancel,
        }
    }

    pub(crate) fn reject(self, err: TransportError) {
        let _ = self.reply.send(Err(err));
    }
}

/// The server end of a mock channel.
pub(crate) struct ServerSide {
    from_client: mpsc::Receiver<String>,
    to_client: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
}

impl ServerSide {
    /// Next frame written by the client, parsed.
    pub(crate) async fn next_frame(&mut self) -> serde_json::Value {
        let text = self.from_client.recv().await.expect("client channel closed");
        serde_json::from_str(&text).expect("client sent invalid JSON")
    }

    /// Every frame already written by the client.
    pub(crate) fn drain_frames(&mut self) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            frames.push(serde_json::from_str(&text).expect("client sent invalid JSON"));
        }
        frames
    }

    pub(crate) async fn push(&self, frame: serde_json::Value) {
        self.push_raw(&frame.to_string()).await;
    }

    pub(crate) async fn push_raw(&self, text: &str) {
        let _ = self.to_client.send(ChannelEvent::Frame(text.to_string())).await;
    }

    /// Simulates the peer closing the socket.
    pub(crate) async fn close(&self, code: Option<u16>, reason: &str) {
        let _ = self
            .to_client
            .send(ChannelEvent::Closed {
                code,
                reason: reason.to_string(),
            })
            .await;
    }

    /// True once the client closed or dropped its end.
    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
