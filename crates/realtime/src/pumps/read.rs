//! WebSocket read pump.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use fleetsync_protocol::constants::MAX_FRAME_SIZE;

use crate::transport::ChannelEvent;

/// Reads the socket and forwards text frames as [`ChannelEvent`]s.
///
/// Exactly one `Closed` event is emitted when the socket ends on its own.
/// Cancellation exits silently. Either way the token is cancelled on return
/// so the write pump stops too.
pub(crate) async fn read_pump<S>(
    mut read: S,
    events_tx: mpsc::Sender<ChannelEvent>,
    control_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let closed = loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break None,
            msg = read.next() => msg,
        };

        match msg {
            Some(Ok(tungstenite::Message::Text(text))) => {
                if text.len() > MAX_FRAME_SIZE {
                    warn!("frame too large ({} bytes), dropping", text.len());
                    continue;
                }
                if events_tx
                    .send(ChannelEvent::Frame(text.to_string()))
                    .await
                    .is_err()
                {
                    break None;
                }
            }
            Some(Ok(tungstenite::Message::Ping(data))) => {
                trace!("received ping, sending pong");
                let _ = control_tx.try_send(tungstenite::Message::Pong(data));
            }
            Some(Ok(tungstenite::Message::Close(frame))) => {
                let (code, reason) = match frame {
                    Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                    None => (None, String::new()),
                };
                debug!(?code, %reason, "received close frame");
                break Some(ChannelEvent::Closed { code, reason });
            }
            Some(Ok(_)) => {} // Binary, Pong: ignored
            Some(Err(e)) => {
                warn!("WebSocket read error: {e}");
                break Some(ChannelEvent::Closed {
                    code: None,
                    reason: e.to_string(),
                });
            }
            None => {
                debug!("WebSocket stream ended");
                break Some(ChannelEvent::Closed {
                    code: None,
                    reason: "stream ended".into(),
                });
            }
        }
    };

    if let Some(event) = closed {
        let _ = events_tx.send(event).await;
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    type Item = Result<tungstenite::Message, tungstenite::Error>;

    async fn run(items: Vec<Item>) -> (Vec<ChannelEvent>, Vec<tungstenite::Message>) {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (control_tx, mut control_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        read_pump(stream::iter(items), events_tx, control_tx, cancel.clone()).await;
        assert!(cancel.is_cancelled());

        let mut events = Vec::new();
        while let Ok(e) = events_rx.try_recv() {
            events.push(e);
        }
        let mut control = Vec::new();
        while let Ok(c) = control_rx.try_recv() {
            control.push(c);
        }
        (events, control)
    }

    #[tokio::test]
    async fn forwards_text_and_reports_stream_end() {
        let (events, _) = run(vec![Ok(tungstenite::Message::Text(
            r#"{"type":"heartbeat"}"#.into(),
        ))])
        .await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            ChannelEvent::Frame(r#"{"type":"heartbeat"}"#.into())
        );
        assert!(matches!(events[1], ChannelEvent::Closed { code: None, .. }));
    }

    #[tokio::test]
    async fn reports_close_code() {
        let close = CloseFrame {
            code: CloseCode::from(4001),
            reason: "token revoked".into(),
        };
        let (events, _) = run(vec![
            Ok(tungstenite::Message::Close(Some(close))),
            Ok(tungstenite::Message::Text("ignored".into())),
        ])
        .await;
        assert_eq!(
            events,
            vec![ChannelEvent::Closed {
                code: Some(4001),
                reason: "token revoked".into()
            }]
        );
    }

    #[tokio::test]
    async fn answers_ping_with_pong() {
        let (events, control) = run(vec![Ok(tungstenite::Message::Ping(vec![7].into()))]).await;
        assert_eq!(control.len(), 1);
        assert!(matches!(control[0], tungstenite::Message::Pong(_)));
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn drops_oversized_frames() {
        let huge = "x".repeat(MAX_FRAME_SIZE + 1);
        let (events, _) = run(vec![
            Ok(tungstenite::Message::Text(huge.into())),
            Ok(tungstenite::Message::Text("small".into())),
        ])
        .await;
        assert_eq!(events[0], ChannelEvent::Frame("small".into()));
    }

    #[tokio::test]
    async fn read_error_closes() {
        let (events, _) = run(vec![Err(tungstenite::Error::ConnectionClosed)]).await;
        assert!(matches!(events[0], ChannelEvent::Closed { code: None, .. }));
    }

    #[tokio::test]
    async fn cancel_exits_without_closed_event() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (control_tx, _control_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let pending = stream::pending::<Item>();

        let c = cancel.clone();
        let handle = tokio::spawn(async move {
            read_pump(pending, events_tx, control_tx, c).await;
        });
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");
        assert!(events_rx.recv().await.is_none());
    }
}
