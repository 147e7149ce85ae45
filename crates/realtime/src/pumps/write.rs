//! WebSocket write pump.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

/// Writes queued text frames and control replies (pongs) to the socket.
///
/// On cancellation a normal close frame is sent before returning.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut text_rx: mpsc::Receiver<String>,
    mut control_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(ctrl) = control_rx.recv() => ctrl,
            text = text_rx.recv() => match text {
                Some(t) => tungstenite::Message::Text(t.into()),
                None => break,
            },
        };
        trace!("writing frame");
        if let Err(e) = write.send(msg).await {
            error!("WebSocket write error: {e}");
            cancel.cancel();
            return;
        }
    }

    let close = CloseFrame {
        code: CloseCode::Normal,
        reason: "client closing".into(),
    };
    let _ = write.send(tungstenite::Message::Close(Some(close))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::sink;

    fn capture_sink(
        tx: mpsc::Sender<tungstenite::Message>,
    ) -> impl SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin {
        Box::pin(sink::unfold(tx, |tx, msg: tungstenite::Message| async move {
            let _ = tx.send(msg).await;
            Ok::<_, tungstenite::Error>(tx)
        }))
    }

    #[tokio::test]
    async fn write_pump_forwards_text_then_closes_on_cancel() {
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let (text_tx, text_rx) = mpsc::channel(16);
        let (_control_tx, control_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let c = cancel.clone();
        let handle = tokio::spawn(write_pump(capture_sink(sink_tx), text_rx, control_rx, c));

        text_tx.send(r#"{"type":"heartbeat"}"#.into()).await.unwrap();
        let first = sink_rx.recv().await.unwrap();
        assert_eq!(
            first,
            tungstenite::Message::Text(r#"{"type":"heartbeat"}"#.into())
        );

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");

        match sink_rx.recv().await {
            Some(tungstenite::Message::Close(Some(frame))) => {
                assert_eq!(frame.code, CloseCode::Normal);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_pump_sends_control_frames() {
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let (_text_tx, text_rx) = mpsc::channel::<String>(16);
        let (control_tx, control_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        tokio::spawn(write_pump(capture_sink(sink_tx), text_rx, control_rx, cancel.clone()));

        control_tx
            .send(tungstenite::Message::Pong(vec![1, 2].into()))
            .await
            .unwrap();
        assert!(matches!(
            sink_rx.recv().await,
            Some(tungstenite::Message::Pong(_))
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn write_pump_stops_when_senders_dropped() {
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let (text_tx, text_rx) = mpsc::channel::<String>(16);
        let (_control_tx, control_rx) = mpsc::channel(16);

        drop(text_tx);
        write_pump(capture_sink(sink_tx), text_rx, control_rx, CancellationToken::new()).await;
        assert!(matches!(
            sink_rx.recv().await,
            Some(tungstenite::Message::Close(_))
        ));
    }
}
