//! WebSocket transport.
//!
//! Opens the socket with the bearer token on the upgrade request, then hands
//! the split stream to the read and write pumps.

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, header};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fleetsync_protocol::constants::MAX_FRAME_SIZE;

use crate::transport::{Channel, ConnectRequest, Connector, TransportError};

/// Outbound frames buffered per channel before the session treats the
/// writer as stuck.
const OUTBOUND_QUEUE: usize = 256;

/// Inbound events buffered per channel.
const INBOUND_QUEUE: usize = 256;

/// Frames above `MAX_FRAME_SIZE` are still read off the socket so the pump
/// can drop them without failing the connection.
const SOCKET_MESSAGE_LIMIT: usize = MAX_FRAME_SIZE * 4;

/// [`Connector`] over `tokio-tungstenite`.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Channel, TransportError>> {
        Box::pin(connect(request))
    }
}

fn build_request(
    request: &ConnectRequest,
) -> Result<tungstenite::handshake::client::Request, TransportError> {
    let mut req = request
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", request.credential.token))
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
    req.headers_mut().insert(header::AUTHORIZATION, bearer);
    Ok(req)
}

fn is_auth_status(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

fn map_connect_error(err: tungstenite::Error) -> TransportError {
    if let tungstenite::Error::Http(response) = &err {
        let status = response.status();
        if is_auth_status(status) {
            return TransportError::Unauthorized(format!("HTTP {status}"));
        }
    }
    TransportError::Ws(err)
}

async fn connect(request: ConnectRequest) -> Result<Channel, TransportError> {
    let req = build_request(&request)?;

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(SOCKET_MESSAGE_LIMIT);
    ws_config.max_frame_size = Some(SOCKET_MESSAGE_LIMIT);

    let (ws_stream, response) = tokio::time::timeout(
        request.timeout,
        tokio_tungstenite::connect_async_with_config(req, Some(ws_config), false),
    )
    .await
    .map_err(|_| TransportError::Timeout)?
    .map_err(map_connect_error)?;
    debug!(url = %request.url, status = %response.status(), "socket open");

    let (write, read) = ws_stream.split();
    let (text_tx, text_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let (control_tx, control_rx) = mpsc::channel::<tungstenite::Message>(16);
    let (events_tx, events_rx) = mpsc::channel(INBOUND_QUEUE);
    let cancel = CancellationToken::new();

    tokio::spawn(crate::pumps::write::write_pump(
        write,
        text_rx,
        control_rx,
        cancel.clone(),
    ));
    tokio::spawn(crate::pumps::read::read_pump(
        read,
        events_tx,
        control_tx,
        cancel.clone(),
    ));

    Ok(Channel::new(text_tx, events_rx, cancel))
}
