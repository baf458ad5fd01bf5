//! Socket transport to the IM gateway.
//!
//! The connection state machine talks to the network only through
//! [`Connector`] and [`ChatSocket`], which carry text frames and nothing
//! else. [`WsConnector`] is the production implementation on top of
//! `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::credential::AccountCredential;

/// Opens sockets. One call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        credential: &AccountCredential,
    ) -> Result<Box<dyn ChatSocket>, TransportError>;
}

/// An open, bidirectional text-frame socket.
///
/// `recv_text` must be cancel-safe: the connection loop polls it inside
/// `tokio::select!` alongside timers and commands.
#[async_trait]
pub trait ChatSocket: Send {
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError>;

    /// Next text frame, or `None` once the peer has closed.
    async fn recv_text(&mut self) -> Option<Result<String, TransportError>>;

    /// Close the socket. Errors are swallowed; the socket is released
    /// either way.
    async fn close(&mut self);
}

/// Headers the web client presents on the upgrade request.
const BROWSER_HEADERS: &[(&str, &str)] = &[
    ("accept-language", "zh-CN,zh;q=0.9"),
    ("cache-control", "no-cache"),
    ("origin", "https://www.goofish.com"),
    ("pragma", "no-cache"),
    (
        "user-agent",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
    ),
];

/// WebSocket connector for the IM gateway.
pub struct WsConnector {
    ws_url: String,
}

impl WsConnector {
    /// * `ws_url` - gateway URL, e.g. `wss://wss-goofish.dingtalk.com/`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        credential: &AccountCredential,
    ) -> Result<Box<dyn ChatSocket>, TransportError> {
        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(format!("invalid gateway URL: {e}")))?;

        let headers = request.headers_mut();
        for &(name, value) in BROWSER_HEADERS {
            headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        }
        let cookie = HeaderValue::from_str(&credential.cookies)
            .map_err(|e| TransportError::Connect(format!("invalid cookie header: {e}")))?;
        headers.insert(HeaderName::from_static("cookie"), cookie);

        let (stream, _response) = connect_async(request).await.map_err(|e| {
            TransportError::Connect(format!("failed to connect to {}: {e}", self.ws_url))
        })?;

        tracing::info!(
            account_id = %credential.account_id,
            "Connected to IM gateway at {}",
            self.ws_url,
        );

        Ok(Box::new(WsSocket { stream }))
    }
}

/// A live WebSocket to the gateway.
pub struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl ChatSocket for WsSocket {
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv_text(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => tracing::trace!("Ignoring non-UTF-8 binary frame"),
                },
                Ok(Message::Ping(_) | Message::Pong(_)) => {
                    // Handled automatically by tungstenite.
                }
                Ok(Message::Close(frame)) => {
                    tracing::info!(?frame, "IM gateway closed the socket");
                    return None;
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "Error while closing socket");
        }
    }
}

/// Socket-level failures. All are recoverable by reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Failed to establish the connection.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The connect did not complete within the configured timeout.
    #[error("connect timed out")]
    Timeout,

    #[error("send failed: {0}")]
    Send(String),

    /// A write did not complete within the write timeout.
    #[error("write timed out")]
    WriteTimeout,

    #[error("receive failed: {0}")]
    Receive(String),

    /// The peer closed the socket.
    #[error("connection closed by peer")]
    Closed,
}
