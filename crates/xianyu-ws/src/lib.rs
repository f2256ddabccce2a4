//! WebSocket transport for the Xianyu live chat session
//!
//! This crate provides a tokio-tungstenite transport that implements the
//! `Transport` trait from `xianyu-core`. Each `open` performs one upgrade
//! handshake with the configured headers and splits the socket into a
//! text-frame sink and stream.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;
use xianyu_core::{Connection, FrameSink, FrameStream, Transport, TransportError, WebSocketConfig};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Headers the handshake writes itself
const HANDSHAKE_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
];

// ----------------------------------------------------------------------------
// WebSocket Configuration
// ----------------------------------------------------------------------------

/// Configuration for the WebSocket transport
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// Upper bound on TCP connect, TLS and upgrade combined
    pub connect_timeout: Duration,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&WebSocketConfig> for WsTransportConfig {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }
}

// ----------------------------------------------------------------------------
// WebSocket Transport
// ----------------------------------------------------------------------------

/// WebSocket transport over tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WsTransport {
    config: WsTransportConfig,
}

impl WsTransport {
    pub fn new(config: WsTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(
        &self,
        endpoint: &str,
        headers: &[(String, String)],
    ) -> Result<Connection, TransportError> {
        let url = Url::parse(endpoint).map_err(|e| TransportError::InvalidConfiguration {
            reason: format!("invalid endpoint {endpoint}: {e}"),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidConfiguration {
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }

        let mut request = url.as_str().into_client_request().map_err(|e| {
            TransportError::InvalidConfiguration {
                reason: e.to_string(),
            }
        })?;
        for (name, value) in headers {
            if HANDSHAKE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::InvalidConfiguration {
                    reason: format!("header name {name}: {e}"),
                }
            })?;
            let value =
                HeaderValue::from_str(value).map_err(|e| TransportError::InvalidConfiguration {
                    reason: format!("header {name}: {e}"),
                })?;
            request.headers_mut().insert(name, value);
        }

        debug!(endpoint = %url, "Opening WebSocket connection");
        let timeout = self.config.connect_timeout;
        let (socket, _response) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout {
                duration_ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        info!(endpoint = %url, "WebSocket connected");

        let (sink, stream) = socket.split();
        Ok(Connection::new(
            Box::new(WsSink { sink }),
            Box::new(WsStream { stream }),
        ))
    }
}

// ----------------------------------------------------------------------------
// Connection Halves
// ----------------------------------------------------------------------------

struct WsSink {
    sink: SplitSink<Socket, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::SendFailed {
                reason: e.to_string(),
            })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed {
                reason: e.to_string(),
            })
    }
}

struct WsStream {
    stream: SplitStream<Socket>,
}

#[async_trait]
impl FrameStream for WsStream {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => {
                    return Some(Err(TransportError::ReceiveFailed {
                        reason: e.to_string(),
                    }))
                }
            };

            match message {
                Message::Text(text) => return Some(Ok(text)),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(e) => warn!("Dropping non-UTF-8 binary frame: {}", e),
                },
                Message::Close(frame) => {
                    debug!(?frame, "Server closed the WebSocket");
                    return None;
                }
                // Pongs are queued by tungstenite while reading
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}
