//! Transport seam between the session client and the network.
//!
//! A [`Connector`] opens one [`Transport`] per connection attempt; the client
//! never holds more than one at a time. The WebSocket implementation lives
//! here too; tests plug in their own connectors.

use std::sync::Once;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::reconnect::{is_clean_close, CLOSE_ABNORMAL, CLOSE_NO_STATUS};
use crate::state::SessionIdentity;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint `{url}`: {reason}")]
    InvalidEndpoint { url: String, reason: &'static str },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("connection closed")]
    Closed,
}

/// How a channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Dropped without a close handshake.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ABNORMAL, reason)
    }

    /// Closed on purpose by the peer.
    pub fn is_clean(&self) -> bool {
        is_clean_close(self.code)
    }
}

/// What the next read from a channel produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    Closed(CloseInfo),
}

/// One open bidirectional text channel.
///
/// `recv` must be cancel safe: the client races it against timers and
/// commands.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next text frame, or how the channel ended. Errors are folded into
    /// [`Incoming::Closed`].
    async fn recv(&mut self) -> Incoming;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Opens channels for a session identity.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        identity: &SessionIdentity,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Endpoint URL for `identity` under `base_url`.
///
/// `https` maps to `wss`, `http` to `ws`; `ws`/`wss` are used as given.
pub fn endpoint_url(base_url: &str, identity: &SessionIdentity) -> Result<String, TransportError> {
    let invalid = |reason| TransportError::InvalidEndpoint {
        url: base_url.to_string(),
        reason,
    };

    let (scheme, rest) = base_url
        .split_once("://")
        .ok_or_else(|| invalid("missing scheme"))?;
    let ws_scheme = match scheme.to_ascii_lowercase().as_str() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        _ => return Err(invalid("unsupported scheme")),
    };
    let host = rest.trim_end_matches('/');
    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    Ok(format!(
        "{ws_scheme}://{host}/cocreation/ws/{}/{}",
        identity.meeting_id, identity.user_id
    ))
}

/// Make `ring` the process-wide rustls provider unless one is set already.
fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            log::debug!("rustls crypto provider already installed");
        }
    });
}

/// Connects over WebSocket to `{base}/cocreation/ws/{meeting}/{user}`.
///
/// `wss` endpoints use rustls with the bundled webpki roots.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        identity: &SessionIdentity,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let url = endpoint_url(&self.base_url, identity)?;
        if url.starts_with("wss://") {
            install_crypto_provider();
        }
        log::debug!("Connecting to {url}");
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        Ok(Box::new(WsTransport { stream }))
    }
}

/// WebSocket channel.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Incoming {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Incoming::Text(text.as_str().to_owned()),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Incoming::Text(text),
                    Err(_) => log::warn!("Skipping non-UTF-8 binary frame ({} bytes)", data.len()),
                },
                Some(Ok(Message::Close(frame))) => {
                    return Incoming::Closed(match frame {
                        Some(frame) => CloseInfo::new(u16::from(frame.code), frame.reason.as_str()),
                        None => CloseInfo::new(CLOSE_NO_STATUS, ""),
                    });
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Incoming::Closed(CloseInfo::abnormal(e.to_string())),
                None => return Incoming::Closed(CloseInfo::abnormal("stream ended")),
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        match self.stream.close(Some(frame)).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => {}
            Err(e) => return Err(e.into()),
        }
        // Wait for the peer's close reply.
        while let Some(Ok(_)) = self.stream.next().await {}
        Ok(())
    }
}
