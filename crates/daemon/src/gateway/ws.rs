// WebSocket watcher channel (tokio-tungstenite), JSON text frames.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use trisync_common::protocol::watcher::WatcherMessage;
use url::Url;

use super::transport::{WatcherConnector, WatcherTransport};
use crate::error::TransportError;

#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let parsed =
            Url::parse(url).map_err(|e| anyhow::anyhow!("invalid watcher url `{url}`: {e}"))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            anyhow::bail!("watcher url must use ws or wss, got `{}`", parsed.scheme());
        }
        Ok(Self { url: url.to_string() })
    }
}

impl WatcherConnector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self) -> Result<WsTransport, TransportError> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url = %self.url, "watcher channel connected");
        Ok(WsTransport { stream })
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WatcherTransport for WsTransport {
    async fn send(&mut self, message: WatcherMessage) -> Result<(), TransportError> {
        let text = serde_json::to_string(&message)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.stream.send(Message::Text(text.into())).await.map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<WatcherMessage>, TransportError> {
        loop {
            let Some(frame) = self.stream.next().await else {
                return Ok(None);
            };
            match frame.map_err(|_| TransportError::Closed)? {
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str())
                        .map(Some)
                        .map_err(|e| TransportError::Protocol(format!("invalid message: {e}")));
                }
                Message::Binary(_) => {
                    return Err(TransportError::Protocol("unexpected binary frame".into()));
                }
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!("skipping control frame");
                }
            }
        }
    }
}
