use std::future::Future;

use trisync_common::protocol::watcher::WatcherMessage;

use crate::error::TransportError;

/// One open watcher channel.
///
/// `recv` must be cancel-safe: the gateway polls it inside `select!` next to
/// its shutdown signal and debounce timer.
pub trait WatcherTransport: Send + 'static {
    fn send(
        &mut self,
        message: WatcherMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next message, or `Ok(None)` once the peer closed the channel.
    fn recv(&mut self) -> impl Future<Output = Result<Option<WatcherMessage>, TransportError>> + Send;
}

/// Opens watcher channels. Called once per connection attempt.
pub trait WatcherConnector: Send + Sync + 'static {
    type Transport: WatcherTransport;

    fn connect(&self) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

/// Connector chosen at startup: a remote watcher service when a URL is
/// configured, the in-process filesystem watcher otherwise.
#[derive(Debug, Clone)]
pub enum ConfiguredConnector {
    Ws(super::WsConnector),
    Local(super::LocalConnector),
}

pub enum ConfiguredTransport {
    Ws(super::ws::WsTransport),
    Local(super::local::LocalTransport),
}

impl WatcherConnector for ConfiguredConnector {
    type Transport = ConfiguredTransport;

    async fn connect(&self) -> Result<ConfiguredTransport, TransportError> {
        match self {
            Self::Ws(connector) => connector.connect().await.map(ConfiguredTransport::Ws),
            Self::Local(connector) => connector.connect().await.map(ConfiguredTransport::Local),
        }
    }
}

impl WatcherTransport for ConfiguredTransport {
    async fn send(&mut self, message: WatcherMessage) -> Result<(), TransportError> {
        match self {
            Self::Ws(transport) => transport.send(message).await,
            Self::Local(transport) => transport.send(message).await,
        }
    }

    async fn recv(&mut self) -> Result<Option<WatcherMessage>, TransportError> {
        match self {
            Self::Ws(transport) => transport.recv().await,
            Self::Local(transport) => transport.recv().await,
        }
    }
}
