// Scriptable in-memory watcher service for tests and embedding.
//
// Plays the server side of the protocol: it acknowledges registrations,
// forwards emitted file events to registered channels, and can refuse
// connections, reject registrations, or drop every open channel on demand.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use trisync_common::protocol::watcher::WatcherMessage;
use trisync_common::types::ProjectId;

use super::transport::{WatcherConnector, WatcherTransport};
use crate::error::TransportError;

#[derive(Debug)]
enum Inbound {
    Message(WatcherMessage),
    Close,
}

#[derive(Debug, Default)]
struct State {
    connect_attempts: usize,
    fail_next: usize,
    fail_all: bool,
    reject: Option<String>,
    registered: HashMap<ProjectId, Vec<mpsc::UnboundedSender<Inbound>>>,
    open: Vec<mpsc::UnboundedSender<Inbound>>,
    client_messages: Vec<WatcherMessage>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<State>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Refuse every connection attempt until turned off.
    pub fn fail_all_connects(&self, fail: bool) {
        self.lock().fail_all = fail;
    }

    /// Answer `register` with `error{reason}` while set.
    pub fn reject_registrations(&self, reason: Option<&str>) {
        self.lock().reject = reason.map(str::to_string);
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Every message clients have sent, in order.
    pub fn client_messages(&self) -> Vec<WatcherMessage> {
        self.lock().client_messages.clone()
    }

    /// Channels currently registered for `project_id`.
    pub fn registered_channels(&self, project_id: &ProjectId) -> usize {
        let mut state = self.lock();
        state.registered.get_mut(project_id).map_or(0, |links| {
            links.retain(|tx| !tx.is_closed());
            links.len()
        })
    }

    /// Deliver a server message to every channel registered for `project_id`.
    /// Returns how many channels received it.
    pub fn emit(&self, project_id: &ProjectId, message: WatcherMessage) -> usize {
        let mut state = self.lock();
        let Some(links) = state.registered.get_mut(project_id) else {
            return 0;
        };
        links.retain(|tx| tx.send(Inbound::Message(message.clone())).is_ok());
        links.len()
    }

    /// Close every open channel, as if the service went away.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        for tx in state.open.drain(..) {
            let _ = tx.send(Inbound::Close);
        }
        state.registered.clear();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WatcherConnector for MemoryConnector {
    type Transport = MemoryTransport;

    async fn connect(&self) -> Result<MemoryTransport, TransportError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.fail_all {
            return Err(TransportError::Connect("connection refused".into()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        state.open.push(inbox_tx.clone());
        Ok(MemoryTransport {
            connector: self.clone(),
            replies: VecDeque::new(),
            inbox_tx,
            inbox_rx,
            closed: false,
        })
    }
}

pub struct MemoryTransport {
    connector: MemoryConnector,
    replies: VecDeque<WatcherMessage>,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    inbox_rx: mpsc::UnboundedReceiver<Inbound>,
    closed: bool,
}

impl WatcherTransport for MemoryTransport {
    async fn send(&mut self, message: WatcherMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut state = self.connector.lock();
        state.client_messages.push(message.clone());

        match message {
            WatcherMessage::Register { project_id, .. } => {
                if let Some(reason) = state.reject.clone() {
                    self.replies.push_back(WatcherMessage::Error { error: reason });
                } else {
                    state.registered.entry(project_id.clone()).or_default().push(self.inbox_tx.clone());
                    self.replies.push_back(WatcherMessage::Registered { project_id });
                }
            }
            WatcherMessage::Unregister { project_id } => {
                if let Some(links) = state.registered.get_mut(&project_id) {
                    links.retain(|tx| !tx.same_channel(&self.inbox_tx));
                }
                self.replies.push_back(WatcherMessage::Unregistered { project_id });
            }
            other => {
                return Err(TransportError::Protocol(format!(
                    "`{}` is not a client message",
                    other.type_name()
                )));
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<WatcherMessage>, TransportError> {
        if self.closed {
            return Ok(None);
        }
        if let Some(reply) = self.replies.pop_front() {
            return Ok(Some(reply));
        }
        match self.inbox_rx.recv().await {
            Some(Inbound::Message(message)) => Ok(Some(message)),
            Some(Inbound::Close) | None => {
                self.closed = true;
                Ok(None)
            }
        }
    }
}
