// Watcher registration gateway.
//
// One background session per registered project keeps a watcher channel open:
// connect, `register`, then pump file events to the subscriber until the
// channel drops. Lost channels are re-established with bounded exponential
// backoff; after `max_attempts` consecutive failures the registration parks in
// the terminal `disconnected` state until `reconnect` is called.
//
// Transport is abstracted via `WatcherConnector` for testability.

pub mod debounce;
pub mod local;
pub mod memory;
pub mod transport;
pub mod ws;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, trace, warn};
use trisync_common::path::normalize_path;
use trisync_common::protocol::events::SyncEvent;
use trisync_common::protocol::watcher::{WatcherEvent, WatcherMessage};
use trisync_common::types::{ProjectId, WatcherRegistration, WatcherStatus};
use uuid::Uuid;

use crate::error::{SyncError, TransportError};
use crate::events::EventBus;

pub use debounce::TreeRefreshDebouncer;
pub use local::LocalConnector;
pub use memory::MemoryConnector;
pub use transport::{ConfiguredConnector, WatcherConnector, WatcherTransport};
pub use ws::WsConnector;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
/// How long a closing session waits for `unregistered`.
const UNREGISTER_GRACE: Duration = Duration::from_millis(500);

// ── Configuration ───────────────────────────────────────────────────

/// Reconnection parameters.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay after the `failures`-th consecutive failure: base·2^(n-1), capped.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub reconnect: ReconnectPolicy,
    /// Bound on connect + `register` → `registered`.
    pub handshake_timeout: Duration,
    pub tree_refresh_window: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            handshake_timeout: Duration::from_secs(5),
            tree_refresh_window: Duration::from_millis(debounce::DEFAULT_TREE_REFRESH_MS),
        }
    }
}

// ── Subscription ────────────────────────────────────────────────────

/// Events for one registered project, plus its live watcher status.
///
/// Delivery is at-least-once and ordered per path. The stream survives
/// reconnects; it ends once the project is unregistered.
pub struct WatchSubscription {
    pub events: mpsc::Receiver<WatcherEvent>,
    pub status: watch::Receiver<WatcherStatus>,
}

// ── Gateway ─────────────────────────────────────────────────────────

struct Registration {
    info: WatcherRegistration,
    generation: u64,
    shutdown: watch::Sender<bool>,
    events_tx: mpsc::Sender<WatcherEvent>,
    status_tx: watch::Sender<WatcherStatus>,
    task: JoinHandle<()>,
}

struct Shared<C> {
    connector: C,
    config: GatewayConfig,
    bus: EventBus,
    registrations: Mutex<HashMap<ProjectId, Registration>>,
    next_generation: AtomicU64,
}

impl<C> Shared<C> {
    fn registrations(&self) -> MutexGuard<'_, HashMap<ProjectId, Registration>> {
        self.registrations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WatcherGateway<C: WatcherConnector> {
    shared: Arc<Shared<C>>,
}

impl<C: WatcherConnector> Clone for WatcherGateway<C> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

/// What a session task needs to run; owned by the task.
struct Session<C> {
    shared: Arc<Shared<C>>,
    project_id: ProjectId,
    workspace_path: String,
    container_id: String,
    generation: u64,
    shutdown: watch::Receiver<bool>,
    events_tx: mpsc::Sender<WatcherEvent>,
    status_tx: watch::Sender<WatcherStatus>,
}

enum PumpEnd {
    Shutdown,
    Lost(TransportError),
}

impl<C: WatcherConnector> WatcherGateway<C> {
    pub fn new(connector: C, config: GatewayConfig, bus: EventBus) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                bus,
                registrations: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.shared.connector
    }

    /// Register a project's workspace, replacing any existing registration.
    ///
    /// Waits for the first handshake outcome. A rejected registration is an
    /// error and leaves nothing registered; a transport failure is not, the
    /// session keeps retrying in the background.
    pub async fn register(
        &self,
        project_id: &ProjectId,
        workspace_path: &str,
        container_id: &str,
    ) -> Result<WatchSubscription, SyncError> {
        self.unregister(project_id);

        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, status) = watch::channel(WatcherStatus::Connecting);
        let (ready_tx, ready_rx) = oneshot::channel();

        self.spawn_session(
            project_id,
            workspace_path.to_string(),
            container_id.to_string(),
            events_tx,
            status_tx,
            Some(ready_tx),
        );

        match ready_rx.await {
            Ok(Err(TransportError::Rejected(reason))) => {
                self.shared.registrations().remove(project_id);
                Err(TransportError::Rejected(reason).into())
            }
            Ok(Err(e)) => {
                debug!(project_id = %project_id, error = %e, "watcher not yet connected, retrying");
                Ok(WatchSubscription { events, status })
            }
            Ok(Ok(())) | Err(_) => Ok(WatchSubscription { events, status }),
        }
    }

    /// Stop watching a project. Returns whether it was registered.
    pub fn unregister(&self, project_id: &ProjectId) -> bool {
        let Some(registration) = self.shared.registrations().remove(project_id) else {
            return false;
        };
        let _ = registration.shutdown.send(true);
        info!(project_id = %project_id, "watcher unregistered");
        true
    }

    /// Restart a registration's session, resetting its failure count. This is
    /// the way out of the terminal `disconnected` state.
    pub fn reconnect(&self, project_id: &ProjectId) -> Result<(), SyncError> {
        let (workspace_path, container_id, events_tx, status_tx) = {
            let registrations = self.shared.registrations();
            let registration = registrations
                .get(project_id)
                .ok_or_else(|| SyncError::NotFound(format!("watcher for project {project_id}")))?;
            let _ = registration.shutdown.send(true);
            (
                registration.info.workspace_path.clone(),
                registration.info.container_id.clone(),
                registration.events_tx.clone(),
                registration.status_tx.clone(),
            )
        };

        info!(project_id = %project_id, "watcher reconnect requested");
        self.spawn_session(project_id, workspace_path, container_id, events_tx, status_tx, None);
        Ok(())
    }

    pub fn status(&self, project_id: &ProjectId) -> Option<WatcherStatus> {
        self.shared.registrations().get(project_id).map(|r| r.info.status)
    }

    pub fn registration(&self, project_id: &ProjectId) -> Option<WatcherRegistration> {
        self.shared.registrations().get(project_id).map(|r| r.info.clone())
    }

    pub fn list(&self) -> Vec<WatcherRegistration> {
        let mut list: Vec<_> =
            self.shared.registrations().values().map(|r| r.info.clone()).collect();
        list.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        list
    }

    /// Unregister every project and wait for their sessions to end.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.shared.registrations().drain().map(|(_, r)| r).collect();
        for registration in drained {
            let _ = registration.shutdown.send(true);
            let _ = registration.task.await;
        }
    }

    fn spawn_session(
        &self,
        project_id: &ProjectId,
        workspace_path: String,
        container_id: String,
        events_tx: mpsc::Sender<WatcherEvent>,
        status_tx: watch::Sender<WatcherStatus>,
        ready: Option<oneshot::Sender<Result<(), TransportError>>>,
    ) {
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let info = WatcherRegistration {
            project_id: project_id.clone(),
            workspace_path: workspace_path.clone(),
            container_id: container_id.clone(),
            channel_id: Uuid::new_v4(),
            status: WatcherStatus::Connecting,
            registered_at: Utc::now(),
        };

        let session = Session {
            shared: Arc::clone(&self.shared),
            project_id: project_id.clone(),
            workspace_path,
            container_id,
            generation,
            shutdown: shutdown_rx,
            events_tx: events_tx.clone(),
            status_tx: status_tx.clone(),
        };

        // Hold the map lock across the spawn so the task's first status update
        // finds its own registration.
        let mut registrations = self.shared.registrations();
        let task = tokio::spawn(session.run(ready));
        registrations.insert(
            project_id.clone(),
            Registration { info, generation, shutdown, events_tx, status_tx, task },
        );
    }
}

impl<C: WatcherConnector> Session<C> {
    async fn run(mut self, mut ready: Option<oneshot::Sender<Result<(), TransportError>>>) {
        let policy = self.shared.config.reconnect.clone();
        let mut failures: u32 = 0;

        loop {
            if self.is_shutdown() {
                return;
            }

            self.set_status(WatcherStatus::Connecting);
            match self.handshake().await {
                Ok(transport) => {
                    failures = 0;
                    self.set_status(WatcherStatus::Watching);
                    info!(project_id = %self.project_id, "watcher registered");
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(()));
                    }

                    match self.pump(transport).await {
                        PumpEnd::Shutdown => return,
                        PumpEnd::Lost(reason) => {
                            warn!(project_id = %self.project_id, reason = %reason, "watcher channel lost");
                            self.set_status(WatcherStatus::Error);
                            if !self.wait(policy.base_delay).await {
                                return;
                            }
                        }
                    }
                }
                Err(TransportError::Rejected(reason)) => {
                    warn!(project_id = %self.project_id, reason = %reason, "watcher registration rejected");
                    self.set_status(WatcherStatus::Error);
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(TransportError::Rejected(reason)));
                    }
                    return;
                }
                Err(e) => {
                    failures += 1;
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(e.clone()));
                    }
                    if policy.exhausted(failures) {
                        warn!(
                            project_id = %self.project_id,
                            attempts = failures,
                            error = %e,
                            "watcher reconnect attempts exhausted"
                        );
                        self.set_status(WatcherStatus::Disconnected);
                        return;
                    }

                    let delay = policy.delay_after(failures);
                    debug!(
                        project_id = %self.project_id,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "watcher connect failed, backing off"
                    );
                    self.set_status(WatcherStatus::Error);
                    if !self.wait(delay).await {
                        return;
                    }
                }
            }
        }
    }

    /// Connect and register within the handshake timeout.
    async fn handshake(&self) -> Result<C::Transport, TransportError> {
        timeout(self.shared.config.handshake_timeout, self.connect_and_register())
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn connect_and_register(&self) -> Result<C::Transport, TransportError> {
        let mut transport = self.shared.connector.connect().await?;
        self.set_status(WatcherStatus::Connected);
        transport
            .send(WatcherMessage::Register {
                project_id: self.project_id.clone(),
                workspace_path: self.workspace_path.clone(),
                container_id: self.container_id.clone(),
            })
            .await?;

        loop {
            match transport.recv().await? {
                Some(WatcherMessage::Registered { project_id }) if project_id == self.project_id => {
                    return Ok(transport);
                }
                Some(WatcherMessage::Error { error }) => return Err(TransportError::Rejected(error)),
                Some(other) => {
                    trace!(message = other.type_name(), "ignoring pre-registration message");
                }
                None => return Err(TransportError::Closed),
            }
        }
    }

    async fn pump(&mut self, mut transport: C::Transport) -> PumpEnd {
        let mut debouncer = TreeRefreshDebouncer::new(self.shared.config.tree_refresh_window);

        loop {
            let deadline = debouncer.next_deadline();
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        self.flush(&mut debouncer, true);
                        let unregister = WatcherMessage::Unregister { project_id: self.project_id.clone() };
                        let _ = timeout(UNREGISTER_GRACE, async {
                            transport.send(unregister).await?;
                            while let Some(message) = transport.recv().await? {
                                if matches!(message, WatcherMessage::Unregistered { .. }) {
                                    break;
                                }
                            }
                            Ok::<_, TransportError>(())
                        })
                        .await;
                        return PumpEnd::Shutdown;
                    }
                }
                received = transport.recv() => match received {
                    Ok(Some(message)) => self.handle_message(message, &mut debouncer),
                    Ok(None) => {
                        self.flush(&mut debouncer, true);
                        return PumpEnd::Lost(TransportError::Closed);
                    }
                    Err(e) => {
                        self.flush(&mut debouncer, true);
                        return PumpEnd::Lost(e);
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush(&mut debouncer, false);
                }
            }
        }
    }

    fn handle_message(&self, message: WatcherMessage, debouncer: &mut TreeRefreshDebouncer) {
        let type_name = message.type_name();
        match message {
            WatcherMessage::Error { error } => {
                warn!(project_id = %self.project_id, error = %error, "watcher reported an error");
            }
            other => {
                let Some(mut event) = other.into_event() else {
                    trace!(message = type_name, "ignoring control message");
                    return;
                };
                match normalize_path(&event.path) {
                    Ok(path) => event.path = path,
                    Err(e) => {
                        warn!(path = %event.path, error = %e, "dropping watcher event with invalid path");
                        return;
                    }
                }

                debouncer.push_at(event.path.clone(), Instant::now());
                // Passes re-read every hash; a dropped event only delays the
                // pending mark.
                match self.events_tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(event)) => {
                        warn!(
                            project_id = %self.project_id,
                            path = %event.path,
                            "watcher event queue full, dropping event"
                        );
                    }
                    Err(TrySendError::Closed(_)) => {
                        trace!(project_id = %self.project_id, "watcher subscriber gone");
                    }
                }
            }
        }
    }

    /// Publish the pending tree refresh if its window elapsed, or right away
    /// when `force` is set.
    fn flush(&self, debouncer: &mut TreeRefreshDebouncer, force: bool) {
        let now = match (force, debouncer.next_deadline()) {
            (true, Some(deadline)) => deadline,
            _ => Instant::now(),
        };
        if let Some(paths) = debouncer.drain_ready_at(now) {
            self.shared
                .bus
                .publish(SyncEvent::TreeRefresh { project_id: self.project_id.clone(), paths });
        }
    }

    /// Sleep unless shut down first. Returns false on shutdown.
    async fn wait(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = sleep(delay) => !self.is_shutdown(),
            changed = self.shutdown.changed() => changed.is_ok() && !*self.shutdown.borrow(),
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Record a status change if this session still owns the registration.
    fn set_status(&self, status: WatcherStatus) {
        {
            let mut registrations = self.shared.registrations();
            match registrations.get_mut(&self.project_id) {
                Some(registration) if registration.generation == self.generation => {
                    if registration.info.status == status {
                        return;
                    }
                    registration.info.status = status;
                }
                _ => return,
            }
        }

        self.status_tx.send_replace(status);
        self.shared
            .bus
            .publish(SyncEvent::WatcherStatusChanged { project_id: self.project_id.clone(), status });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.delay_after(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 10, 10]);
    }

    #[test]
    fn exhausted_after_max_attempts() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }
}
