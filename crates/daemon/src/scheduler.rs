// Background sync scheduler.
//
// One timer task per project drives reconciliation passes at a fixed
// interval. Manual passes share the engine's per-project gate with the timer,
// so at most one pass runs per project: a timer tick that finds the gate taken
// is skipped, a manual pass waits for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use trisync_common::protocol::events::{SyncEvent, SyncTrigger};
use trisync_common::types::{
    ErrorKind, ProjectId, ProjectSyncStatus, SyncPhase, SyncResult, SyncStats,
};

use crate::engine::{PassGuard, ReconciliationEngine};
use crate::events::EventBus;
use crate::remote::RemoteStore;
use crate::workspace::WorkspaceProvider;

/// How long `shutdown_all` waits for in-flight passes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct Session {
    interval: Duration,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone)]
struct Tracked {
    phase: SyncPhase,
    last_result: Option<SyncResult>,
}

impl Default for Tracked {
    fn default() -> Self {
        Self { phase: SyncPhase::Idle, last_result: None }
    }
}

#[derive(Default)]
struct State {
    sessions: HashMap<ProjectId, Session>,
    tracked: HashMap<ProjectId, Tracked>,
    next_generation: u64,
}

struct Inner<W, R> {
    engine: Arc<ReconciliationEngine<W, R>>,
    bus: EventBus,
    state: Mutex<State>,
}

pub struct SyncScheduler<W, R> {
    inner: Arc<Inner<W, R>>,
}

impl<W, R> Clone for SyncScheduler<W, R> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<W: WorkspaceProvider, R: RemoteStore> SyncScheduler<W, R> {
    pub fn new(engine: Arc<ReconciliationEngine<W, R>>, bus: EventBus) -> Self {
        Self { inner: Arc::new(Inner { engine, bus, state: Mutex::new(State::default()) }) }
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine<W, R>> {
        &self.inner.engine
    }

    /// Arm background sync for a project. Starting an already-running project
    /// replaces its timer with one at the new interval. The first pass runs
    /// immediately.
    pub fn start(&self, project_id: &ProjectId, interval: Duration) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut state = self.inner.lock();
        state.next_generation += 1;
        let generation = state.next_generation;

        if let Some(previous) = state.sessions.remove(project_id) {
            let _ = previous.shutdown.send(true);
            debug!(project_id = %project_id, "replacing background sync session");
        }

        // Announced before the task exists: its first tick fires immediately.
        let interval_ms = interval.as_millis() as u64;
        info!(project_id = %project_id, interval_ms, "background sync started");
        self.inner.bus.publish(SyncEvent::Started { project_id: project_id.clone(), interval_ms });

        let task = tokio::spawn(run_session(
            Arc::clone(&self.inner),
            project_id.clone(),
            interval,
            generation,
            shutdown_rx,
        ));
        state.sessions.insert(
            project_id.clone(),
            Session { interval, shutdown: shutdown_tx, task },
        );
        state.tracked.entry(project_id.clone()).or_default();
    }

    /// Disarm background sync. An in-flight pass runs to completion.
    /// Returns `false` if the project had no session.
    pub fn stop(&self, project_id: &ProjectId) -> bool {
        self.inner.halt(project_id)
    }

    pub fn is_running(&self, project_id: &ProjectId) -> bool {
        self.inner.lock().sessions.contains_key(project_id)
    }

    /// Run one pass now, waiting for any pass already in flight.
    pub async fn manual_sync(&self, project_id: &ProjectId) -> SyncResult {
        let guard = self.inner.engine.begin(project_id).await;
        self.inner.execute(guard, SyncTrigger::Manual).await
    }

    pub fn snapshot(&self, project_id: &ProjectId) -> ProjectSyncStatus {
        let (tracked, interval) = {
            let state = self.inner.lock();
            (
                state.tracked.get(project_id).cloned().unwrap_or_default(),
                state.sessions.get(project_id).map(|s| s.interval),
            )
        };

        let open_conflicts = match self.inner.engine.conflicts().count(project_id) {
            Ok(count) => count,
            Err(e) => {
                warn!(project_id = %project_id, error = %e, "failed to count conflicts");
                0
            }
        };

        ProjectSyncStatus {
            phase: tracked.phase,
            running: interval.is_some(),
            interval_ms: interval.map(|i| i.as_millis() as u64),
            in_flight: self.inner.engine.is_busy(project_id),
            last_result: tracked.last_result,
            open_conflicts,
            ..ProjectSyncStatus::idle(project_id.clone())
        }
    }

    /// Every project the scheduler has seen, sorted by id.
    pub fn snapshot_all(&self) -> Vec<ProjectSyncStatus> {
        let mut ids: Vec<ProjectId> = self.inner.lock().tracked.keys().cloned().collect();
        ids.sort();
        ids.iter().map(|id| self.snapshot(id)).collect()
    }

    /// Drop everything known about a project. Stops its session first.
    pub fn forget(&self, project_id: &ProjectId) {
        self.stop(project_id);
        self.inner.lock().tracked.remove(project_id);
    }

    /// Stop every session and wait (bounded) for in-flight passes.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<(ProjectId, Session)> = self.inner.lock().sessions.drain().collect();
        for (project_id, session) in sessions {
            let _ = session.shutdown.send(true);
            match tokio::time::timeout(SHUTDOWN_GRACE, session.task).await {
                Ok(Ok(())) => debug!(project_id = %project_id, "sync session drained"),
                Ok(Err(e)) => error!(project_id = %project_id, error = %e, "sync session panicked"),
                Err(_) => warn!(project_id = %project_id, "sync session did not drain in time"),
            }
        }
    }
}

impl<W: WorkspaceProvider, R: RemoteStore> Inner<W, R> {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the project's session and tell its task to exit.
    fn halt(&self, project_id: &ProjectId) -> bool {
        let removed = self.lock().sessions.remove(project_id);
        let Some(session) = removed else {
            return false;
        };
        let _ = session.shutdown.send(true);
        info!(project_id = %project_id, "background sync stopped");
        self.bus.publish(SyncEvent::Stopped { project_id: project_id.clone() });
        true
    }

    fn set_phase(&self, project_id: &ProjectId, phase: SyncPhase, result: Option<SyncResult>) {
        let mut state = self.lock();
        let tracked = state.tracked.entry(project_id.clone()).or_default();
        tracked.phase = phase;
        if result.is_some() {
            tracked.last_result = result;
        }
    }

    async fn execute(&self, guard: PassGuard, trigger: SyncTrigger) -> SyncResult {
        let project_id = guard.project_id().clone();
        self.set_phase(&project_id, SyncPhase::Syncing, None);
        self.bus.publish(SyncEvent::SyncStarted { project_id: project_id.clone(), trigger });

        let outcome = self.engine.reconcile(&guard).await;
        drop(guard);
        let timestamp = Utc::now();

        match outcome {
            Ok(stats) => {
                let phase = if stats.errors == 0 { SyncPhase::Synced } else { SyncPhase::Error };
                let result =
                    SyncResult { success: true, stats: stats.clone(), timestamp, error: None };
                self.set_phase(&project_id, phase, Some(result.clone()));
                self.bus.publish(SyncEvent::SyncCompleted { project_id, stats, timestamp });
                result
            }
            Err(e) => {
                let info = e.info();
                let phase = if info.kind == ErrorKind::Auth {
                    SyncPhase::Reauthenticate
                } else {
                    SyncPhase::Error
                };
                warn!(project_id = %project_id, error = %e, kind = info.kind.as_str(), "sync pass failed");
                let result = SyncResult {
                    success: false,
                    stats: SyncStats::default(),
                    timestamp,
                    error: Some(info.clone()),
                };
                self.set_phase(&project_id, phase, Some(result.clone()));
                self.bus.publish(SyncEvent::SyncFailed {
                    project_id: project_id.clone(),
                    error: info,
                    timestamp,
                });
                if phase == SyncPhase::Reauthenticate {
                    self.halt(&project_id);
                }
                result
            }
        }
    }
}

async fn run_session<W: WorkspaceProvider, R: RemoteStore>(
    inner: Arc<Inner<W, R>>,
    project_id: ProjectId,
    interval: Duration,
    generation: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if *shutdown.borrow() {
                    break;
                }
                let Some(guard) = inner.engine.try_begin(&project_id) else {
                    debug!(project_id = %project_id, "pass already in flight, skipping tick");
                    continue;
                };
                inner.execute(guard, SyncTrigger::Timer).await;
            }
        }
    }
    debug!(project_id = %project_id, generation, "sync session exited");
}
