// Project sessions: the glue between the HTTP surface and the sync machinery.
//
// Opening a project records its owner, registers the workspace with the
// watcher gateway, and forwards watcher events into the FileRecord cache so
// touched files are flagged `pending` for the next pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trisync_common::protocol::watcher::WatcherEvent;
use trisync_common::types::{
    ConflictRecord, FileId, FileRecord, ProjectId, ProjectSyncStatus, ResolutionStrategy,
    SyncResult, WatcherStatus,
};
use uuid::Uuid;

use crate::engine::ReconciliationEngine;
use crate::error::SyncError;
use crate::events::{EventBus, Subscription};
use crate::gateway::{ConfiguredConnector, MemoryConnector, WatcherConnector, WatcherGateway};
use crate::remote::{ConfiguredRemote, MemoryRemoteStore, RemoteStore};
use crate::scheduler::SyncScheduler;
use crate::workspace::{LocalWorkspace, MemoryWorkspace, WorkspaceProvider};

/// The three collaborators a service runs against.
pub trait SyncBackend: Send + Sync + 'static {
    type Workspace: WorkspaceProvider;
    type Remote: RemoteStore;
    type Connector: WatcherConnector;
}

/// Production wiring: on-disk workspaces, configured remote and watcher.
pub struct DaemonBackend;

impl SyncBackend for DaemonBackend {
    type Workspace = LocalWorkspace;
    type Remote = ConfiguredRemote;
    type Connector = ConfiguredConnector;
}

/// Fully in-memory wiring for tests and embedding.
pub struct MemoryBackend;

impl SyncBackend for MemoryBackend {
    type Workspace = MemoryWorkspace;
    type Remote = MemoryRemoteStore;
    type Connector = MemoryConnector;
}

/// Container id sent with `register` when the caller gives none.
pub const DEFAULT_CONTAINER_ID: &str = "local";

struct OpenProject {
    owner: Uuid,
    container_id: String,
    /// `None` while the watcher registration is still in flight.
    feeder: Option<JoinHandle<()>>,
}

/// Aggregate view for `GET /sync/engine/status`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub open_projects: usize,
    pub running_sessions: usize,
    pub in_flight: usize,
    pub open_conflicts: usize,
    pub disconnected_watchers: usize,
    pub projects: Vec<ProjectSyncStatus>,
}

pub struct SyncService<B: SyncBackend> {
    scheduler: SyncScheduler<B::Workspace, B::Remote>,
    gateway: WatcherGateway<B::Connector>,
    bus: EventBus,
    default_interval: Duration,
    projects: Mutex<HashMap<ProjectId, OpenProject>>,
}

impl<B: SyncBackend> SyncService<B> {
    pub fn new(
        engine: Arc<ReconciliationEngine<B::Workspace, B::Remote>>,
        gateway: WatcherGateway<B::Connector>,
        bus: EventBus,
        default_interval: Duration,
    ) -> Self {
        Self {
            scheduler: SyncScheduler::new(engine, bus.clone()),
            gateway,
            bus,
            default_interval,
            projects: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine<B::Workspace, B::Remote>> {
        self.scheduler.engine()
    }

    pub fn scheduler(&self) -> &SyncScheduler<B::Workspace, B::Remote> {
        &self.scheduler
    }

    pub fn gateway(&self) -> &WatcherGateway<B::Connector> {
        &self.gateway
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    fn projects(&self) -> MutexGuard<'_, HashMap<ProjectId, OpenProject>> {
        self.projects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The user who opened the project, if it is open.
    pub fn owner_of(&self, project_id: &ProjectId) -> Option<Uuid> {
        self.projects().get(project_id).map(|p| p.owner)
    }

    /// Open (or re-open) a project for `owner`.
    ///
    /// Ownership is claimed before the watcher is registered, so a project
    /// open for another user (or being opened by one) fails with `NotOwner`.
    /// A rejected watcher registration fails the open and leaves nothing
    /// behind. A watcher that merely can't connect yet does not; the gateway
    /// keeps retrying and the status shows it.
    pub async fn open_project(
        &self,
        owner: Uuid,
        project_id: &ProjectId,
        container_id: Option<String>,
        interval: Option<Duration>,
    ) -> Result<ProjectSyncStatus, SyncError> {
        let container_id = container_id.unwrap_or_else(|| DEFAULT_CONTAINER_ID.to_string());
        let workspace_path = self.engine().workspace().workspace_path(project_id);

        let claimed = {
            let mut projects = self.projects();
            match projects.get(project_id) {
                Some(open) if open.owner != owner => {
                    return Err(SyncError::NotOwner(project_id.clone()));
                }
                Some(_) => false,
                None => {
                    let pending =
                        OpenProject { owner, container_id: container_id.clone(), feeder: None };
                    projects.insert(project_id.clone(), pending);
                    true
                }
            }
        };

        let subscription =
            match self.gateway.register(project_id, &workspace_path, &container_id).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    if claimed {
                        self.release_claim(project_id, owner);
                    }
                    return Err(e);
                }
            };
        let feeder = tokio::spawn(feed_watcher_events(
            Arc::clone(self.engine().files()),
            project_id.clone(),
            subscription.events,
        ));

        {
            let mut projects = self.projects();
            let open = projects.entry(project_id.clone()).or_insert_with(|| OpenProject {
                owner,
                container_id: container_id.clone(),
                feeder: None,
            });
            if open.owner != owner {
                feeder.abort();
                return Err(SyncError::NotOwner(project_id.clone()));
            }
            open.container_id = container_id.clone();
            if let Some(previous) = open.feeder.replace(feeder) {
                previous.abort();
            }
        }
        info!(project_id = %project_id, owner = %owner, container_id, "project opened");

        if let Some(interval) = interval {
            self.scheduler.start(project_id, interval);
        }
        Ok(self.status(project_id))
    }

    /// Drop a claim whose registration failed, unless it has since completed.
    fn release_claim(&self, project_id: &ProjectId, owner: Uuid) {
        let mut projects = self.projects();
        if projects.get(project_id).is_some_and(|p| p.owner == owner && p.feeder.is_none()) {
            projects.remove(project_id);
        }
    }

    /// Stop syncing and watching a project. Returns `false` if it wasn't open.
    pub fn close_project(&self, project_id: &ProjectId) -> bool {
        let Some(open) = self.projects().remove(project_id) else {
            return false;
        };
        self.scheduler.forget(project_id);
        self.gateway.unregister(project_id);
        if let Some(feeder) = open.feeder {
            feeder.abort();
        }
        self.engine().files().evict(project_id);
        info!(project_id = %project_id, container_id = %open.container_id, "project closed");
        true
    }

    pub fn status(&self, project_id: &ProjectId) -> ProjectSyncStatus {
        ProjectSyncStatus {
            watcher: self.gateway.status(project_id),
            ..self.scheduler.snapshot(project_id)
        }
    }

    /// Statuses of every project `owner` has open, sorted by id.
    pub fn statuses_for(&self, owner: Uuid) -> Vec<ProjectSyncStatus> {
        let mut ids: Vec<ProjectId> = self
            .projects()
            .iter()
            .filter(|(_, p)| p.owner == owner)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids.iter().map(|id| self.status(id)).collect()
    }

    /// Aggregate over the projects `owner` has open.
    pub fn engine_status(&self, owner: Uuid) -> EngineStatus {
        let projects = self.statuses_for(owner);

        EngineStatus {
            open_projects: projects.len(),
            running_sessions: projects.iter().filter(|p| p.running).count(),
            in_flight: projects.iter().filter(|p| p.in_flight).count(),
            open_conflicts: projects.iter().map(|p| p.open_conflicts).sum(),
            disconnected_watchers: projects
                .iter()
                .filter(|p| p.watcher == Some(WatcherStatus::Disconnected))
                .count(),
            projects,
        }
    }

    pub fn start_background(&self, project_id: &ProjectId, interval: Option<Duration>) {
        self.scheduler.start(project_id, interval.unwrap_or(self.default_interval));
    }

    pub fn stop_background(&self, project_id: &ProjectId) -> bool {
        self.scheduler.stop(project_id)
    }

    pub async fn manual_sync(&self, project_id: &ProjectId) -> SyncResult {
        self.scheduler.manual_sync(project_id).await
    }

    pub fn list_conflicts(&self, project_id: &ProjectId) -> Result<Vec<ConflictRecord>, SyncError> {
        self.engine().list_conflicts(project_id)
    }

    /// The open conflict for `file_id`, in whichever project holds it.
    pub fn find_conflict(&self, file_id: &FileId) -> Result<Option<ConflictRecord>, SyncError> {
        self.engine().conflicts().find(file_id).map_err(SyncError::storage)
    }

    pub async fn resolve_conflict(
        &self,
        file_id: FileId,
        strategy: ResolutionStrategy,
        content: Option<String>,
    ) -> Result<ConflictRecord, SyncError> {
        self.engine().resolve_conflict(file_id, strategy, content).await
    }

    /// Tracked files without their cached content.
    pub fn files(&self, project_id: &ProjectId) -> Result<Vec<FileRecord>, SyncError> {
        let records = self.engine().files().list(project_id).map_err(SyncError::storage)?;
        Ok(records.iter().map(FileRecord::summary).collect())
    }

    pub fn reconnect_watcher(&self, project_id: &ProjectId) -> Result<(), SyncError> {
        self.gateway.reconnect(project_id)
    }

    pub fn subscribe(&self, project_id: Option<ProjectId>) -> Subscription {
        self.bus.subscribe(project_id)
    }

    pub async fn shutdown(&self) {
        let feeders: Vec<JoinHandle<()>> =
            self.projects().drain().filter_map(|(_, open)| open.feeder).collect();
        self.scheduler.shutdown_all().await;
        self.gateway.shutdown().await;
        for feeder in feeders {
            feeder.abort();
        }
        debug!("sync service shut down");
    }
}

async fn feed_watcher_events(
    files: Arc<crate::store::FileRecordStore>,
    project_id: ProjectId,
    mut events: tokio::sync::mpsc::Receiver<WatcherEvent>,
) {
    while let Some(event) = events.recv().await {
        match files.mark_pending(&project_id, &event.path) {
            Ok(0) => {}
            Ok(count) => {
                debug!(project_id = %project_id, path = %event.path, count, "records marked pending")
            }
            Err(e) => warn!(project_id = %project_id, path = %event.path, error = %e, "failed to mark records pending"),
        }
    }
    debug!(project_id = %project_id, "watcher event feed ended");
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use trisync_common::protocol::watcher::WatcherMessage;
    use trisync_common::types::{ErrorKind, SyncPhase, SyncStatus};

    use super::*;
    use crate::engine::EngineConfig;
    use crate::gateway::GatewayConfig;
    use crate::store::{ConflictStore, FileRecordStore, MetaDb};

    struct Harness {
        service: SyncService<MemoryBackend>,
        workspace: MemoryWorkspace,
        connector: MemoryConnector,
    }

    fn harness() -> Harness {
        let db = Arc::new(MetaDb::open_in_memory().unwrap());
        let workspace = MemoryWorkspace::new();
        let connector = MemoryConnector::new();
        let bus = EventBus::new();
        let engine = Arc::new(ReconciliationEngine::new(
            Arc::new(workspace.clone()),
            Arc::new(MemoryRemoteStore::new()),
            Arc::new(FileRecordStore::new(db.clone())),
            Arc::new(ConflictStore::new(db)),
            bus.clone(),
            EngineConfig::default(),
        ));
        let gateway = WatcherGateway::new(connector.clone(), GatewayConfig::default(), bus.clone());
        let service = SyncService::new(engine, gateway, bus, Duration::from_secs(30));
        Harness { service, workspace, connector }
    }

    fn project() -> ProjectId {
        ProjectId::parse("demo").unwrap()
    }

    #[tokio::test]
    async fn open_registers_watcher_and_records_owner() {
        let h = harness();
        let owner = Uuid::new_v4();
        let status = h.service.open_project(owner, &project(), None, None).await.unwrap();

        assert_eq!(status.watcher, Some(WatcherStatus::Watching));
        assert!(!status.running);
        assert_eq!(h.service.owner_of(&project()), Some(owner));
        assert_eq!(h.connector.registered_channels(&project()), 1);
        assert_eq!(h.service.statuses_for(owner).len(), 1);
        assert!(h.service.statuses_for(Uuid::new_v4()).is_empty());
    }

    #[tokio::test]
    async fn rejected_registration_fails_open() {
        let h = harness();
        h.connector.reject_registrations(Some("unknown container"));
        let err = h.service.open_project(Uuid::new_v4(), &project(), None, None).await.unwrap_err();
        assert!(err.to_string().contains("unknown container"));
        assert_eq!(h.service.owner_of(&project()), None);
    }

    #[tokio::test]
    async fn concurrent_opens_by_two_users_have_one_owner() {
        let h = harness();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let (pa, pb) = (project(), project());
        let (a, b) = tokio::join!(
            h.service.open_project(alice, &pa, None, None),
            h.service.open_project(bob, &pb, None, None),
        );
        let (winner, loser_err) = match (a, b) {
            (Ok(_), Err(e)) => (alice, e),
            (Err(e), Ok(_)) => (bob, e),
            other => panic!("expected exactly one open to succeed, got {other:?}"),
        };
        assert!(matches!(loser_err, SyncError::NotOwner(_)));
        assert_eq!(loser_err.kind(), ErrorKind::Forbidden);
        assert_eq!(h.service.owner_of(&project()), Some(winner));

        // The owner can re-open; the other user still can't.
        h.service.open_project(winner, &project(), None, None).await.unwrap();
        let other = if winner == alice { bob } else { alice };
        let err = h.service.open_project(other, &project(), None, None).await.unwrap_err();
        assert!(matches!(err, SyncError::NotOwner(_)));
    }

    #[tokio::test]
    async fn watcher_events_mark_synced_files_pending() {
        let h = harness();
        h.workspace.insert(&project(), "src/a.rs", "fn a() {}");
        h.service.open_project(Uuid::new_v4(), &project(), None, None).await.unwrap();
        assert!(h.service.manual_sync(&project()).await.success);

        let message =
            WatcherMessage::FileChanged { file_path: "src/a.rs".into(), timestamp: Utc::now() };
        assert_eq!(h.connector.emit(&project(), message), 1);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let files = h.service.files(&project()).unwrap();
            if files[0].sync_status == SyncStatus::Pending {
                assert!(files[0].content.is_none());
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "record never marked pending");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn close_releases_everything() {
        let h = harness();
        h.service
            .open_project(Uuid::new_v4(), &project(), None, Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(h.service.status(&project()).running);

        assert!(h.service.close_project(&project()));
        assert!(!h.service.close_project(&project()));
        assert_eq!(h.service.owner_of(&project()), None);
        let status = h.service.status(&project());
        assert!(!status.running);
        assert_eq!(status.watcher, None);
        assert_eq!(status.phase, SyncPhase::Idle);
        assert!(!h.service.engine().files().is_cached(&project()));
    }

    #[tokio::test]
    async fn engine_status_aggregates_open_projects() {
        let h = harness();
        let owner = Uuid::new_v4();
        h.service.open_project(owner, &project(), None, None).await.unwrap();
        let other = ProjectId::parse("other").unwrap();
        h.service.open_project(owner, &other, None, Some(Duration::from_secs(60))).await.unwrap();

        let elsewhere = ProjectId::parse("elsewhere").unwrap();
        h.service.open_project(Uuid::new_v4(), &elsewhere, None, None).await.unwrap();

        let status = h.service.engine_status(owner);
        assert_eq!(status.open_projects, 2);
        assert_eq!(status.running_sessions, 1);
        assert_eq!(status.projects[0].project_id, project());
        h.service.shutdown().await;
    }
}
