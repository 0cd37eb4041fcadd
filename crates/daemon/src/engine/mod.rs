// Reconciliation engine: one compare-and-transfer pass over a project.
//
// A pass walks the union of workspace files and remote files together with the
// tracked FileRecords. For each path it compares the current workspace hash
// with the base's workspace hash, and the current remote hash with the base's
// remote hash. The two stores hash differently and are never compared with
// each other:
//
//   neither changed           → synced, nothing moves
//   only remote changed       → pull remote (or delete local)
//   only local changed        → push local (or delete remote)
//   both changed              → same content, three-way merge, or a conflict
//
// Hashes are always re-read at the start of a pass; cached records only supply
// the base. Passes for one project are serialized by a per-project gate.

pub mod resolution;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use trisync_common::hash::{content_hash, ContentHash};
use trisync_common::merge::{get_merge_stats, merge, ConflictSpan};
use trisync_common::path::normalize_path;
use trisync_common::protocol::events::SyncEvent;
use trisync_common::types::{
    ConflictData, ConflictRecord, ConflictState, ConflictType, ErrorKind, FileId, FileRecord,
    ProjectId, ResolutionStrategy, SyncStats, SyncStatus, VersionSnapshot,
};

use crate::error::SyncError;
use crate::events::EventBus;
use crate::remote::{RemoteKey, RemoteStore};
use crate::store::{ConflictStore, FileRecordStore};
use crate::workspace::WorkspaceProvider;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on each individual read, write, or list.
    pub transfer_timeout: Duration,
    /// Total tries for a retryable transfer failure.
    pub transfer_attempts: u32,
    /// First retry delay; doubles on each further retry.
    pub retry_base_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transfer_timeout: Duration::from_secs(10),
            transfer_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
        }
    }
}

/// Exclusive right to run a pass for one project. Dropping it opens the gate.
pub struct PassGuard {
    project_id: ProjectId,
    _permit: OwnedMutexGuard<()>,
}

impl PassGuard {
    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }
}

/// What a pass observed for one path.
#[derive(Debug, Default)]
struct Observed {
    local: Option<String>,
    remote: Option<String>,
    record: Option<FileRecord>,
}

pub struct ReconciliationEngine<W, R> {
    workspace: Arc<W>,
    remote: Arc<R>,
    files: Arc<FileRecordStore>,
    conflicts: Arc<ConflictStore>,
    bus: EventBus,
    config: EngineConfig,
    gates: Mutex<HashMap<ProjectId, Arc<tokio::sync::Mutex<()>>>>,
}

impl<W: WorkspaceProvider, R: RemoteStore> ReconciliationEngine<W, R> {
    pub fn new(
        workspace: Arc<W>,
        remote: Arc<R>,
        files: Arc<FileRecordStore>,
        conflicts: Arc<ConflictStore>,
        bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self { workspace, remote, files, conflicts, bus, config, gates: Mutex::new(HashMap::new()) }
    }

    pub fn workspace(&self) -> &Arc<W> {
        &self.workspace
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn files(&self) -> &Arc<FileRecordStore> {
        &self.files
    }

    pub fn conflicts(&self) -> &Arc<ConflictStore> {
        &self.conflicts
    }

    fn gate(&self, project_id: &ProjectId) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(project_id.clone()).or_default())
    }

    /// Take the project's gate if no pass holds it.
    pub fn try_begin(&self, project_id: &ProjectId) -> Option<PassGuard> {
        let permit = self.gate(project_id).try_lock_owned().ok()?;
        Some(PassGuard { project_id: project_id.clone(), _permit: permit })
    }

    /// Wait for the project's gate.
    pub async fn begin(&self, project_id: &ProjectId) -> PassGuard {
        let permit = self.gate(project_id).lock_owned().await;
        PassGuard { project_id: project_id.clone(), _permit: permit }
    }

    pub fn is_busy(&self, project_id: &ProjectId) -> bool {
        self.gate(project_id).try_lock().is_err()
    }

    /// Run one pass. Per-file failures are counted and reported, not returned;
    /// only enumeration failures and auth errors fail the pass.
    pub async fn reconcile(&self, guard: &PassGuard) -> Result<SyncStats, SyncError> {
        let project_id = guard.project_id();
        let mut stats = SyncStats::default();

        let local = self.transfer("workspace listing", || self.workspace.list(project_id)).await?;
        let remote = self.transfer("remote listing", || self.remote.list(project_id)).await?;
        let records = self.files.list(project_id).map_err(SyncError::storage)?;
        let open: HashMap<FileId, ConflictRecord> = self
            .conflicts
            .list(project_id)
            .map_err(SyncError::storage)?
            .into_iter()
            .map(|c| (c.file_id, c))
            .collect();

        let mut observed: BTreeMap<String, Observed> = BTreeMap::new();
        for entry in local {
            observed.entry(entry.path).or_default().local = Some(entry.hash);
        }
        for entry in remote {
            match normalize_path(&entry.path) {
                Ok(path) => observed.entry(path).or_default().remote = Some(entry.hash),
                Err(e) => warn!(path = %entry.path, error = %e, "skipping remote file with invalid path"),
            }
        }
        for record in records {
            let path = record.path.clone();
            observed.entry(path).or_default().record = Some(record);
        }

        debug!(project_id = %project_id, files = observed.len(), "reconciliation pass started");

        for (path, seen) in observed {
            stats.scanned += 1;
            let file_id = FileId::for_path(project_id, &path);
            let result = match open.get(&file_id) {
                Some(conflict) => self.revisit_conflict(conflict, &path, &seen, &mut stats).await,
                None => self.reconcile_file(project_id, &path, seen, &mut stats).await,
            };

            if let Err(e) = result {
                if e.kind() == ErrorKind::Auth {
                    warn!(project_id = %project_id, path = %path, error = %e, "pass aborted on auth failure");
                    return Err(e);
                }
                stats.errors += 1;
                self.record_file_error(project_id, &path, &e);
            }
        }

        info!(
            project_id = %project_id,
            scanned = stats.scanned,
            pulled = stats.pulled,
            pushed = stats.pushed,
            merged = stats.merged,
            deleted = stats.deleted,
            conflicts = stats.conflicts,
            errors = stats.errors,
            "reconciliation pass completed"
        );
        Ok(stats)
    }

    async fn reconcile_file(
        &self,
        project_id: &ProjectId,
        path: &str,
        seen: Observed,
        stats: &mut SyncStats,
    ) -> Result<(), SyncError> {
        let Observed { local, remote, record } = seen;
        let synced = record.as_ref().filter(|r| r.base_hash.is_some());
        let local_changed = local != synced.and_then(|r| r.base_hash.clone());
        let remote_changed = remote != synced.and_then(|r| r.remote_hash.clone());
        let key = RemoteKey::for_path(project_id, path);

        match (local_changed, remote_changed) {
            (false, false) => {
                match record {
                    Some(record) if local.is_none() => {
                        self.files.remove(project_id, &record.id).map_err(SyncError::storage)?;
                        debug!(path, "deletion confirmed on both sides");
                    }
                    Some(mut record) => {
                        stats.unchanged += 1;
                        if record.sync_status != SyncStatus::Synced {
                            record.sync_status = SyncStatus::Synced;
                            record.last_error = None;
                            self.files.upsert(record).map_err(SyncError::storage)?;
                        }
                    }
                    None => {}
                }
                Ok(())
            }
            (false, true) => match remote {
                Some(_) => {
                    let Some(file) = self.transfer("pull", || self.remote.get(&key)).await? else {
                        return Ok(());
                    };
                    self.mark_in_transit(project_id, path, record.as_ref(), SyncStatus::RemoteOnly)?;
                    let local_hash = self
                        .transfer("local write", || {
                            self.workspace.write(project_id, path, &file.content)
                        })
                        .await?;
                    self.mark_synced(project_id, path, record, file.content, local_hash, file.hash)?;
                    stats.pulled += 1;
                    debug!(path, "pulled remote change");
                    Ok(())
                }
                None => {
                    self.transfer("local delete", || self.workspace.delete(project_id, path)).await?;
                    self.forget(project_id, record)?;
                    stats.deleted += 1;
                    debug!(path, "applied remote deletion");
                    Ok(())
                }
            },
            (true, false) => match local {
                Some(_) => {
                    let Some(content) = self.read_local(project_id, path).await? else {
                        return Ok(());
                    };
                    let local_hash = content_hash(&content);
                    self.mark_in_transit(project_id, path, record.as_ref(), SyncStatus::LocalOnly)?;
                    let remote_hash =
                        self.transfer("push", || self.remote.put(&key, &content)).await?;
                    self.mark_synced(project_id, path, record, content, local_hash, remote_hash)?;
                    stats.pushed += 1;
                    debug!(path, "pushed local change");
                    Ok(())
                }
                None => {
                    self.transfer("remote delete", || self.remote.delete(&key)).await?;
                    self.forget(project_id, record)?;
                    stats.deleted += 1;
                    debug!(path, "applied local deletion");
                    Ok(())
                }
            },
            (true, true) => {
                self.reconcile_divergent(project_id, path, local, remote, record, stats).await
            }
        }
    }

    /// Both sides moved away from the base. Hash schemes differ between the
    /// two stores, so contents are fetched and compared directly.
    async fn reconcile_divergent(
        &self,
        project_id: &ProjectId,
        path: &str,
        local: Option<ContentHash>,
        remote: Option<ContentHash>,
        record: Option<FileRecord>,
        stats: &mut SyncStats,
    ) -> Result<(), SyncError> {
        let key = RemoteKey::for_path(project_id, path);
        let local_content = match local {
            Some(_) => self.read_local(project_id, path).await?,
            None => None,
        };
        let remote_file = match remote {
            Some(_) => self.transfer("pull", || self.remote.get(&key)).await?,
            None => None,
        };

        let (local_text, remote_file) = match (local_content, remote_file) {
            (None, None) => {
                self.forget(project_id, record)?;
                debug!(path, "deleted on both sides");
                return Ok(());
            }
            (Some(local_text), Some(remote_file)) => (local_text, remote_file),
            (local_content, remote_file) => {
                let remote_content = remote_file.map(|f| f.content);
                self.record_conflict(
                    project_id,
                    path,
                    record,
                    ConflictType::DeleteModify,
                    local_content,
                    remote_content,
                    None,
                    stats,
                )?;
                return Ok(());
            }
        };

        if local_text == remote_file.content {
            stats.unchanged += 1;
            let local_hash = content_hash(&local_text);
            self.mark_synced(project_id, path, record, local_text, local_hash, remote_file.hash)?;
            debug!(path, "both sides converged on the same content");
            return Ok(());
        }

        let remote_text = remote_file.content;
        let base_text = record.as_ref().and_then(|r| r.content.clone()).unwrap_or_default();
        let merged = merge(&base_text, &local_text, &remote_text);
        if !merged.success {
            self.record_conflict(
                project_id,
                path,
                record,
                ConflictType::ModifyModify,
                Some(local_text),
                Some(remote_text),
                Some((merged.content, merged.conflicts)),
                stats,
            )?;
            return Ok(());
        }

        if get_merge_stats(&base_text, &local_text, &remote_text).is_diverged() {
            self.record_conflict(
                project_id,
                path,
                record,
                ConflictType::ContentDiverged,
                Some(local_text),
                Some(remote_text),
                Some((merged.content, Vec::new())),
                stats,
            )?;
            return Ok(());
        }

        let content = merged.content;
        let local_hash =
            self.transfer("local write", || self.workspace.write(project_id, path, &content)).await?;
        let remote_hash = self.transfer("push", || self.remote.put(&key, &content)).await?;
        self.mark_synced(project_id, path, record, content, local_hash, remote_hash)?;
        stats.merged += 1;
        debug!(path, "merged independent edits");
        Ok(())
    }

    /// An open conflict is left alone unless both sides have since converged.
    async fn revisit_conflict(
        &self,
        conflict: &ConflictRecord,
        path: &str,
        seen: &Observed,
        stats: &mut SyncStats,
    ) -> Result<(), SyncError> {
        let project_id = &conflict.project_id;

        match (&seen.local, &seen.remote) {
            (None, None) => {
                self.files.remove(project_id, &conflict.file_id).map_err(SyncError::storage)?;
            }
            (Some(local_hash), Some(_)) => {
                let key = RemoteKey::for_path(project_id, path);
                let Some(file) = self.transfer("pull", || self.remote.get(&key)).await? else {
                    return Ok(());
                };
                if content_hash(&file.content) != *local_hash {
                    return Ok(());
                }
                self.mark_synced(
                    project_id,
                    path,
                    seen.record.clone(),
                    file.content,
                    local_hash.clone(),
                    file.hash,
                )?;
            }
            _ => return Ok(()),
        }

        self.conflicts.remove(project_id, &conflict.file_id).map_err(SyncError::storage)?;
        stats.unchanged += 1;
        info!(project_id = %project_id, path, "conflict auto-resolved, sides converged");
        self.bus.publish(SyncEvent::ConflictResolved {
            project_id: project_id.clone(),
            file_id: conflict.file_id,
            strategy: ResolutionStrategy::Auto,
        });
        Ok(())
    }

    async fn read_local(
        &self,
        project_id: &ProjectId,
        path: &str,
    ) -> Result<Option<String>, SyncError> {
        let file = self.transfer("local read", || self.workspace.read(project_id, path)).await?;
        Ok(file.map(|f| f.content))
    }

    /// Run a transfer with a timeout, retrying retryable failures with backoff.
    async fn transfer<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<SyncError>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.config.transfer_timeout, op()).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(SyncError::Timeout(what.to_string())),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.retryable() && attempt < self.config.transfer_attempts => {
                    let delay = self.config.retry_base_delay.saturating_mul(1 << (attempt - 1));
                    debug!(what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying transfer");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn mark_in_transit(
        &self,
        project_id: &ProjectId,
        path: &str,
        record: Option<&FileRecord>,
        new_status: SyncStatus,
    ) -> Result<(), SyncError> {
        let mut record = record
            .cloned()
            .unwrap_or_else(|| FileRecord::new(project_id.clone(), path.to_string()));
        // Files never synced before are tagged with the side that holds them.
        record.sync_status =
            if record.base_hash.is_some() { SyncStatus::Syncing } else { new_status };
        self.files.upsert(record).map_err(SyncError::storage)
    }

    fn mark_synced(
        &self,
        project_id: &ProjectId,
        path: &str,
        record: Option<FileRecord>,
        content: String,
        local_hash: ContentHash,
        remote_hash: ContentHash,
    ) -> Result<(), SyncError> {
        let mut record =
            record.unwrap_or_else(|| FileRecord::new(project_id.clone(), path.to_string()));
        record.mark_synced(content, local_hash, remote_hash, Utc::now());
        self.files.upsert(record).map_err(SyncError::storage)
    }

    fn forget(&self, project_id: &ProjectId, record: Option<FileRecord>) -> Result<(), SyncError> {
        if let Some(record) = record {
            self.files.remove(project_id, &record.id).map_err(SyncError::storage)?;
        }
        Ok(())
    }

    fn record_conflict(
        &self,
        project_id: &ProjectId,
        path: &str,
        record: Option<FileRecord>,
        conflict_type: ConflictType,
        local: Option<String>,
        remote: Option<String>,
        merged: Option<(String, Vec<ConflictSpan>)>,
        stats: &mut SyncStats,
    ) -> Result<(), SyncError> {
        let now = Utc::now();
        let snapshot = |content: Option<String>| VersionSnapshot {
            hash: content.as_deref().map(content_hash),
            content,
            modified_at: now,
        };
        let mut record =
            record.unwrap_or_else(|| FileRecord::new(project_id.clone(), path.to_string()));

        let base_version = record.content.clone().map(|content| VersionSnapshot {
            content: Some(content),
            hash: record.base_hash.clone(),
            modified_at: record.last_synced_at.unwrap_or(now),
        });
        let local_version = snapshot(local);
        let remote_version = snapshot(remote);
        let (merged_preview, spans) = match merged {
            Some((preview, spans)) => (Some(preview), spans),
            None => (None, Vec::new()),
        };

        let conflict = ConflictRecord {
            file_id: record.id,
            project_id: project_id.clone(),
            path: path.to_string(),
            conflict_type,
            state: ConflictState::Detected,
            local_version: local_version.clone(),
            remote_version: remote_version.clone(),
            base_version,
            merged_preview,
            spans,
            created_at: now,
            resolution: None,
        };
        self.conflicts.upsert(&conflict).map_err(SyncError::storage)?;

        record.sync_status = SyncStatus::Conflict;
        record.conflict_data = Some(ConflictData { conflict_type, local_version, remote_version });
        record.last_error = None;
        self.files.upsert(record).map_err(SyncError::storage)?;

        stats.conflicts += 1;
        warn!(project_id = %project_id, path, conflict_type = conflict_type.as_str(), "conflict detected");
        self.bus.publish(SyncEvent::ConflictDetected {
            project_id: project_id.clone(),
            file_id: conflict.file_id,
            path: path.to_string(),
            conflict_type,
        });
        Ok(())
    }

    fn record_file_error(&self, project_id: &ProjectId, path: &str, error: &SyncError) {
        warn!(project_id = %project_id, path, error = %error, "file left in error state");

        let record = match self.files.get_by_path(project_id, path) {
            Ok(record) => record,
            Err(e) => {
                warn!(path, error = %e, "failed to load record for error state");
                None
            }
        };
        let mut record =
            record.unwrap_or_else(|| FileRecord::new(project_id.clone(), path.to_string()));
        record.sync_status = SyncStatus::Error;
        record.last_error = Some(error.to_string());
        if let Err(e) = self.files.upsert(record) {
            warn!(path, error = %e, "failed to persist error state");
        }

        self.bus.publish(SyncEvent::FileError {
            project_id: project_id.clone(),
            path: path.to_string(),
            error: error.info(),
        });
    }
}
