// Conflict resolution: apply a caller's decision to both copies of a file.

use chrono::Utc;
use tracing::{info, warn};
use trisync_common::hash::content_hash;
use trisync_common::merge::{has_conflict_markers, merge};
use trisync_common::protocol::events::SyncEvent;
use trisync_common::types::{
    ConflictData, ConflictRecord, ConflictState, ConflictType, FileId, FileRecord, ProjectId,
    Resolution, ResolutionStrategy, VersionSnapshot,
};

use super::ReconciliationEngine;
use crate::error::{ResolutionError, SyncError};
use crate::remote::{RemoteKey, RemoteStore};
use crate::workspace::WorkspaceProvider;

impl<W: WorkspaceProvider, R: RemoteStore> ReconciliationEngine<W, R> {
    /// Open conflicts for a project. Listing moves detected conflicts to
    /// `presented`.
    pub fn list_conflicts(&self, project_id: &ProjectId) -> Result<Vec<ConflictRecord>, SyncError> {
        self.conflicts().present(project_id).map_err(SyncError::storage)
    }

    /// Resolve the open conflict for `file_id`.
    ///
    /// Invalid requests are rejected before anything is touched. Both copies
    /// are re-read under the gate first: if either moved away from what the
    /// conflict recorded, the conflict is refreshed with the current contents
    /// and the request is rejected as stale. A `merge` that still leaves
    /// conflict markers writes the marked content to the workspace for
    /// hand-editing and keeps the conflict open; every other outcome writes
    /// both copies and closes it.
    pub async fn resolve_conflict(
        &self,
        file_id: FileId,
        strategy: ResolutionStrategy,
        content: Option<String>,
    ) -> Result<ConflictRecord, SyncError> {
        match (strategy, &content) {
            (ResolutionStrategy::Auto, _) => {
                return Err(ResolutionError::InvalidStrategy(strategy.as_str().to_string()).into());
            }
            (ResolutionStrategy::Manual, None) => return Err(ResolutionError::MissingContent.into()),
            _ => {}
        }

        let found = self
            .conflicts()
            .find(&file_id)
            .map_err(SyncError::storage)?
            .ok_or(ResolutionError::NotFound(file_id))?;

        // Re-read under the gate so a concurrent pass can't have moved it.
        let guard = self.begin(&found.project_id).await;
        let project_id = guard.project_id();
        let mut conflict = self
            .conflicts()
            .get(project_id, &file_id)
            .map_err(SyncError::storage)?
            .ok_or(ResolutionError::NotFound(file_id))?;
        let key = RemoteKey::for_path(project_id, &conflict.path);

        let current_local = self.read_local(project_id, &conflict.path).await?;
        let current_remote =
            self.transfer("pull", || self.remote().get(&key)).await?.map(|f| f.content);
        if !local_matches_snapshot(&conflict, current_local.as_deref())
            || current_remote != conflict.remote_version.content
        {
            self.refresh_conflict(&mut conflict, current_local, current_remote)?;
            return Err(ResolutionError::Stale(conflict.path).into());
        }

        let resolved: Option<String> = match strategy {
            ResolutionStrategy::KeepLocal => conflict.local_version.content.clone(),
            ResolutionStrategy::KeepRemote => conflict.remote_version.content.clone(),
            ResolutionStrategy::Manual => content,
            ResolutionStrategy::Merge => {
                let (Some(local), Some(remote)) =
                    (&conflict.local_version.content, &conflict.remote_version.content)
                else {
                    return Err(ResolutionError::MergeNeedsBothSides.into());
                };
                let base = conflict
                    .base_version
                    .as_ref()
                    .and_then(|b| b.content.clone())
                    .unwrap_or_default();
                let merged = merge(&base, local, remote);
                if !merged.success {
                    let marked = merged.content;
                    self.transfer("local write", || {
                        self.workspace().write(project_id, &conflict.path, &marked)
                    })
                    .await?;
                    conflict.merged_preview = Some(marked);
                    conflict.spans = merged.conflicts;
                    conflict.state = ConflictState::Detected;
                    self.conflicts().upsert(&conflict).map_err(SyncError::storage)?;
                    info!(
                        project_id = %project_id,
                        path = %conflict.path,
                        remaining = conflict.spans.len(),
                        "merge left conflict markers in workspace"
                    );
                    return Ok(conflict);
                }
                Some(merged.content)
            }
            ResolutionStrategy::Auto => {
                return Err(ResolutionError::InvalidStrategy(strategy.as_str().to_string()).into());
            }
        };

        let path = conflict.path.as_str();
        match resolved {
            Some(text) => {
                let local_hash = self
                    .transfer("local write", || self.workspace().write(project_id, path, &text))
                    .await?;
                let remote_hash =
                    self.transfer("push", || self.remote().put(&key, &text)).await?;
                let mut record = self
                    .files()
                    .get(project_id, &file_id)
                    .map_err(SyncError::storage)?
                    .unwrap_or_else(|| FileRecord::new(project_id.clone(), conflict.path.clone()));
                record.mark_synced(text, local_hash, remote_hash, Utc::now());
                self.files().upsert(record).map_err(SyncError::storage)?;
            }
            None => {
                self.transfer("local delete", || self.workspace().delete(project_id, path)).await?;
                self.transfer("remote delete", || self.remote().delete(&key)).await?;
                self.files().remove(project_id, &file_id).map_err(SyncError::storage)?;
            }
        }

        self.conflicts().remove(project_id, &file_id).map_err(SyncError::storage)?;
        conflict.state = ConflictState::Resolved;
        conflict.resolution = Some(Resolution { strategy, resolved_at: Utc::now() });

        info!(
            project_id = %project_id,
            path = %conflict.path,
            strategy = strategy.as_str(),
            "conflict resolved"
        );
        self.bus.publish(SyncEvent::ConflictResolved {
            project_id: project_id.clone(),
            file_id,
            strategy,
        });
        Ok(conflict)
    }

    /// Replace the conflict's versions with what the two copies hold now.
    fn refresh_conflict(
        &self,
        conflict: &mut ConflictRecord,
        local: Option<String>,
        remote: Option<String>,
    ) -> Result<(), SyncError> {
        let now = Utc::now();
        let snapshot = |content: Option<String>| VersionSnapshot {
            hash: content.as_deref().map(content_hash),
            content,
            modified_at: now,
        };
        conflict.local_version = snapshot(local);
        conflict.remote_version = snapshot(remote);
        conflict.state = ConflictState::Detected;

        match (&conflict.local_version.content, &conflict.remote_version.content) {
            (Some(local), Some(remote)) => {
                let base = conflict
                    .base_version
                    .as_ref()
                    .and_then(|b| b.content.clone())
                    .unwrap_or_default();
                let merged = merge(&base, local, remote);
                if conflict.conflict_type == ConflictType::DeleteModify {
                    conflict.conflict_type = ConflictType::ModifyModify;
                }
                conflict.merged_preview = Some(merged.content);
                conflict.spans = merged.conflicts;
            }
            _ => {
                conflict.conflict_type = ConflictType::DeleteModify;
                conflict.merged_preview = None;
                conflict.spans = Vec::new();
            }
        }
        self.conflicts().upsert(conflict).map_err(SyncError::storage)?;

        if let Some(mut record) =
            self.files().get(&conflict.project_id, &conflict.file_id).map_err(SyncError::storage)?
        {
            record.conflict_data = Some(ConflictData {
                conflict_type: conflict.conflict_type,
                local_version: conflict.local_version.clone(),
                remote_version: conflict.remote_version.clone(),
            });
            self.files().upsert(record).map_err(SyncError::storage)?;
        }

        warn!(
            project_id = %conflict.project_id,
            path = %conflict.path,
            "conflict refreshed, a copy changed after detection"
        );
        Ok(())
    }
}

/// The workspace still holds the detected local version, or the marked output
/// of an earlier `merge` attempt.
fn local_matches_snapshot(conflict: &ConflictRecord, current: Option<&str>) -> bool {
    if current == conflict.local_version.content.as_deref() {
        return true;
    }
    current.is_some_and(|text| {
        has_conflict_markers(text) && conflict.merged_preview.as_deref() == Some(text)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use trisync_common::types::{ErrorKind, SyncStatus};

    use super::*;
    use crate::engine::EngineConfig;
    use crate::events::EventBus;
    use crate::remote::MemoryRemoteStore;
    use crate::store::{ConflictStore, FileRecordStore, MetaDb};
    use crate::workspace::MemoryWorkspace;

    fn project() -> ProjectId {
        ProjectId::parse("demo").unwrap()
    }

    type Engine = ReconciliationEngine<MemoryWorkspace, MemoryRemoteStore>;

    /// Engine with one modify-modify conflict on `a.txt`.
    async fn conflicted() -> (Engine, MemoryWorkspace, MemoryRemoteStore, FileId) {
        let db = Arc::new(MetaDb::open_in_memory().unwrap());
        let workspace = MemoryWorkspace::new();
        let remote = MemoryRemoteStore::new();
        let engine = ReconciliationEngine::new(
            Arc::new(workspace.clone()),
            Arc::new(remote.clone()),
            Arc::new(FileRecordStore::new(db.clone())),
            Arc::new(ConflictStore::new(db)),
            EventBus::new(),
            EngineConfig::default(),
        );

        workspace.insert(&project(), "a.txt", "a\nb\nc");
        let guard = engine.begin(&project()).await;
        engine.reconcile(&guard).await.unwrap();
        workspace.insert(&project(), "a.txt", "a\nX\nc");
        remote.insert(&project(), "a.txt", "a\nY\nc");
        engine.reconcile(&guard).await.unwrap();
        drop(guard);

        let file_id = FileId::for_path(&project(), "a.txt");
        assert!(engine.conflicts().get(&project(), &file_id).unwrap().is_some());
        (engine, workspace, remote, file_id)
    }

    #[tokio::test]
    async fn keep_local_writes_both_sides() {
        let (engine, workspace, remote, id) = conflicted().await;
        let resolved = engine.resolve_conflict(id, ResolutionStrategy::KeepLocal, None).await.unwrap();

        assert_eq!(resolved.state, ConflictState::Resolved);
        assert_eq!(resolved.resolution.unwrap().strategy, ResolutionStrategy::KeepLocal);
        assert_eq!(remote.content(&project(), "a.txt").as_deref(), Some("a\nX\nc"));
        assert_eq!(workspace.content(&project(), "a.txt").as_deref(), Some("a\nX\nc"));

        let record = engine.files().get(&project(), &id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert!(record.conflict_data.is_none());
        assert_eq!(engine.conflicts().count(&project()).unwrap(), 0);
    }

    #[tokio::test]
    async fn manual_requires_content() {
        let (engine, _, _, id) = conflicted().await;
        let err = engine.resolve_conflict(id, ResolutionStrategy::Manual, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConflictResolution);
        assert_eq!(engine.conflicts().count(&project()).unwrap(), 1);

        engine
            .resolve_conflict(id, ResolutionStrategy::Manual, Some("a\nXY\nc".into()))
            .await
            .unwrap();
        assert_eq!(engine.conflicts().count(&project()).unwrap(), 0);
    }

    #[tokio::test]
    async fn auto_cannot_be_requested() {
        let (engine, _, _, id) = conflicted().await;
        let err = engine.resolve_conflict(id, ResolutionStrategy::Auto, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Resolution(ResolutionError::InvalidStrategy(_))));
    }

    #[tokio::test]
    async fn merge_with_markers_stays_open() {
        let (engine, workspace, remote, id) = conflicted().await;
        let result = engine.resolve_conflict(id, ResolutionStrategy::Merge, None).await.unwrap();

        assert_eq!(result.state, ConflictState::Detected);
        assert!(result.resolution.is_none());
        let local = workspace.content(&project(), "a.txt").unwrap();
        assert!(trisync_common::merge::has_conflict_markers(&local));
        // The cloud copy is never given marker text.
        assert_eq!(remote.content(&project(), "a.txt").as_deref(), Some("a\nY\nc"));
        assert_eq!(engine.conflicts().count(&project()).unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_file_is_not_found() {
        let (engine, _, _, _) = conflicted().await;
        let other = FileId::for_path(&project(), "missing.txt");
        let err = engine.resolve_conflict(other, ResolutionStrategy::KeepRemote, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn listing_presents_conflicts() {
        let (engine, _, _, _) = conflicted().await;
        let listed = engine.list_conflicts(&project()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].conflict_type, ConflictType::ModifyModify);
        assert_eq!(listed[0].state, ConflictState::Presented);
    }

    #[tokio::test]
    async fn later_local_edit_is_not_overwritten() {
        let (engine, workspace, remote, id) = conflicted().await;
        workspace.insert(&project(), "a.txt", "a\nX-and-more-work\nc");

        let err = engine.resolve_conflict(id, ResolutionStrategy::KeepLocal, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Resolution(ResolutionError::Stale(_))));
        assert_eq!(err.kind(), ErrorKind::ConflictResolution);
        assert_eq!(workspace.content(&project(), "a.txt").as_deref(), Some("a\nX-and-more-work\nc"));
        assert_eq!(remote.content(&project(), "a.txt").as_deref(), Some("a\nY\nc"));

        let refreshed = engine.conflicts().get(&project(), &id).unwrap().unwrap();
        assert_eq!(refreshed.state, ConflictState::Detected);
        assert_eq!(refreshed.local_version.content.as_deref(), Some("a\nX-and-more-work\nc"));

        engine.resolve_conflict(id, ResolutionStrategy::KeepLocal, None).await.unwrap();
        assert_eq!(remote.content(&project(), "a.txt").as_deref(), Some("a\nX-and-more-work\nc"));
        assert_eq!(workspace.content(&project(), "a.txt").as_deref(), Some("a\nX-and-more-work\nc"));
    }

    #[tokio::test]
    async fn later_remote_edit_is_not_overwritten() {
        let (engine, workspace, remote, id) = conflicted().await;
        remote.insert(&project(), "a.txt", "a\nY2\nc");

        let err = engine.resolve_conflict(id, ResolutionStrategy::KeepLocal, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Resolution(ResolutionError::Stale(_))));
        assert_eq!(remote.content(&project(), "a.txt").as_deref(), Some("a\nY2\nc"));
        assert_eq!(workspace.content(&project(), "a.txt").as_deref(), Some("a\nX\nc"));
        let refreshed = engine.conflicts().get(&project(), &id).unwrap().unwrap();
        assert_eq!(refreshed.remote_version.content.as_deref(), Some("a\nY2\nc"));
    }

    #[tokio::test]
    async fn manual_after_marked_merge_is_accepted() {
        let (engine, workspace, remote, id) = conflicted().await;
        engine.resolve_conflict(id, ResolutionStrategy::Merge, None).await.unwrap();

        engine
            .resolve_conflict(id, ResolutionStrategy::Manual, Some("a\nXY\nc".into()))
            .await
            .unwrap();
        assert_eq!(workspace.content(&project(), "a.txt").as_deref(), Some("a\nXY\nc"));
        assert_eq!(remote.content(&project(), "a.txt").as_deref(), Some("a\nXY\nc"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_remote_times_out_and_releases_the_gate() {
        let (engine, _, remote, id) = conflicted().await;
        remote.set_latency(Some(Duration::from_secs(3600)));

        let err = engine.resolve_conflict(id, ResolutionStrategy::KeepRemote, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientIo);
        assert!(engine.try_begin(&project()).is_some());
        assert_eq!(engine.conflicts().count(&project()).unwrap(), 1);
    }
}
