// Notifications published by the daemon to its observers.
//
// Success and failure travel on the same channel; failures carry an
// `ErrorInfo` so observers can tell retryable errors from terminal ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ConflictType, ErrorInfo, FileId, ProjectId, ResolutionStrategy, SyncStats, WatcherStatus,
};

/// What woke the scheduler for a pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SyncTrigger {
    Timer,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    /// Background sync armed (or re-armed with a new interval).
    #[serde(rename_all = "camelCase")]
    Started { project_id: ProjectId, interval_ms: u64 },

    #[serde(rename_all = "camelCase")]
    Stopped { project_id: ProjectId },

    #[serde(rename_all = "camelCase")]
    SyncStarted { project_id: ProjectId, trigger: SyncTrigger },

    #[serde(rename_all = "camelCase")]
    SyncCompleted { project_id: ProjectId, stats: SyncStats, timestamp: DateTime<Utc> },

    #[serde(rename_all = "camelCase")]
    SyncFailed { project_id: ProjectId, error: ErrorInfo, timestamp: DateTime<Utc> },

    #[serde(rename_all = "camelCase")]
    ConflictDetected {
        project_id: ProjectId,
        file_id: FileId,
        path: String,
        conflict_type: ConflictType,
    },

    #[serde(rename_all = "camelCase")]
    ConflictResolved { project_id: ProjectId, file_id: FileId, strategy: ResolutionStrategy },

    #[serde(rename_all = "camelCase")]
    WatcherStatusChanged { project_id: ProjectId, status: WatcherStatus },

    /// Debounced notice that the project tree changed under `paths`.
    #[serde(rename_all = "camelCase")]
    TreeRefresh { project_id: ProjectId, paths: Vec<String> },

    /// A single file failed during a pass; the pass itself went on.
    #[serde(rename_all = "camelCase")]
    FileError { project_id: ProjectId, path: String, error: ErrorInfo },
}

impl SyncEvent {
    pub fn project_id(&self) -> &ProjectId {
        match self {
            Self::Started { project_id, .. }
            | Self::Stopped { project_id }
            | Self::SyncStarted { project_id, .. }
            | Self::SyncCompleted { project_id, .. }
            | Self::SyncFailed { project_id, .. }
            | Self::ConflictDetected { project_id, .. }
            | Self::ConflictResolved { project_id, .. }
            | Self::WatcherStatusChanged { project_id, .. }
            | Self::TreeRefresh { project_id, .. }
            | Self::FileError { project_id, .. } => project_id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Stopped { .. } => "stopped",
            Self::SyncStarted { .. } => "sync-started",
            Self::SyncCompleted { .. } => "sync-completed",
            Self::SyncFailed { .. } => "sync-failed",
            Self::ConflictDetected { .. } => "conflict-detected",
            Self::ConflictResolved { .. } => "conflict-resolved",
            Self::WatcherStatusChanged { .. } => "watcher-status-changed",
            Self::TreeRefresh { .. } => "tree-refresh",
            Self::FileError { .. } => "file-error",
        }
    }
}
