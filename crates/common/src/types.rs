// Core domain types shared by the daemon, its HTTP surface, and observers.
//
// JSON field names are camelCase and enum values kebab-case, matching the
// watcher protocol and the REST payloads.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::merge::ConflictSpan;

/// Maximum length of a project identifier.
const MAX_PROJECT_ID_LEN: usize = 128;

// ── Identifiers ─────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid project id `{0}`: expected 1-128 chars of [A-Za-z0-9._-]")]
pub struct InvalidProjectId(pub String);

/// Identifier of an open project. Doubles as the project's directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

impl ProjectId {
    pub fn parse(value: impl Into<String>) -> Result<Self, InvalidProjectId> {
        let value = value.into();
        let valid = !value.is_empty()
            && value.len() <= MAX_PROJECT_ID_LEN
            && value != "."
            && value != ".."
            && value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if valid {
            Ok(Self(value))
        } else {
            Err(InvalidProjectId(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProjectId {
    type Error = InvalidProjectId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ProjectId> for String {
    fn from(value: ProjectId) -> Self {
        value.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable file identity: uuid v5 of the project and normalized path.
///
/// Every copy of a file (workspace, cloud store, FileRecord) derives the same
/// id from the same path, so remote-only files can be matched without a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub Uuid);

impl FileId {
    pub fn for_path(project_id: &ProjectId, normalized_path: &str) -> Self {
        let name = format!("trisync:{project_id}/{normalized_path}");
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()))
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for FileId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ── File records ────────────────────────────────────────────────────

/// Per-file synchronization status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    Synced,
    Syncing,
    Pending,
    Conflict,
    LocalOnly,
    RemoteOnly,
    Error,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Syncing => "syncing",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
            Self::LocalOnly => "local-only",
            Self::RemoteOnly => "remote-only",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "synced" => Some(Self::Synced),
            "syncing" => Some(Self::Syncing),
            "pending" => Some(Self::Pending),
            "conflict" => Some(Self::Conflict),
            "local-only" => Some(Self::LocalOnly),
            "remote-only" => Some(Self::RemoteOnly),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One side of a divergence as it looked when the conflict was detected.
///
/// `content == None` means the file was deleted on that side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersionSnapshot {
    pub content: Option<String>,
    pub hash: Option<String>,
    pub modified_at: DateTime<Utc>,
}

impl VersionSnapshot {
    pub fn is_deleted(&self) -> bool {
        self.content.is_none()
    }
}

/// Conflict payload attached to a FileRecord while it is in `conflict`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictData {
    pub conflict_type: ConflictType,
    pub local_version: VersionSnapshot,
    pub remote_version: VersionSnapshot,
}

/// Cached view of one file across the three copies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: FileId,
    pub project_id: ProjectId,
    pub path: String,
    /// Content as of the last successful sync (the merge base).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub size: u64,
    /// Workspace hash of the base content.
    pub local_hash: Option<String>,
    /// Hash the remote store reported for the base content. Remote stores
    /// choose their own hash scheme, so this is only ever compared with other
    /// remote hashes.
    pub remote_hash: Option<String>,
    pub base_hash: Option<String>,
    pub sync_status: SyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub conflict_data: Option<ConflictData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl FileRecord {
    /// A record for a path that has never been synced.
    pub fn new(project_id: ProjectId, path: String) -> Self {
        Self {
            id: FileId::for_path(&project_id, &path),
            project_id,
            path,
            content: None,
            size: 0,
            local_hash: None,
            remote_hash: None,
            base_hash: None,
            sync_status: SyncStatus::Pending,
            last_synced_at: None,
            conflict_data: None,
            last_error: None,
        }
    }

    /// Record a successful sync: both sides now hold `content`, which hashes
    /// to `local_hash` in the workspace and `remote_hash` in the remote store.
    pub fn mark_synced(
        &mut self,
        content: String,
        local_hash: String,
        remote_hash: String,
        now: DateTime<Utc>,
    ) {
        self.size = content.len() as u64;
        self.content = Some(content);
        self.local_hash = Some(local_hash.clone());
        self.remote_hash = Some(remote_hash);
        self.base_hash = Some(local_hash);
        self.sync_status = SyncStatus::Synced;
        self.last_synced_at = Some(now);
        self.conflict_data = None;
        self.last_error = None;
    }

    pub fn is_in_conflict(&self) -> bool {
        self.sync_status == SyncStatus::Conflict && self.conflict_data.is_some()
    }

    /// Same record without the cached content, for listings.
    pub fn summary(&self) -> Self {
        Self { content: None, ..self.clone() }
    }
}

// ── Conflicts ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    ModifyModify,
    DeleteModify,
    ContentDiverged,
}

impl ConflictType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ModifyModify => "modify-modify",
            Self::DeleteModify => "delete-modify",
            Self::ContentDiverged => "content-diverged",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "modify-modify" => Some(Self::ModifyModify),
            "delete-modify" => Some(Self::DeleteModify),
            "content-diverged" => Some(Self::ContentDiverged),
            _ => None,
        }
    }
}

/// Conflict lifecycle: detected → (auto-resolved | presented) → resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictState {
    Detected,
    Presented,
    AutoResolved,
    Resolved,
}

impl ConflictState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Presented => "presented",
            Self::AutoResolved => "auto-resolved",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "detected" => Some(Self::Detected),
            "presented" => Some(Self::Presented),
            "auto-resolved" => Some(Self::AutoResolved),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, Self::Detected | Self::Presented)
    }
}

/// How a conflict is (or was) resolved.
///
/// `auto` is recorded by the engine when both sides converge on their own and
/// is never accepted from callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    #[serde(alias = "local")]
    KeepLocal,
    #[serde(alias = "remote")]
    KeepRemote,
    Merge,
    Manual,
    Auto,
}

impl ResolutionStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeepLocal => "keep-local",
            Self::KeepRemote => "keep-remote",
            Self::Merge => "merge",
            Self::Manual => "manual",
            Self::Auto => "auto",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "keep-local" | "local" => Some(Self::KeepLocal),
            "keep-remote" | "remote" => Some(Self::KeepRemote),
            "merge" => Some(Self::Merge),
            "manual" => Some(Self::Manual),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    pub resolved_at: DateTime<Utc>,
}

/// Durable record of a divergence awaiting (or having received) a resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub file_id: FileId,
    pub project_id: ProjectId,
    pub path: String,
    pub conflict_type: ConflictType,
    pub state: ConflictState,
    pub local_version: VersionSnapshot,
    pub remote_version: VersionSnapshot,
    pub base_version: Option<VersionSnapshot>,
    /// Positional merge output, markers included, when both sides have content.
    pub merged_preview: Option<String>,
    #[serde(default)]
    pub spans: Vec<ConflictSpan>,
    pub created_at: DateTime<Utc>,
    pub resolution: Option<Resolution>,
}

// ── Watcher registration ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum WatcherStatus {
    Connecting,
    Connected,
    Watching,
    Disconnected,
    Error,
}

impl WatcherStatus {
    /// Terminal: the gateway stopped retrying and needs an explicit reconnect.
    pub fn is_terminal(self) -> bool {
        self == Self::Disconnected
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WatcherRegistration {
    pub project_id: ProjectId,
    pub workspace_path: String,
    pub container_id: String,
    pub channel_id: Uuid,
    pub status: WatcherStatus,
    pub registered_at: DateTime<Utc>,
}

// ── Sync results and status ─────────────────────────────────────────

/// Error classification carried by results and notifications.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    TransientIo,
    Auth,
    WatcherDisconnected,
    MergeFailure,
    ConflictResolution,
    NotFound,
    Forbidden,
    Storage,
    Internal,
}

impl ErrorKind {
    pub const fn retryable(self) -> bool {
        matches!(self, Self::TransientIo | Self::Storage)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TransientIo => "transient-io",
            Self::Auth => "auth",
            Self::WatcherDisconnected => "watcher-disconnected",
            Self::MergeFailure => "merge-failure",
            Self::ConflictResolution => "conflict-resolution",
            Self::NotFound => "not-found",
            Self::Forbidden => "forbidden",
            Self::Storage => "storage",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retryable: kind.retryable() }
    }
}

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub scanned: usize,
    pub unchanged: usize,
    pub pulled: usize,
    pub pushed: usize,
    pub merged: usize,
    pub deleted: usize,
    pub conflicts: usize,
    pub errors: usize,
}

impl SyncStats {
    pub fn transfers(&self) -> usize {
        self.pulled + self.pushed + self.merged + self.deleted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub stats: SyncStats,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Aggregated phase surfaced to observers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    Idle,
    Syncing,
    Synced,
    Error,
    Reauthenticate,
}

/// Per-project status as reported by `GET /sync/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSyncStatus {
    pub project_id: ProjectId,
    pub phase: SyncPhase,
    /// Background timer armed.
    pub running: bool,
    pub interval_ms: Option<u64>,
    /// A pass is executing right now.
    pub in_flight: bool,
    pub last_result: Option<SyncResult>,
    pub watcher: Option<WatcherStatus>,
    pub open_conflicts: usize,
}

impl ProjectSyncStatus {
    pub fn idle(project_id: ProjectId) -> Self {
        Self {
            project_id,
            phase: SyncPhase::Idle,
            running: false,
            interval_ms: None,
            in_flight: false,
            last_result: None,
            watcher: None,
            open_conflicts: 0,
        }
    }
}
