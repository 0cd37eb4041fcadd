// Domain errors for the sync daemon.
//
// Every error maps to an `ErrorKind` so notifications and API responses can
// tell observers whether retrying makes sense.

use thiserror::Error;
use trisync_common::path::PathError;
use trisync_common::types::{ErrorInfo, ErrorKind, FileId, ProjectId};

/// Failures of the sandbox workspace (local copy).
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace io error at `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    InvalidPath(#[from] PathError),

    #[error("`{0}` is not valid UTF-8 text")]
    NotText(String),
}

impl WorkspaceError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

/// Failures of the cloud store (remote copy).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Credentials expired or revoked; retrying will not help.
    #[error("remote store rejected credentials: {0}")]
    Auth(String),

    #[error("remote store unavailable: {0}")]
    Transient(String),

    #[error("remote store request timed out")]
    Timeout,

    #[error("remote store returned an invalid response: {0}")]
    Protocol(String),

    #[error("remote storage failure: {0}")]
    Storage(String),
}

/// Failures of the watcher channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect watcher channel: {0}")]
    Connect(String),

    /// The server answered `register` with an error.
    #[error("watcher registration rejected: {0}")]
    Rejected(String),

    #[error("watcher channel closed")]
    Closed,

    #[error("watcher handshake timed out")]
    Timeout,

    #[error("watcher protocol error: {0}")]
    Protocol(String),
}

/// Invalid resolution requests, rejected before anything is touched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("strategy `{0}` cannot be requested")]
    InvalidStrategy(String),

    #[error("manual resolution requires content")]
    MissingContent,

    #[error("merge resolution needs content on both sides")]
    MergeNeedsBothSides,

    #[error("no open conflict for file {0}")]
    NotFound(FileId),

    #[error("`{0}` changed after the conflict was detected; review the refreshed conflict")]
    Stale(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("watcher for project {0} is disconnected")]
    WatcherDisconnected(ProjectId),

    #[error("project {0} is open for another user")]
    NotOwner(ProjectId),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("merge failed: {0}")]
    Merge(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Wrap a store failure, keeping the full context chain in the message.
    pub fn storage(error: anyhow::Error) -> Self {
        Self::Storage(format!("{error:#}"))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Workspace(WorkspaceError::Io { .. }) => ErrorKind::TransientIo,
            Self::Workspace(_) => ErrorKind::Internal,
            Self::Remote(RemoteError::Auth(_)) => ErrorKind::Auth,
            Self::Remote(RemoteError::Storage(_)) => ErrorKind::Storage,
            Self::Remote(RemoteError::Protocol(_)) => ErrorKind::Internal,
            Self::Remote(_) => ErrorKind::TransientIo,
            Self::Transport(TransportError::Rejected(_)) => ErrorKind::WatcherDisconnected,
            Self::Transport(_) => ErrorKind::TransientIo,
            Self::Resolution(ResolutionError::NotFound(_)) => ErrorKind::NotFound,
            Self::Resolution(_) => ErrorKind::ConflictResolution,
            Self::WatcherDisconnected(_) => ErrorKind::WatcherDisconnected,
            Self::NotOwner(_) => ErrorKind::Forbidden,
            Self::Timeout(_) => ErrorKind::TransientIo,
            Self::Merge(_) => ErrorKind::MergeFailure,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind().retryable()
    }

    pub fn info(&self) -> ErrorInfo {
        ErrorInfo::new(self.kind(), self.to_string())
    }
}
