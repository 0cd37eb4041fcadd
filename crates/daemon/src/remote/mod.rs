// Cloud store access: the "remote" copy of every project file.
//
// Files are addressed by their deterministic FileId; the path travels with
// each write so the store can list what it holds.

pub mod http;
pub mod memory;
pub mod sqlite;

use std::future::Future;

use trisync_common::hash::ContentHash;
use trisync_common::types::{FileId, ProjectId};

use crate::error::RemoteError;

pub use http::HttpRemoteStore;
pub use memory::MemoryRemoteStore;
pub use sqlite::SqliteRemoteStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteKey {
    pub project_id: ProjectId,
    pub file_id: FileId,
    pub path: String,
}

impl RemoteKey {
    pub fn for_path(project_id: &ProjectId, path: &str) -> Self {
        Self {
            project_id: project_id.clone(),
            file_id: FileId::for_path(project_id, path),
            path: path.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub file_id: FileId,
    pub path: String,
    pub hash: ContentHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub content: String,
    pub hash: ContentHash,
}

/// Durable cloud copy of project files.
pub trait RemoteStore: Send + Sync + 'static {
    fn list(
        &self,
        project_id: &ProjectId,
    ) -> impl Future<Output = Result<Vec<RemoteEntry>, RemoteError>> + Send;

    /// `Ok(None)` when the store holds no such file.
    fn get(
        &self,
        key: &RemoteKey,
    ) -> impl Future<Output = Result<Option<RemoteFile>, RemoteError>> + Send;

    fn put(
        &self,
        key: &RemoteKey,
        content: &str,
    ) -> impl Future<Output = Result<ContentHash, RemoteError>> + Send;

    /// Deleting a missing file succeeds.
    fn delete(&self, key: &RemoteKey) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

/// The remote store selected by configuration.
pub enum ConfiguredRemote {
    Http(HttpRemoteStore),
    Sqlite(SqliteRemoteStore),
}

impl RemoteStore for ConfiguredRemote {
    async fn list(&self, project_id: &ProjectId) -> Result<Vec<RemoteEntry>, RemoteError> {
        match self {
            Self::Http(store) => store.list(project_id).await,
            Self::Sqlite(store) => store.list(project_id).await,
        }
    }

    async fn get(&self, key: &RemoteKey) -> Result<Option<RemoteFile>, RemoteError> {
        match self {
            Self::Http(store) => store.get(key).await,
            Self::Sqlite(store) => store.get(key).await,
        }
    }

    async fn put(&self, key: &RemoteKey, content: &str) -> Result<ContentHash, RemoteError> {
        match self {
            Self::Http(store) => store.put(key, content).await,
            Self::Sqlite(store) => store.put(key, content).await,
        }
    }

    async fn delete(&self, key: &RemoteKey) -> Result<(), RemoteError> {
        match self {
            Self::Http(store) => store.delete(key).await,
            Self::Sqlite(store) => store.delete(key).await,
        }
    }
}
