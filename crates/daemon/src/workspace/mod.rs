// Sandbox workspace access: the "local" copy of every project file.
//
// Providers address files by normalized workspace-relative path. Reading a
// missing file is `Ok(None)`, and deleting one is a no-op.

pub mod local;
pub mod memory;

use std::future::Future;

use trisync_common::hash::ContentHash;
use trisync_common::types::ProjectId;

use crate::error::WorkspaceError;

pub use local::LocalWorkspace;
pub use memory::MemoryWorkspace;

/// One file found while listing a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceEntry {
    pub path: String,
    pub hash: ContentHash,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceFile {
    pub content: String,
    pub hash: ContentHash,
}

/// Read/write-by-path access to a project's sandbox workspace.
///
/// All methods return `Send` futures so passes can run on a multi-threaded
/// runtime.
pub trait WorkspaceProvider: Send + Sync + 'static {
    /// Every text file in the project, keyed by normalized path.
    fn list(
        &self,
        project_id: &ProjectId,
    ) -> impl Future<Output = Result<Vec<WorkspaceEntry>, WorkspaceError>> + Send;

    fn read(
        &self,
        project_id: &ProjectId,
        path: &str,
    ) -> impl Future<Output = Result<Option<WorkspaceFile>, WorkspaceError>> + Send;

    /// Replace the file's content, creating parent directories as needed.
    fn write(
        &self,
        project_id: &ProjectId,
        path: &str,
        content: &str,
    ) -> impl Future<Output = Result<ContentHash, WorkspaceError>> + Send;

    fn delete(
        &self,
        project_id: &ProjectId,
        path: &str,
    ) -> impl Future<Output = Result<(), WorkspaceError>> + Send;

    /// Location handed to the watcher when the project is registered.
    fn workspace_path(&self, project_id: &ProjectId) -> String;
}
