use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use trisync_common::hash::{content_hash, ContentHash};
use trisync_common::path::normalize_path;
use trisync_common::types::ProjectId;

use super::{WorkspaceEntry, WorkspaceFile, WorkspaceProvider};
use crate::error::WorkspaceError;

/// In-memory workspace. Clones share the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryWorkspace {
    files: Arc<Mutex<HashMap<ProjectId, BTreeMap<String, String>>>>,
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a file directly, bypassing the provider API.
    pub fn insert(&self, project_id: &ProjectId, path: &str, content: &str) {
        self.lock().entry(project_id.clone()).or_default().insert(path.into(), content.into());
    }

    pub fn remove(&self, project_id: &ProjectId, path: &str) {
        if let Some(files) = self.lock().get_mut(project_id) {
            files.remove(path);
        }
    }

    pub fn content(&self, project_id: &ProjectId, path: &str) -> Option<String> {
        self.lock().get(project_id).and_then(|files| files.get(path).cloned())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProjectId, BTreeMap<String, String>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkspaceProvider for MemoryWorkspace {
    async fn list(&self, project_id: &ProjectId) -> Result<Vec<WorkspaceEntry>, WorkspaceError> {
        let files = self.lock();
        Ok(files
            .get(project_id)
            .map(|files| {
                files
                    .iter()
                    .map(|(path, content)| WorkspaceEntry {
                        path: path.clone(),
                        hash: content_hash(content),
                        size: content.len() as u64,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read(
        &self,
        project_id: &ProjectId,
        path: &str,
    ) -> Result<Option<WorkspaceFile>, WorkspaceError> {
        let path = normalize_path(path)?;
        Ok(self.content(project_id, &path).map(|content| WorkspaceFile {
            hash: content_hash(&content),
            content,
        }))
    }

    async fn write(
        &self,
        project_id: &ProjectId,
        path: &str,
        content: &str,
    ) -> Result<ContentHash, WorkspaceError> {
        let path = normalize_path(path)?;
        self.insert(project_id, &path, content);
        Ok(content_hash(content))
    }

    async fn delete(&self, project_id: &ProjectId, path: &str) -> Result<(), WorkspaceError> {
        let path = normalize_path(path)?;
        self.remove(project_id, &path);
        Ok(())
    }

    fn workspace_path(&self, project_id: &ProjectId) -> String {
        format!("memory://{project_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_state() {
        let project = ProjectId::parse("demo").unwrap();
        let ws = MemoryWorkspace::new();
        let other = ws.clone();

        ws.write(&project, "a\\b.txt", "hello").await.unwrap();
        assert_eq!(other.content(&project, "a/b.txt").as_deref(), Some("hello"));
        assert_eq!(other.list(&project).await.unwrap()[0].path, "a/b.txt");

        other.delete(&project, "a/b.txt").await.unwrap();
        assert!(ws.read(&project, "a/b.txt").await.unwrap().is_none());
    }
}
