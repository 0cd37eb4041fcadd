// In-memory cloud store with fault injection.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use trisync_common::hash::{content_hash, ContentHash};
use trisync_common::types::{FileId, ProjectId};

use super::{RemoteEntry, RemoteFile, RemoteKey, RemoteStore};
use crate::error::RemoteError;

#[derive(Debug, Default)]
struct State {
    files: HashMap<ProjectId, BTreeMap<FileId, (String, String)>>,
    /// Per-file queue of errors to return before succeeding again.
    failures: HashMap<FileId, Vec<RemoteError>>,
    auth_failure: Option<String>,
    latency: Option<Duration>,
    hash_prefix: Option<String>,
    counters: Counters,
}

impl State {
    fn hash(&self, content: &str) -> ContentHash {
        match &self.hash_prefix {
            Some(prefix) => format!("{prefix}{}", content_hash(content)),
            None => content_hash(content),
        }
    }
}

/// Calls served, including failed ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub lists: usize,
    pub gets: usize,
    pub puts: usize,
    pub deletes: usize,
}

/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemoteStore {
    state: Arc<Mutex<State>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project_id: &ProjectId, path: &str, content: &str) {
        let id = FileId::for_path(project_id, path);
        self.lock()
            .files
            .entry(project_id.clone())
            .or_default()
            .insert(id, (path.to_string(), content.to_string()));
    }

    pub fn remove(&self, project_id: &ProjectId, path: &str) {
        let id = FileId::for_path(project_id, path);
        if let Some(files) = self.lock().files.get_mut(project_id) {
            files.remove(&id);
        }
    }

    pub fn content(&self, project_id: &ProjectId, path: &str) -> Option<String> {
        let id = FileId::for_path(project_id, path);
        self.lock().files.get(project_id)?.get(&id).map(|(_, content)| content.clone())
    }

    /// Fail the next `times` calls touching `file_id` with `error`.
    pub fn fail_next(&self, file_id: FileId, times: usize, error: RemoteError) {
        self.lock().failures.entry(file_id).or_default().extend(std::iter::repeat_n(error, times));
    }

    /// Reject every call with an auth error until cleared with `None`.
    pub fn set_auth_failure(&self, message: Option<&str>) {
        self.lock().auth_failure = message.map(str::to_string);
    }

    /// Delay every call, so tests can observe a pass in flight.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Report hashes in the store's own scheme instead of plain SHA-256 hex.
    pub fn set_hash_prefix(&self, prefix: Option<&str>) {
        self.lock().hash_prefix = prefix.map(str::to_string);
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self, file_id: Option<&FileId>) -> Result<(), RemoteError> {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if let Some(message) = &state.auth_failure {
            return Err(RemoteError::Auth(message.clone()));
        }
        if let Some(queue) = file_id.and_then(|id| state.failures.get_mut(id)) {
            if !queue.is_empty() {
                return Err(queue.remove(0));
            }
        }
        Ok(())
    }
}

impl RemoteStore for MemoryRemoteStore {
    async fn list(&self, project_id: &ProjectId) -> Result<Vec<RemoteEntry>, RemoteError> {
        self.lock().counters.lists += 1;
        self.enter(None).await?;
        let state = self.lock();
        Ok(state
            .files
            .get(project_id)
            .map(|files| {
                files
                    .iter()
                    .map(|(id, (path, content))| RemoteEntry {
                        file_id: *id,
                        path: path.clone(),
                        hash: state.hash(content),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, key: &RemoteKey) -> Result<Option<RemoteFile>, RemoteError> {
        self.lock().counters.gets += 1;
        self.enter(Some(&key.file_id)).await?;
        let state = self.lock();
        Ok(state.files.get(&key.project_id).and_then(|files| files.get(&key.file_id)).map(
            |(_, content)| RemoteFile { content: content.clone(), hash: state.hash(content) },
        ))
    }

    async fn put(&self, key: &RemoteKey, content: &str) -> Result<ContentHash, RemoteError> {
        self.lock().counters.puts += 1;
        self.enter(Some(&key.file_id)).await?;
        let mut state = self.lock();
        state
            .files
            .entry(key.project_id.clone())
            .or_default()
            .insert(key.file_id, (key.path.clone(), content.to_string()));
        Ok(state.hash(content))
    }

    async fn delete(&self, key: &RemoteKey) -> Result<(), RemoteError> {
        self.lock().counters.deletes += 1;
        self.enter(Some(&key.file_id)).await?;
        if let Some(files) = self.lock().files.get_mut(&key.project_id) {
            files.remove(&key.file_id);
        }
        Ok(())
    }
}
