// Directory-backed workspace: `<root>/<project_id>/<path>`.
//
// Writes go to a sibling temp file and are renamed into place, so a watcher
// never observes a half-written file. Dot-prefixed entries (including the temp
// files) are invisible to `list`.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, trace};
use trisync_common::hash::{content_hash, ContentHash};
use trisync_common::path::normalize_path;
use trisync_common::types::ProjectId;

use super::{WorkspaceEntry, WorkspaceFile, WorkspaceProvider};
use crate::error::WorkspaceError;

const TEMP_SUFFIX: &str = ".trisync-tmp";

#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    root: PathBuf,
}

impl LocalWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn project_dir(&self, project_id: &ProjectId) -> PathBuf {
        self.root.join(project_id.as_str())
    }

    fn file_path(&self, project_id: &ProjectId, path: &str) -> Result<PathBuf, WorkspaceError> {
        let normalized = normalize_path(path)?;
        Ok(self.project_dir(project_id).join(normalized))
    }
}

impl WorkspaceProvider for LocalWorkspace {
    async fn list(&self, project_id: &ProjectId) -> Result<Vec<WorkspaceEntry>, WorkspaceError> {
        let base = self.project_dir(project_id);
        let mut entries = Vec::new();
        let mut stack = vec![base.clone()];

        while let Some(dir) = stack.pop() {
            let mut reader = match fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(e) if e.kind() == IoErrorKind::NotFound => continue,
                Err(e) => return Err(WorkspaceError::io(dir.display().to_string(), e)),
            };

            while let Some(entry) = reader
                .next_entry()
                .await
                .map_err(|e| WorkspaceError::io(dir.display().to_string(), e))?
            {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                let full = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| WorkspaceError::io(full.display().to_string(), e))?;

                if file_type.is_dir() {
                    stack.push(full);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                let Some(relative) = relative_path(&base, &full) else {
                    continue;
                };
                let bytes = fs::read(&full)
                    .await
                    .map_err(|e| WorkspaceError::io(full.display().to_string(), e))?;
                match String::from_utf8(bytes) {
                    Ok(text) => entries.push(WorkspaceEntry {
                        hash: content_hash(&text),
                        size: text.len() as u64,
                        path: relative,
                    }),
                    Err(_) => trace!(path = %relative, "skipping non-text workspace file"),
                }
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn read(
        &self,
        project_id: &ProjectId,
        path: &str,
    ) -> Result<Option<WorkspaceFile>, WorkspaceError> {
        let file = self.file_path(project_id, path)?;
        let bytes = match fs::read(&file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(WorkspaceError::io(path, e)),
        };
        let content = String::from_utf8(bytes).map_err(|_| WorkspaceError::NotText(path.into()))?;
        Ok(Some(WorkspaceFile { hash: content_hash(&content), content }))
    }

    async fn write(
        &self,
        project_id: &ProjectId,
        path: &str,
        content: &str,
    ) -> Result<ContentHash, WorkspaceError> {
        let file = self.file_path(project_id, path)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).await.map_err(|e| WorkspaceError::io(path, e))?;
        }

        let temp = temp_path(&file);
        fs::write(&temp, content).await.map_err(|e| WorkspaceError::io(path, e))?;
        if let Err(e) = fs::rename(&temp, &file).await {
            let _ = fs::remove_file(&temp).await;
            return Err(WorkspaceError::io(path, e));
        }

        debug!(project_id = %project_id, path, bytes = content.len(), "wrote workspace file");
        Ok(content_hash(content))
    }

    async fn delete(&self, project_id: &ProjectId, path: &str) -> Result<(), WorkspaceError> {
        let file = self.file_path(project_id, path)?;
        match fs::remove_file(&file).await {
            Ok(()) => {
                debug!(project_id = %project_id, path, "deleted workspace file");
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkspaceError::io(path, e)),
        }
    }

    fn workspace_path(&self, project_id: &ProjectId) -> String {
        self.project_dir(project_id).display().to_string()
    }
}

fn temp_path(file: &Path) -> PathBuf {
    let name = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    file.with_file_name(format!(".{name}{TEMP_SUFFIX}"))
}

/// Workspace-relative, normalized form of `full`, or `None` for names that
/// cannot be keyed (non-UTF-8, too long).
fn relative_path(base: &Path, full: &Path) -> Option<String> {
    let relative = full.strip_prefix(base).ok()?;
    let joined = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?
        .join("/");
    normalize_path(&joined).ok()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn project() -> ProjectId {
        ProjectId::parse("demo").unwrap()
    }

    #[tokio::test]
    async fn write_read_and_list() {
        let tmp = TempDir::new().unwrap();
        let ws = LocalWorkspace::new(tmp.path());

        let hash = ws.write(&project(), "src/main.rs", "fn main() {}").await.unwrap();
        ws.write(&project(), "README.md", "# demo").await.unwrap();

        let file = ws.read(&project(), "src/main.rs").await.unwrap().unwrap();
        assert_eq!(file.content, "fn main() {}");
        assert_eq!(file.hash, hash);

        let listed = ws.list(&project()).await.unwrap();
        let paths: Vec<_> = listed.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "src/main.rs"]);
        assert_eq!(listed[1].hash, hash);
    }

    #[tokio::test]
    async fn missing_project_lists_empty_and_reads_none() {
        let tmp = TempDir::new().unwrap();
        let ws = LocalWorkspace::new(tmp.path());
        assert!(ws.list(&project()).await.unwrap().is_empty());
        assert!(ws.read(&project(), "nope.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dot_entries_and_binary_files_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let ws = LocalWorkspace::new(tmp.path());
        ws.write(&project(), "keep.txt", "x").await.unwrap();

        let dir = ws.project_dir(&project());
        std::fs::create_dir_all(dir.join(".git")).unwrap();
        std::fs::write(dir.join(".git/HEAD"), "ref").unwrap();
        std::fs::write(dir.join("image.bin"), [0xff, 0xfe, 0x00]).unwrap();

        let listed = ws.list(&project()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "keep.txt");
        assert!(matches!(
            ws.read(&project(), "image.bin").await,
            Err(WorkspaceError::NotText(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let ws = LocalWorkspace::new(tmp.path());
        ws.write(&project(), "a.txt", "x").await.unwrap();

        ws.delete(&project(), "a.txt").await.unwrap();
        ws.delete(&project(), "a.txt").await.unwrap();
        assert!(ws.read(&project(), "a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let ws = LocalWorkspace::new(tmp.path());
        let err = ws.write(&project(), "../escape.txt", "x").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidPath(_)));
    }

    #[test]
    fn temp_files_are_hidden_siblings() {
        let temp = temp_path(Path::new("/w/demo/src/a.rs"));
        assert_eq!(temp, PathBuf::from("/w/demo/src/.a.rs.trisync-tmp"));
    }
}
