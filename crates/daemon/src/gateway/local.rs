// In-process watcher channel backed by `notify`.
//
// Serves the same protocol as a remote watcher service: `register` starts an
// OS-native watcher on the workspace path and answers `registered`, after
// which filesystem changes arrive as file/dir messages with paths relative to
// the workspace root.

use std::collections::VecDeque;
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use notify::event::{CreateKind, ModifyKind, RemoveKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use trisync_common::path::normalize_path;
use trisync_common::protocol::watcher::WatcherMessage;

use super::transport::{WatcherConnector, WatcherTransport};
use crate::error::TransportError;

const EVENT_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone, Default)]
pub struct LocalConnector;

impl WatcherConnector for LocalConnector {
    type Transport = LocalTransport;

    async fn connect(&self) -> Result<LocalTransport, TransportError> {
        Ok(LocalTransport::new())
    }
}

pub struct LocalTransport {
    replies: VecDeque<WatcherMessage>,
    events_tx: mpsc::Sender<WatcherMessage>,
    events_rx: mpsc::Receiver<WatcherMessage>,
    watcher: Option<RecommendedWatcher>,
}

impl LocalTransport {
    fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self { replies: VecDeque::new(), events_tx, events_rx, watcher: None }
    }

    fn start_watcher(&self, workspace_path: &str) -> anyhow::Result<RecommendedWatcher> {
        let root = Path::new(workspace_path);
        std::fs::create_dir_all(root)
            .with_context(|| format!("failed to create workspace `{workspace_path}`"))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("failed to canonicalize `{workspace_path}`"))?;

        let tx = self.events_tx.clone();
        let filter_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for message in translate_event(&event, &filter_root) {
                    if tx.blocking_send(message).is_err() {
                        debug!("watcher channel closed, stopping event dispatch");
                        return;
                    }
                }
            }
            Err(e) => error!(error = %e, "file watcher error"),
        })
        .context("failed to create file watcher")?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch `{}`", root.display()))?;
        debug!(path = %root.display(), "local watcher started");
        Ok(watcher)
    }
}

impl WatcherTransport for LocalTransport {
    async fn send(&mut self, message: WatcherMessage) -> Result<(), TransportError> {
        match message {
            WatcherMessage::Register { project_id, workspace_path, .. } => {
                match self.start_watcher(&workspace_path) {
                    Ok(watcher) => {
                        self.watcher = Some(watcher);
                        self.replies.push_back(WatcherMessage::Registered { project_id });
                    }
                    Err(e) => {
                        warn!(project_id = %project_id, error = %e, "local watcher failed to start");
                        self.replies.push_back(WatcherMessage::Error { error: format!("{e:#}") });
                    }
                }
                Ok(())
            }
            WatcherMessage::Unregister { project_id } => {
                self.watcher = None;
                self.replies.push_back(WatcherMessage::Unregistered { project_id });
                Ok(())
            }
            other => Err(TransportError::Protocol(format!(
                "`{}` is not a client message",
                other.type_name()
            ))),
        }
    }

    async fn recv(&mut self) -> Result<Option<WatcherMessage>, TransportError> {
        if let Some(reply) = self.replies.pop_front() {
            return Ok(Some(reply));
        }
        Ok(self.events_rx.recv().await)
    }
}

/// Translate a `notify::Event` into protocol messages for paths under `root`.
fn translate_event(event: &Event, root: &Path) -> Vec<WatcherMessage> {
    let timestamp = Utc::now();
    let mut messages = Vec::new();

    for path in &event.paths {
        let Some(relative) = relative_path(path, root) else {
            continue;
        };
        let is_dir = path.is_dir();
        let message = match &event.kind {
            EventKind::Create(CreateKind::Folder) => {
                WatcherMessage::DirAdded { dir_path: relative, timestamp }
            }
            EventKind::Create(_) if is_dir => WatcherMessage::DirAdded { dir_path: relative, timestamp },
            EventKind::Create(_) => WatcherMessage::FileAdded { file_path: relative, timestamp },
            EventKind::Modify(ModifyKind::Metadata(_)) => {
                trace!("skipping metadata-only modify event");
                continue;
            }
            EventKind::Modify(ModifyKind::Name(_)) if is_dir => {
                WatcherMessage::DirAdded { dir_path: relative, timestamp }
            }
            EventKind::Modify(ModifyKind::Name(_)) if path.exists() => {
                WatcherMessage::FileAdded { file_path: relative, timestamp }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                WatcherMessage::FileDeleted { file_path: relative, timestamp }
            }
            EventKind::Modify(_) if is_dir => continue,
            EventKind::Modify(_) => WatcherMessage::FileChanged { file_path: relative, timestamp },
            EventKind::Remove(RemoveKind::Folder) => {
                WatcherMessage::DirDeleted { dir_path: relative, timestamp }
            }
            EventKind::Remove(_) => WatcherMessage::FileDeleted { file_path: relative, timestamp },
            _ => {
                trace!(kind = ?event.kind, "skipping non-content event");
                continue;
            }
        };
        messages.push(message);
    }
    messages
}

/// Normalized workspace-relative path, or `None` for paths outside the root,
/// hidden entries, and the workspace's own temp files.
fn relative_path(path: &Path, root: &Path) -> Option<String> {
    let Ok(relative) = path.strip_prefix(root) else {
        warn!(path = %path.display(), "ignoring event outside watch root");
        return None;
    };
    let mut parts = Vec::new();
    for component in relative.components() {
        let part = component.as_os_str().to_str()?;
        if part.starts_with('.') {
            return None;
        }
        parts.push(part);
    }
    normalize_path(&parts.join("/")).ok()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use notify::event::DataChange;
    use tempfile::TempDir;
    use tokio::time::timeout;
    use trisync_common::types::ProjectId;

    use super::*;

    fn make_event(kind: EventKind, paths: Vec<PathBuf>) -> Event {
        Event { kind, paths, attrs: Default::default() }
    }

    #[test]
    fn translates_file_lifecycle() {
        let root = PathBuf::from("/workspace");
        let path = vec![PathBuf::from("/workspace/src/app.ts")];

        let added = translate_event(&make_event(EventKind::Create(CreateKind::File), path.clone()), &root);
        assert!(matches!(&added[..], [WatcherMessage::FileAdded { file_path, .. }] if file_path == "src/app.ts"));

        let changed = translate_event(
            &make_event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), path.clone()),
            &root,
        );
        assert!(matches!(&changed[..], [WatcherMessage::FileChanged { .. }]));

        let removed = translate_event(&make_event(EventKind::Remove(RemoveKind::File), path), &root);
        assert!(matches!(&removed[..], [WatcherMessage::FileDeleted { .. }]));
    }

    #[test]
    fn translates_directory_events() {
        let root = PathBuf::from("/workspace");
        let dir = vec![PathBuf::from("/workspace/src")];
        let added = translate_event(&make_event(EventKind::Create(CreateKind::Folder), dir.clone()), &root);
        assert!(matches!(&added[..], [WatcherMessage::DirAdded { dir_path, .. }] if dir_path == "src"));
        let removed = translate_event(&make_event(EventKind::Remove(RemoveKind::Folder), dir), &root);
        assert!(matches!(&removed[..], [WatcherMessage::DirDeleted { .. }]));
    }

    #[test]
    fn skips_hidden_outside_and_metadata_events() {
        let root = PathBuf::from("/workspace");
        let hidden = make_event(
            EventKind::Create(CreateKind::File),
            vec![PathBuf::from("/workspace/.git/index"), PathBuf::from("/workspace/.a.rs.trisync-tmp")],
        );
        assert!(translate_event(&hidden, &root).is_empty());

        let outside = make_event(EventKind::Create(CreateKind::File), vec![PathBuf::from("/etc/passwd")]);
        assert!(translate_event(&outside, &root).is_empty());

        let metadata = make_event(
            EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::Permissions)),
            vec![PathBuf::from("/workspace/a.txt")],
        );
        assert!(translate_event(&metadata, &root).is_empty());
    }

    #[tokio::test]
    async fn register_then_observe_real_write() {
        let tmp = TempDir::new().unwrap();
        let workspace = tmp.path().join("demo");
        let project = ProjectId::parse("demo").unwrap();

        let mut transport = LocalConnector.connect().await.unwrap();
        transport
            .send(WatcherMessage::Register {
                project_id: project.clone(),
                workspace_path: workspace.display().to_string(),
                container_id: "local".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            transport.recv().await.unwrap(),
            Some(WatcherMessage::Registered { project_id: project.clone() })
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(workspace.join("notes.txt"), "hello").unwrap();

        let message = timeout(Duration::from_secs(5), transport.recv())
            .await
            .expect("should observe the write")
            .unwrap()
            .unwrap();
        let event = message.into_event().expect("a file event");
        assert_eq!(event.path, "notes.txt");

        transport.send(WatcherMessage::Unregister { project_id: project.clone() }).await.unwrap();
        assert_eq!(
            transport.recv().await.unwrap(),
            Some(WatcherMessage::Unregistered { project_id: project })
        );
    }

    #[tokio::test]
    async fn rejects_server_messages() {
        let mut transport = LocalConnector.connect().await.unwrap();
        let err = transport.send(WatcherMessage::Error { error: "x".into() }).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
