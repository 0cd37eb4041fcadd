// Message types for the watcher channel (trisync-watcher.v1).
//
// JSON text frames, one message per frame, discriminated by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ProjectId;

pub const PROTOCOL_NAME: &str = "trisync-watcher.v1";

/// All messages exchanged on the watcher channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WatcherMessage {
    /// Client -> Server: start watching a workspace.
    #[serde(rename_all = "camelCase")]
    Register { project_id: ProjectId, workspace_path: String, container_id: String },

    /// Server -> Client: registration accepted.
    #[serde(rename_all = "camelCase")]
    Registered { project_id: ProjectId },

    /// Client -> Server: stop watching.
    #[serde(rename_all = "camelCase")]
    Unregister { project_id: ProjectId },

    /// Server -> Client: unregistration acknowledged.
    #[serde(rename_all = "camelCase")]
    Unregistered { project_id: ProjectId },

    /// Server -> Client: registration or channel failure.
    Error { error: String },

    #[serde(rename_all = "camelCase")]
    FileAdded { file_path: String, timestamp: DateTime<Utc> },

    #[serde(rename_all = "camelCase")]
    FileChanged { file_path: String, timestamp: DateTime<Utc> },

    #[serde(rename_all = "camelCase")]
    FileDeleted { file_path: String, timestamp: DateTime<Utc> },

    #[serde(rename_all = "camelCase")]
    DirAdded { dir_path: String, timestamp: DateTime<Utc> },

    #[serde(rename_all = "camelCase")]
    DirDeleted { dir_path: String, timestamp: DateTime<Utc> },
}

impl WatcherMessage {
    /// The wire discriminator, e.g. `file-changed`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Registered { .. } => "registered",
            Self::Unregister { .. } => "unregister",
            Self::Unregistered { .. } => "unregistered",
            Self::Error { .. } => "error",
            Self::FileAdded { .. } => "file-added",
            Self::FileChanged { .. } => "file-changed",
            Self::FileDeleted { .. } => "file-deleted",
            Self::DirAdded { .. } => "dir-added",
            Self::DirDeleted { .. } => "dir-deleted",
        }
    }

    /// Filesystem notifications convert to events; control messages don't.
    pub fn into_event(self) -> Option<WatcherEvent> {
        let (kind, path, timestamp) = match self {
            Self::FileAdded { file_path, timestamp } => (WatchEventKind::FileAdded, file_path, timestamp),
            Self::FileChanged { file_path, timestamp } => {
                (WatchEventKind::FileChanged, file_path, timestamp)
            }
            Self::FileDeleted { file_path, timestamp } => {
                (WatchEventKind::FileDeleted, file_path, timestamp)
            }
            Self::DirAdded { dir_path, timestamp } => (WatchEventKind::DirAdded, dir_path, timestamp),
            Self::DirDeleted { dir_path, timestamp } => (WatchEventKind::DirDeleted, dir_path, timestamp),
            _ => return None,
        };
        Some(WatcherEvent { kind, path, timestamp })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum WatchEventKind {
    FileAdded,
    FileChanged,
    FileDeleted,
    DirAdded,
    DirDeleted,
}

impl WatchEventKind {
    pub fn is_dir(self) -> bool {
        matches!(self, Self::DirAdded | Self::DirDeleted)
    }
}

/// A filesystem change delivered to gateway subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WatcherEvent {
    pub kind: WatchEventKind,
    pub path: String,
    pub timestamp: DateTime<Utc>,
}

impl WatcherEvent {
    pub fn into_message(self) -> WatcherMessage {
        let Self { kind, path, timestamp } = self;
        match kind {
            WatchEventKind::FileAdded => WatcherMessage::FileAdded { file_path: path, timestamp },
            WatchEventKind::FileChanged => WatcherMessage::FileChanged { file_path: path, timestamp },
            WatchEventKind::FileDeleted => WatcherMessage::FileDeleted { file_path: path, timestamp },
            WatchEventKind::DirAdded => WatcherMessage::DirAdded { dir_path: path, timestamp },
            WatchEventKind::DirDeleted => WatcherMessage::DirDeleted { dir_path: path, timestamp },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn project() -> ProjectId {
        ProjectId::parse("demo").unwrap()
    }

    #[test]
    fn register_uses_camel_case_fields() {
        let msg = WatcherMessage::Register {
            project_id: project(),
            workspace_path: "/workspace/demo".into(),
            container_id: "c-1".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "register",
                "projectId": "demo",
                "workspacePath": "/workspace/demo",
                "containerId": "c-1",
            })
        );
    }

    #[test]
    fn file_events_parse_from_server_frames() {
        let raw = r#"{"type":"file-changed","filePath":"src/app.ts","timestamp":"2024-05-01T12:00:00Z"}"#;
        let msg: WatcherMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.type_name(), "file-changed");

        let event = msg.into_event().unwrap();
        assert_eq!(event.kind, WatchEventKind::FileChanged);
        assert_eq!(event.path, "src/app.ts");
    }

    #[test]
    fn dir_events_use_dir_path() {
        let raw = r#"{"type":"dir-deleted","dirPath":"build","timestamp":"2024-05-01T12:00:00Z"}"#;
        let event = serde_json::from_str::<WatcherMessage>(raw).unwrap().into_event().unwrap();
        assert!(event.kind.is_dir());
        assert_eq!(event.path, "build");
    }

    #[test]
    fn control_messages_are_not_events() {
        let msg = WatcherMessage::Error { error: "no such container".into() };
        assert!(msg.into_event().is_none());
    }

    #[test]
    fn event_message_conversion_is_lossless() {
        let event = WatcherEvent {
            kind: WatchEventKind::FileDeleted,
            path: "a/b.txt".into(),
            timestamp: Utc::now(),
        };
        assert_eq!(event.clone().into_message().into_event(), Some(event));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<WatcherMessage>(r#"{"type":"rename"}"#).is_err());
    }
}
