// Durable local stand-in for the cloud store, used when no remote URL is set.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use trisync_common::hash::{content_hash, ContentHash};
use trisync_common::types::{FileId, ProjectId};

use super::{RemoteEntry, RemoteFile, RemoteKey, RemoteStore};
use crate::error::RemoteError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS remote_files (
    project_id  TEXT NOT NULL,
    file_id     TEXT NOT NULL,
    path        TEXT NOT NULL,
    content     TEXT NOT NULL,
    hash        TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (project_id, file_id)
);
"#;

#[derive(Debug)]
pub struct SqliteRemoteStore {
    conn: Mutex<Connection>,
}

impl SqliteRemoteStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create remote store directory `{}`", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open remote store at `{}`", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory().context("failed to open in-memory remote store")?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("failed to configure remote store pragmas")?;
        conn.execute_batch(SCHEMA_SQL).context("failed to create remote_files table")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn storage(error: rusqlite::Error) -> RemoteError {
    RemoteError::Storage(error.to_string())
}

impl RemoteStore for SqliteRemoteStore {
    async fn list(&self, project_id: &ProjectId) -> Result<Vec<RemoteEntry>, RemoteError> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare(
                "SELECT file_id, path, hash FROM remote_files \
                 WHERE project_id = ?1 ORDER BY path ASC",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![project_id.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .map_err(storage)?;

        let mut entries = Vec::new();
        for row in rows {
            let (file_id, path, hash) = row.map_err(storage)?;
            let file_id = file_id
                .parse::<FileId>()
                .map_err(|e| RemoteError::Storage(format!("invalid file id `{file_id}`: {e}")))?;
            entries.push(RemoteEntry { file_id, path, hash });
        }
        Ok(entries)
    }

    async fn get(&self, key: &RemoteKey) -> Result<Option<RemoteFile>, RemoteError> {
        self.connection()
            .query_row(
                "SELECT content, hash FROM remote_files WHERE project_id = ?1 AND file_id = ?2",
                params![key.project_id.as_str(), key.file_id.to_string()],
                |row| Ok(RemoteFile { content: row.get(0)?, hash: row.get(1)? }),
            )
            .optional()
            .map_err(storage)
    }

    async fn put(&self, key: &RemoteKey, content: &str) -> Result<ContentHash, RemoteError> {
        let hash = content_hash(content);
        self.connection()
            .execute(
                "INSERT INTO remote_files (project_id, file_id, path, content, hash, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, datetime('now')) \
                 ON CONFLICT (project_id, file_id) DO UPDATE SET \
                     path = excluded.path, content = excluded.content, \
                     hash = excluded.hash, updated_at = excluded.updated_at",
                params![key.project_id.as_str(), key.file_id.to_string(), key.path, content, hash],
            )
            .map_err(storage)?;
        Ok(hash)
    }

    async fn delete(&self, key: &RemoteKey) -> Result<(), RemoteError> {
        self.connection()
            .execute(
                "DELETE FROM remote_files WHERE project_id = ?1 AND file_id = ?2",
                params![key.project_id.as_str(), key.file_id.to_string()],
            )
            .map_err(storage)?;
        Ok(())
    }
}
