// FileRecord cache: per-project in-memory maps, written through to sync.db.
//
// A project's records are loaded on first access and dropped by `evict`
// when the project closes. Rows stay on disk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use trisync_common::path::normalize::is_within;
use trisync_common::types::{ConflictData, FileId, FileRecord, ProjectId, SyncStatus};

type ProjectRecords = HashMap<FileId, FileRecord>;

pub struct FileRecordStore {
    db: Arc<super::MetaDb>,
    cache: Mutex<HashMap<ProjectId, ProjectRecords>>,
}

impl FileRecordStore {
    pub fn new(db: Arc<super::MetaDb>) -> Self {
        Self { db, cache: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, project_id: &ProjectId, file_id: &FileId) -> Result<Option<FileRecord>> {
        self.with_project(project_id, |records| records.get(file_id).cloned())
    }

    pub fn get_by_path(&self, project_id: &ProjectId, path: &str) -> Result<Option<FileRecord>> {
        self.get(project_id, &FileId::for_path(project_id, path))
    }

    /// All records for a project, ordered by path.
    pub fn list(&self, project_id: &ProjectId) -> Result<Vec<FileRecord>> {
        let mut records = self.with_project(project_id, |records| {
            records.values().cloned().collect::<Vec<_>>()
        })?;
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    pub fn upsert(&self, record: FileRecord) -> Result<()> {
        upsert_row(&self.db.connection(), &record)?;
        let project_id = record.project_id.clone();
        self.with_project(&project_id, |records| {
            records.insert(record.id, record);
        })
    }

    pub fn remove(&self, project_id: &ProjectId, file_id: &FileId) -> Result<bool> {
        let deleted = self
            .db
            .connection()
            .execute(
                "DELETE FROM file_records WHERE project_id = ?1 AND file_id = ?2",
                params![project_id.as_str(), file_id.to_string()],
            )
            .context("failed to delete file record")?;
        self.with_project(project_id, |records| {
            records.remove(file_id);
        })?;
        Ok(deleted > 0)
    }

    /// Flag records at or under `path` as needing a pass.
    ///
    /// Records in `conflict` keep their status. Returns how many changed.
    pub fn mark_pending(&self, project_id: &ProjectId, path: &str) -> Result<usize> {
        let touched = self.with_project(project_id, |records| {
            records
                .values()
                .filter(|r| is_within(&r.path, path))
                .filter(|r| !matches!(r.sync_status, SyncStatus::Conflict | SyncStatus::Pending))
                .map(|r| FileRecord { sync_status: SyncStatus::Pending, ..r.clone() })
                .collect::<Vec<_>>()
        })?;

        let count = touched.len();
        for record in touched {
            self.upsert(record)?;
        }
        Ok(count)
    }

    /// Drop a project's in-memory records; persisted rows are kept.
    pub fn evict(&self, project_id: &ProjectId) -> bool {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).remove(project_id).is_some()
    }

    pub fn is_cached(&self, project_id: &ProjectId) -> bool {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).contains_key(project_id)
    }

    fn with_project<T>(
        &self,
        project_id: &ProjectId,
        f: impl FnOnce(&mut ProjectRecords) -> T,
    ) -> Result<T> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if !cache.contains_key(project_id) {
            let loaded = load_project(&self.db.connection(), project_id)?;
            cache.insert(project_id.clone(), loaded);
        }
        let records = cache.entry(project_id.clone()).or_default();
        Ok(f(records))
    }
}

fn load_project(conn: &Connection, project_id: &ProjectId) -> Result<ProjectRecords> {
    let mut stmt = conn
        .prepare(
            "SELECT file_id, path, content, size, local_hash, remote_hash, base_hash, \
                    sync_status, last_synced_at, conflict_data, last_error \
             FROM file_records \
             WHERE project_id = ?1",
        )
        .context("failed to prepare file_records by project query")?;

    let rows = stmt
        .query_map(params![project_id.as_str()], RawRecord::from_row)
        .context("failed to query file_records by project")?;

    let mut records = HashMap::new();
    for row in rows {
        let raw = row.context("failed to read file_records row")?;
        let record = raw.into_record(project_id.clone())?;
        records.insert(record.id, record);
    }
    Ok(records)
}

fn upsert_row(conn: &Connection, record: &FileRecord) -> Result<()> {
    let conflict_data = record
        .conflict_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("failed to encode conflict data")?;

    conn.execute(
        "INSERT INTO file_records \
         (project_id, file_id, path, content, size, local_hash, remote_hash, base_hash, \
          sync_status, last_synced_at, conflict_data, last_error) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
         ON CONFLICT (project_id, file_id) DO UPDATE SET \
             path = excluded.path, content = excluded.content, size = excluded.size, \
             local_hash = excluded.local_hash, remote_hash = excluded.remote_hash, \
             base_hash = excluded.base_hash, sync_status = excluded.sync_status, \
             last_synced_at = excluded.last_synced_at, conflict_data = excluded.conflict_data, \
             last_error = excluded.last_error",
        params![
            record.project_id.as_str(),
            record.id.to_string(),
            record.path,
            record.content,
            record.size as i64,
            record.local_hash,
            record.remote_hash,
            record.base_hash,
            record.sync_status.as_str(),
            record.last_synced_at.map(|t| t.to_rfc3339()),
            conflict_data,
            record.last_error,
        ],
    )
    .with_context(|| format!("failed to upsert file record for `{}`", record.path))?;
    Ok(())
}

/// Column values as stored, decoded into a FileRecord separately so decode
/// failures carry context.
struct RawRecord {
    file_id: String,
    path: String,
    content: Option<String>,
    size: i64,
    local_hash: Option<String>,
    remote_hash: Option<String>,
    base_hash: Option<String>,
    sync_status: String,
    last_synced_at: Option<String>,
    conflict_data: Option<String>,
    last_error: Option<String>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            file_id: row.get(0)?,
            path: row.get(1)?,
            content: row.get(2)?,
            size: row.get(3)?,
            local_hash: row.get(4)?,
            remote_hash: row.get(5)?,
            base_hash: row.get(6)?,
            sync_status: row.get(7)?,
            last_synced_at: row.get(8)?,
            conflict_data: row.get(9)?,
            last_error: row.get(10)?,
        })
    }

    fn into_record(self, project_id: ProjectId) -> Result<FileRecord> {
        let id = self
            .file_id
            .parse::<FileId>()
            .with_context(|| format!("invalid file id `{}`", self.file_id))?;
        let sync_status = SyncStatus::parse(&self.sync_status)
            .with_context(|| format!("invalid sync status `{}`", self.sync_status))?;
        let last_synced_at = self
            .last_synced_at
            .map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|t| t.with_timezone(&Utc))
                    .with_context(|| format!("invalid last_synced_at `{raw}`"))
            })
            .transpose()?;
        let conflict_data = self
            .conflict_data
            .map(|raw| serde_json::from_str::<ConflictData>(&raw))
            .transpose()
            .context("invalid conflict data")?;

        Ok(FileRecord {
            id,
            project_id,
            path: self.path,
            content: self.content,
            size: u64::try_from(self.size).unwrap_or(0),
            local_hash: self.local_hash,
            remote_hash: self.remote_hash,
            base_hash: self.base_hash,
            sync_status,
            last_synced_at,
            conflict_data,
            last_error: self.last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetaDb;

    fn store() -> (Arc<MetaDb>, FileRecordStore) {
        let db = Arc::new(MetaDb::open_in_memory().expect("db should open"));
        (db.clone(), FileRecordStore::new(db))
    }

    fn project() -> ProjectId {
        ProjectId::parse("demo").unwrap()
    }

    fn synced(path: &str, content: &str) -> FileRecord {
        let mut record = FileRecord::new(project(), path.to_string());
        let (local_hash, remote_hash) = (format!("h-{content}"), format!("r-{content}"));
        record.mark_synced(content.to_string(), local_hash, remote_hash, Utc::now());
        record
    }

    #[test]
    fn upsert_then_reload_after_evict() {
        let (_db, store) = store();
        store.upsert(synced("src/a.rs", "one")).unwrap();
        store.upsert(synced("b.txt", "two")).unwrap();

        assert!(store.evict(&project()));
        assert!(!store.is_cached(&project()));

        let records = store.list(&project()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "b.txt");
        assert_eq!(records[1].content.as_deref(), Some("one"));
        assert_eq!(records[1].sync_status, SyncStatus::Synced);
        assert!(records[1].last_synced_at.is_some());
    }

    #[test]
    fn get_by_path_uses_deterministic_id() {
        let (_db, store) = store();
        store.upsert(synced("notes.md", "x")).unwrap();
        let found = store.get_by_path(&project(), "notes.md").unwrap().unwrap();
        assert_eq!(found.id, FileId::for_path(&project(), "notes.md"));
    }

    #[test]
    fn remove_deletes_row_and_cache_entry() {
        let (_db, store) = store();
        let record = synced("gone.txt", "x");
        let id = record.id;
        store.upsert(record).unwrap();

        assert!(store.remove(&project(), &id).unwrap());
        assert!(store.get(&project(), &id).unwrap().is_none());
        store.evict(&project());
        assert!(store.get(&project(), &id).unwrap().is_none());
        assert!(!store.remove(&project(), &id).unwrap());
    }

    #[test]
    fn mark_pending_covers_directory_and_skips_conflicts() {
        let (_db, store) = store();
        store.upsert(synced("src/a.rs", "a")).unwrap();
        store.upsert(synced("src/b.rs", "b")).unwrap();
        store.upsert(synced("srcs/c.rs", "c")).unwrap();
        let mut conflicted = synced("src/d.rs", "d");
        conflicted.sync_status = SyncStatus::Conflict;
        store.upsert(conflicted).unwrap();

        assert_eq!(store.mark_pending(&project(), "src").unwrap(), 2);

        let status = |path: &str| store.get_by_path(&project(), path).unwrap().unwrap().sync_status;
        assert_eq!(status("src/a.rs"), SyncStatus::Pending);
        assert_eq!(status("srcs/c.rs"), SyncStatus::Synced);
        assert_eq!(status("src/d.rs"), SyncStatus::Conflict);
    }

    #[test]
    fn projects_are_isolated() {
        let (_db, store) = store();
        store.upsert(synced("a.txt", "x")).unwrap();
        let other = ProjectId::parse("other").unwrap();
        assert!(store.list(&other).unwrap().is_empty());
    }
}
