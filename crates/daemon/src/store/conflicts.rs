// Conflict store: open conflicts keyed by (project_id, file_id).
//
// A row exists while its conflict is open. Applying a resolution removes it.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use trisync_common::merge::ConflictSpan;
use trisync_common::types::{
    ConflictRecord, ConflictState, ConflictType, FileId, ProjectId, VersionSnapshot,
};

const SELECT_COLUMNS: &str = "SELECT project_id, file_id, path, conflict_type, state, \
                                     local_version, remote_version, base_version, \
                                     merged_preview, spans, created_at \
                              FROM conflicts";

pub struct ConflictStore {
    db: Arc<super::MetaDb>,
}

impl ConflictStore {
    pub fn new(db: Arc<super::MetaDb>) -> Self {
        Self { db }
    }

    /// Insert or replace the conflict for a file.
    pub fn upsert(&self, record: &ConflictRecord) -> Result<()> {
        let encode = |value: &VersionSnapshot| serde_json::to_string(value);
        let local = encode(&record.local_version).context("failed to encode local version")?;
        let remote = encode(&record.remote_version).context("failed to encode remote version")?;
        let base = record
            .base_version
            .as_ref()
            .map(encode)
            .transpose()
            .context("failed to encode base version")?;
        let spans = serde_json::to_string(&record.spans).context("failed to encode spans")?;

        self.db
            .connection()
            .execute(
                "INSERT INTO conflicts \
                 (project_id, file_id, path, conflict_type, state, local_version, remote_version, \
                  base_version, merged_preview, spans, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT (project_id, file_id) DO UPDATE SET \
                     path = excluded.path, conflict_type = excluded.conflict_type, \
                     state = excluded.state, local_version = excluded.local_version, \
                     remote_version = excluded.remote_version, base_version = excluded.base_version, \
                     merged_preview = excluded.merged_preview, spans = excluded.spans, \
                     created_at = excluded.created_at",
                params![
                    record.project_id.as_str(),
                    record.file_id.to_string(),
                    record.path,
                    record.conflict_type.as_str(),
                    record.state.as_str(),
                    local,
                    remote,
                    base,
                    record.merged_preview,
                    spans,
                    record.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("failed to upsert conflict for `{}`", record.path))?;
        Ok(())
    }

    pub fn get(&self, project_id: &ProjectId, file_id: &FileId) -> Result<Option<ConflictRecord>> {
        let conn = self.db.connection();
        let sql = format!("{SELECT_COLUMNS} WHERE project_id = ?1 AND file_id = ?2");
        query_one(&conn, &sql, params![project_id.as_str(), file_id.to_string()])
    }

    /// Look up a conflict by file id alone; ids are unique across projects.
    pub fn find(&self, file_id: &FileId) -> Result<Option<ConflictRecord>> {
        let conn = self.db.connection();
        let sql = format!("{SELECT_COLUMNS} WHERE file_id = ?1");
        query_one(&conn, &sql, params![file_id.to_string()])
    }

    pub fn list(&self, project_id: &ProjectId) -> Result<Vec<ConflictRecord>> {
        let conn = self.db.connection();
        let sql = format!("{SELECT_COLUMNS} WHERE project_id = ?1 ORDER BY path ASC");
        let mut stmt = conn.prepare(&sql).context("failed to prepare conflicts query")?;
        let rows = stmt
            .query_map(params![project_id.as_str()], RawConflict::from_row)
            .context("failed to query conflicts")?;

        let mut conflicts = Vec::new();
        for row in rows {
            conflicts.push(row.context("failed to read conflicts row")?.into_record()?);
        }
        Ok(conflicts)
    }

    /// List a project's conflicts for display, moving `detected` ones to `presented`.
    pub fn present(&self, project_id: &ProjectId) -> Result<Vec<ConflictRecord>> {
        self.db
            .connection()
            .execute(
                "UPDATE conflicts SET state = 'presented' \
                 WHERE project_id = ?1 AND state = 'detected'",
                params![project_id.as_str()],
            )
            .context("failed to mark conflicts presented")?;
        self.list(project_id)
    }

    pub fn remove(&self, project_id: &ProjectId, file_id: &FileId) -> Result<bool> {
        let deleted = self
            .db
            .connection()
            .execute(
                "DELETE FROM conflicts WHERE project_id = ?1 AND file_id = ?2",
                params![project_id.as_str(), file_id.to_string()],
            )
            .context("failed to delete conflict")?;
        Ok(deleted > 0)
    }

    pub fn count(&self, project_id: &ProjectId) -> Result<usize> {
        let count: i64 = self
            .db
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM conflicts WHERE project_id = ?1",
                params![project_id.as_str()],
                |row| row.get(0),
            )
            .context("failed to count conflicts")?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn query_one(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<ConflictRecord>> {
    let raw = conn
        .query_row(sql, params, RawConflict::from_row)
        .optional()
        .context("failed to query conflict")?;
    raw.map(RawConflict::into_record).transpose()
}

struct RawConflict {
    project_id: String,
    file_id: String,
    path: String,
    conflict_type: String,
    state: String,
    local_version: String,
    remote_version: String,
    base_version: Option<String>,
    merged_preview: Option<String>,
    spans: String,
    created_at: String,
}

impl RawConflict {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project_id: row.get(0)?,
            file_id: row.get(1)?,
            path: row.get(2)?,
            conflict_type: row.get(3)?,
            state: row.get(4)?,
            local_version: row.get(5)?,
            remote_version: row.get(6)?,
            base_version: row.get(7)?,
            merged_preview: row.get(8)?,
            spans: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<ConflictRecord> {
        let project_id = ProjectId::parse(self.project_id).context("invalid project id")?;
        let file_id = self
            .file_id
            .parse::<FileId>()
            .with_context(|| format!("invalid file id `{}`", self.file_id))?;
        let conflict_type = ConflictType::parse(&self.conflict_type)
            .with_context(|| format!("invalid conflict type `{}`", self.conflict_type))?;
        let state = ConflictState::parse(&self.state)
            .with_context(|| format!("invalid conflict state `{}`", self.state))?;
        let local_version: VersionSnapshot =
            serde_json::from_str(&self.local_version).context("invalid local version")?;
        let remote_version: VersionSnapshot =
            serde_json::from_str(&self.remote_version).context("invalid remote version")?;
        let base_version = self
            .base_version
            .map(|raw| serde_json::from_str::<VersionSnapshot>(&raw))
            .transpose()
            .context("invalid base version")?;
        let spans: Vec<ConflictSpan> =
            serde_json::from_str(&self.spans).context("invalid conflict spans")?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|t| t.with_timezone(&Utc))
            .with_context(|| format!("invalid created_at `{}`", self.created_at))?;

        Ok(ConflictRecord {
            file_id,
            project_id,
            path: self.path,
            conflict_type,
            state,
            local_version,
            remote_version,
            base_version,
            merged_preview: self.merged_preview,
            spans,
            created_at,
            resolution: None,
        })
    }
}
