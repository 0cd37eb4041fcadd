use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE file_records (
    project_id      TEXT NOT NULL,
    file_id         TEXT NOT NULL,
    path            TEXT NOT NULL,
    content         TEXT NULL,
    size            INTEGER NOT NULL DEFAULT 0,
    local_hash      TEXT NULL,
    remote_hash     TEXT NULL,
    base_hash       TEXT NULL,
    sync_status     TEXT NOT NULL,
    last_synced_at  TEXT NULL,
    conflict_data   TEXT NULL,
    PRIMARY KEY (project_id, file_id)
);

CREATE INDEX file_records_path_idx
    ON file_records (project_id, path);

CREATE TABLE conflicts (
    project_id      TEXT NOT NULL,
    file_id         TEXT NOT NULL,
    path            TEXT NOT NULL,
    conflict_type   TEXT NOT NULL
        CHECK (conflict_type IN ('modify-modify', 'delete-modify', 'content-diverged')),
    state           TEXT NOT NULL
        CHECK (state IN ('detected', 'presented', 'auto-resolved', 'resolved')),
    local_version   TEXT NOT NULL,
    remote_version  TEXT NOT NULL,
    base_version    TEXT NULL,
    merged_preview  TEXT NULL,
    spans           TEXT NOT NULL DEFAULT '[]',
    created_at      TEXT NOT NULL,
    PRIMARY KEY (project_id, file_id)
);

CREATE INDEX conflicts_file_idx
    ON conflicts (file_id);
"#;

const MIGRATION_V2_SQL: &str = r#"
ALTER TABLE file_records ADD COLUMN last_error TEXT NULL;
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL), (2, MIGRATION_V2_SQL)];

/// The daemon's SQLite database (`sync.db`).
///
/// Holds FileRecords and conflicts. The connection is shared behind a mutex;
/// statements are short and never held across an await.
#[derive(Debug)]
pub struct MetaDb {
    conn: Mutex<Connection>,
}

impl MetaDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create sync.db parent directory `{}`", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sync.db at `{}`", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sync.db")?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            ",
        )
        .context("failed to configure sqlite pragmas for sync.db")?;

        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schema_version(&self) -> Result<i64> {
        current_schema_version(&self.connection())
    }
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply sync.db migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        current_version = *version;
    }

    Ok(())
}
