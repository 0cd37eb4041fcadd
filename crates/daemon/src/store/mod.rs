// Persistence: SQLite sync.db, FileRecord cache, conflict store.

pub mod conflicts;
pub mod files;
pub mod meta_db;

pub use conflicts::ConflictStore;
pub use files::FileRecordStore;
pub use meta_db::MetaDb;
