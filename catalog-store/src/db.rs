//! Connection management, schema migrations and the column-existence cache.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::CatalogError;

/// Schema version produced by a fresh open. Migrations are forward-only and
/// append-only: never edit an existing migration, add a new one and bump this.
pub const CURRENT_SCHEMA_VERSION: i64 = 4;

/// SQLite-backed catalog.
///
/// All writes go through a single connection behind a mutex; readers share
/// the same lock and therefore never observe a partial write. The mutex is
/// never held across file I/O outside the database itself.
#[derive(Debug)]
pub struct Catalog {
    pub(crate) conn: Mutex<Connection>,
    columns: Mutex<HashSet<String>>,
}

impl Catalog {
    /// Open or create the catalog at `path`, creating parent directories and
    /// running any pending schema migrations.
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let catalog = Self {
            conn: Mutex::new(conn),
            columns: Mutex::new(HashSet::new()),
        };
        catalog.migrate()?;
        Ok(catalog)
    }

    /// In-memory catalog for tests.
    pub fn open_in_memory() -> Result<Self, CatalogError> {
        let conn = Connection::open_in_memory()?;
        let catalog = Self {
            conn: Mutex::new(conn),
            columns: Mutex::new(HashSet::new()),
        };
        catalog.migrate()?;
        Ok(catalog)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current persisted schema version.
    pub fn schema_version(&self) -> Result<i64, CatalogError> {
        let conn = self.lock();
        Ok(read_version(&conn)?)
    }

    /// Cheap column-existence check backed by the cache populated at open
    /// and after every migration. Callers must not probe the schema with
    /// ad-hoc PRAGMAs on hot paths.
    pub fn column_exists(&self, table: &str, column: &str) -> bool {
        let cache = self.columns.lock().unwrap_or_else(|e| e.into_inner());
        cache.contains(&format!("{table}.{column}"))
    }

    fn refresh_column_cache(&self) -> Result<(), CatalogError> {
        let conn = self.lock();
        let mut cache = self.columns.lock().unwrap_or_else(|e| e.into_inner());
        cache.clear();

        let tables: Vec<String> = {
            let mut stmt =
                conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };

        for table in tables {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
            let cols = stmt.query_map([], |row| row.get::<_, String>(1))?;
            for col in cols {
                cache.insert(format!("{table}.{}", col?));
            }
        }
        debug!(entries = cache.len(), "schema column cache refreshed");
        Ok(())
    }

    fn migrate(&self) -> Result<(), CatalogError> {
        {
            let conn = self.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);",
            )?;

            let mut version = read_version(&conn)?;
            if version > CURRENT_SCHEMA_VERSION {
                return Err(CatalogError::SchemaTooNew {
                    found: version,
                    supported: CURRENT_SCHEMA_VERSION,
                });
            }

            while version < CURRENT_SCHEMA_VERSION {
                let next = version + 1;
                info!(from = version, to = next, "applying catalog migration");
                apply_migration(&conn, next)?;
                write_version(&conn, next)?;
                version = next;
            }
        }
        self.refresh_column_cache()
    }
}

fn read_version(conn: &Connection) -> Result<i64, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT version FROM schema_version LIMIT 1")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => row.get(0),
        None => Ok(0),
    }
}

fn write_version(conn: &Connection, version: i64) -> Result<(), rusqlite::Error> {
    let updated = conn.execute("UPDATE schema_version SET version = ?1", [version])?;
    if updated == 0 {
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    }
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, rusqlite::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn column_present(conn: &Connection, table: &str, column: &str) -> Result<bool, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let cols = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for col in cols {
        if col? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<(), rusqlite::Error> {
    if column_present(conn, table, column)? {
        warn!(table, column, "migration column already present, skipping");
        return Ok(());
    }
    conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl};"))?;
    Ok(())
}

/// One migration step from `to - 1` to `to`. Each step is idempotent on
/// partial completion: table creation uses IF NOT EXISTS and column
/// additions check for presence first.
fn apply_migration(conn: &Connection, to: i64) -> Result<(), CatalogError> {
    match to {
        1 => {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS streams (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     name TEXT NOT NULL UNIQUE,
                     url TEXT NOT NULL,
                     enabled INTEGER DEFAULT 1,
                     streaming_enabled INTEGER DEFAULT 1,
                     width INTEGER DEFAULT 1280,
                     height INTEGER DEFAULT 720,
                     fps INTEGER DEFAULT 30,
                     codec TEXT DEFAULT 'h264',
                     priority INTEGER DEFAULT 5,
                     record INTEGER DEFAULT 1,
                     segment_duration INTEGER DEFAULT 900
                 );

                 CREATE TABLE IF NOT EXISTS segments (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     stream_name TEXT NOT NULL,
                     file_path TEXT NOT NULL UNIQUE,
                     start_time INTEGER NOT NULL,
                     end_time INTEGER,
                     size_bytes INTEGER DEFAULT 0,
                     width INTEGER,
                     height INTEGER,
                     fps INTEGER,
                     codec TEXT,
                     is_complete INTEGER DEFAULT 0,
                     created_at INTEGER NOT NULL
                 );

                 CREATE TABLE IF NOT EXISTS events (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     type INTEGER NOT NULL,
                     stream_name TEXT,
                     message TEXT NOT NULL,
                     file_path TEXT,
                     count INTEGER DEFAULT 1,
                     created_at INTEGER NOT NULL
                 );

                 CREATE INDEX IF NOT EXISTS idx_streams_name ON streams (name);
                 CREATE INDEX IF NOT EXISTS idx_segments_start_time ON segments (start_time);
                 CREATE INDEX IF NOT EXISTS idx_segments_end_time ON segments (end_time);
                 CREATE INDEX IF NOT EXISTS idx_segments_stream ON segments (stream_name);
                 CREATE INDEX IF NOT EXISTS idx_segments_complete_stream_start
                     ON segments (is_complete, stream_name, start_time);
                 CREATE INDEX IF NOT EXISTS idx_events_created_at ON events (created_at);
                 CREATE INDEX IF NOT EXISTS idx_events_type ON events (type);",
            )?;
        }
        2 => {
            add_column_if_missing(conn, "streams", "detection_based_recording", "INTEGER DEFAULT 0")?;
            add_column_if_missing(conn, "streams", "detection_model", "TEXT DEFAULT ''")?;
            add_column_if_missing(conn, "streams", "detection_threshold", "REAL DEFAULT 0.5")?;
            add_column_if_missing(conn, "streams", "detection_interval", "INTEGER DEFAULT 10")?;
            add_column_if_missing(conn, "streams", "pre_detection_buffer", "INTEGER DEFAULT 0")?;
            add_column_if_missing(conn, "streams", "post_detection_buffer", "INTEGER DEFAULT 5")?;
        }
        3 => {
            add_column_if_missing(conn, "streams", "protocol", "INTEGER DEFAULT 0")?;
            add_column_if_missing(conn, "streams", "is_onvif", "INTEGER DEFAULT 0")?;
            add_column_if_missing(conn, "streams", "record_audio", "INTEGER DEFAULT 0")?;
        }
        4 => {
            if !table_exists(conn, "motion_recording_config")? {
                conn.execute_batch(
                    "CREATE TABLE motion_recording_config (
                         id INTEGER PRIMARY KEY AUTOINCREMENT,
                         stream_name TEXT NOT NULL UNIQUE,
                         enabled INTEGER DEFAULT 1,
                         pre_buffer_seconds INTEGER DEFAULT 5,
                         post_buffer_seconds INTEGER DEFAULT 5,
                         max_file_duration INTEGER DEFAULT 300,
                         codec TEXT DEFAULT 'h264',
                         quality TEXT DEFAULT 'medium',
                         retention_days INTEGER DEFAULT 7,
                         max_storage_mb INTEGER DEFAULT 0,
                         created_at INTEGER NOT NULL,
                         updated_at INTEGER NOT NULL
                     );
                     CREATE INDEX IF NOT EXISTS idx_motion_config_stream
                         ON motion_recording_config (stream_name);",
                )?;
            }
        }
        other => {
            return Err(CatalogError::Conflict(format!(
                "no migration defined for schema version {other}"
            )))
        }
    }
    Ok(())
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_schema_at_current_version() {
        let catalog = Catalog::open_in_memory().unwrap();
        assert_eq!(catalog.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_column_cache_populated() {
        let catalog = Catalog::open_in_memory().unwrap();
        assert!(catalog.column_exists("streams", "detection_based_recording"));
        assert!(catalog.column_exists("segments", "file_path"));
        assert!(catalog.column_exists("motion_recording_config", "max_storage_mb"));
        assert!(!catalog.column_exists("streams", "no_such_column"));
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        {
            let catalog = Catalog::open(&path).unwrap();
            assert_eq!(catalog.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
        }
        let catalog = Catalog::open(&path).unwrap();
        assert_eq!(catalog.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_schema_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        {
            let catalog = Catalog::open(&path).unwrap();
            let conn = catalog.lock();
            conn.execute("UPDATE schema_version SET version = 99", []).unwrap();
        }
        match Catalog::open(&path) {
            Err(CatalogError::SchemaTooNew { found, .. }) => assert_eq!(found, 99),
            other => panic!("expected SchemaTooNew, got {other:?}"),
        }
    }
}
