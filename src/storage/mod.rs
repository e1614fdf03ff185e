//! SQLite-backed storage.
//!
//! A single database file holds the catalog, the import bookkeeping and the
//! listening history so that foreign keys can span all three. The stores in
//! this module share one connection behind a mutex.

mod catalog;
mod history;
pub mod models;
pub mod schema;

pub use catalog::{CatalogStore, SqliteCatalogStore};
pub use history::{
    HistoryStore, HourlyActivity, OverviewStats, PlatformStats, ShuffleStats, SkippedStats,
    SqliteHistoryStore, TopArtist,
};

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use tracing::info;

use crate::sqlite_persistence::BASE_DB_VERSION;
use schema::ANALYTICS_VERSIONED_SCHEMAS;

/// Handle to the analytics database. Cheap to clone; all clones share the
/// same connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens an existing database or creates a new one with the current
    /// schema, validating the on-disk structure in either case.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open_with_flags(
                &db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            let conn = Connection::open(&db_path)?;
            conn.execute("PRAGMA foreign_keys = ON;", [])?;
            ANALYTICS_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new analytics database at {:?}", db_path.as_ref());
            conn
        };

        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read database version")?
            - BASE_DB_VERSION as i64;

        if db_version < 0 {
            bail!(
                "Analytics database version {} is too old, does not contain base db version {}",
                db_version,
                BASE_DB_VERSION
            );
        }
        let version = db_version as usize;

        let schema_count = ANALYTICS_VERSIONED_SCHEMAS.len();
        if version >= schema_count {
            bail!(
                "Analytics database version {} is too new (max supported: {})",
                version,
                schema_count - 1
            );
        }

        ANALYTICS_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database for testing.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        ANALYTICS_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;

        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("analytics.db");

        {
            let _db = Database::open(&db_path).unwrap();
        }
        assert!(db_path.exists());

        // Second open validates the existing schema.
        let db = Database::open(&db_path).unwrap();
        let conn = db.connection();
        let conn = conn.lock().unwrap();
        let fk_enabled: i32 = conn.query_row("PRAGMA foreign_keys;", [], |row| row.get(0)).unwrap();
        assert_eq!(fk_enabled, 1);
    }
}
