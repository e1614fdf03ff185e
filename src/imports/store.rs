use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::models::{ImportJob, ImportJobStatus, ParsedListen};
use crate::storage::schema::{IMPORT_JOBS_TABLE, PARSED_LISTENS_TABLE};
use crate::storage::Database;

/// Persistence for import jobs and their staged listen records.
pub trait ImportStore: Send + Sync {
    fn create_job(&self, user_id: &str, source_file: &str) -> Result<ImportJob>;
    fn get_job(&self, job_id: &str) -> Result<Option<ImportJob>>;
    fn list_jobs_for_user(&self, user_id: &str) -> Result<Vec<ImportJob>>;

    fn set_status(&self, job_id: &str, status: ImportJobStatus) -> Result<()>;
    fn set_failed(&self, job_id: &str, error: &str) -> Result<()>;

    /// Stores the listens and moves the job to `parsed` in one transaction,
    /// so a job is never observably parsed without its records.
    fn commit_parsed_listens(&self, job_id: &str, listens: &[ParsedListen]) -> Result<()>;
    fn get_listens_for_job(&self, job_id: &str) -> Result<Vec<ParsedListen>>;
    /// Staged listens are dropped once reconciliation has materialized them.
    fn delete_listens_for_job(&self, job_id: &str) -> Result<()>;
}

pub struct SqliteImportStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteImportStore {
    pub fn new(database: &Database) -> Self {
        SqliteImportStore {
            conn: database.connection(),
        }
    }
}

fn job_from_row(row: &Row) -> rusqlite::Result<ImportJob> {
    let status_str: String = row.get(4)?;
    let status = ImportJobStatus::parse(&status_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(ImportJob {
        rowid: row.get(0)?,
        id: row.get(1)?,
        user_id: row.get(2)?,
        source_file: row.get(3)?,
        status,
        error: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn listen_from_row(row: &Row) -> rusqlite::Result<ParsedListen> {
    let played_at_str: String = row.get(1)?;
    let played_at = DateTime::parse_from_rfc3339(&played_at_str)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);
    Ok(ParsedListen {
        spotify_track_id: row.get(0)?,
        played_at,
        platform: row.get(2)?,
        ms_played: row.get(3)?,
        reason_start: row.get(4)?,
        reason_end: row.get(5)?,
        shuffle: row.get::<_, i64>(6)? != 0,
        skipped: row.get::<_, i64>(7)? != 0,
        offline: row.get::<_, Option<i64>>(8)?.map(|v| v != 0),
        offline_timestamp: row.get(9)?,
    })
}

const JOB_COLUMNS: &str = "rowid, id, user_id, source_file, status, error, created_at, updated_at";

fn job_rowid(conn: &Connection, job_id: &str) -> Result<i64> {
    conn.query_row(
        &format!("SELECT rowid FROM {} WHERE id = ?1", IMPORT_JOBS_TABLE.name),
        params![job_id],
        |row| row.get(0),
    )
    .with_context(|| format!("Import job {} not found", job_id))
}

impl ImportStore for SqliteImportStore {
    fn create_job(&self, user_id: &str, source_file: &str) -> Result<ImportJob> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            &format!(
                "INSERT INTO {} (id, user_id, source_file) VALUES (?1, ?2, ?3)",
                IMPORT_JOBS_TABLE.name
            ),
            params![id, user_id, source_file],
        )?;
        conn.query_row(
            &format!(
                "SELECT {} FROM {} WHERE id = ?1",
                JOB_COLUMNS, IMPORT_JOBS_TABLE.name
            ),
            params![id],
            job_from_row,
        )
        .context("Failed to read back created import job")
    }

    fn get_job(&self, job_id: &str) -> Result<Option<ImportJob>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE id = ?1",
                    JOB_COLUMNS, IMPORT_JOBS_TABLE.name
                ),
                params![job_id],
                job_from_row,
            )
            .optional()?)
    }

    fn list_jobs_for_user(&self, user_id: &str) -> Result<Vec<ImportJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC",
            JOB_COLUMNS, IMPORT_JOBS_TABLE.name
        ))?;
        let rows = stmt.query_map(params![user_id], job_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn set_status(&self, job_id: &str, status: ImportJobStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET status = ?1, updated_at = cast(strftime('%s','now') as int) WHERE id = ?2",
                IMPORT_JOBS_TABLE.name
            ),
            params![status.as_str(), job_id],
        )?;
        if updated == 0 {
            anyhow::bail!("Import job {} not found", job_id);
        }
        Ok(())
    }

    fn set_failed(&self, job_id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET status = ?1, error = ?2, updated_at = cast(strftime('%s','now') as int) WHERE id = ?3",
                IMPORT_JOBS_TABLE.name
            ),
            params![ImportJobStatus::Failed.as_str(), error, job_id],
        )?;
        if updated == 0 {
            anyhow::bail!("Import job {} not found", job_id);
        }
        Ok(())
    }

    fn commit_parsed_listens(&self, job_id: &str, listens: &[ParsedListen]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let rowid = job_rowid(&tx, job_id)?;
        for listen in listens {
            tx.execute(
                &format!(
                    "INSERT INTO {} (job_rowid, spotify_track_id, played_at, platform, ms_played,
                                     reason_start, reason_end, shuffle, skipped, offline, offline_timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    PARSED_LISTENS_TABLE.name
                ),
                params![
                    rowid,
                    listen.spotify_track_id,
                    listen.played_at.to_rfc3339(),
                    listen.platform,
                    listen.ms_played,
                    listen.reason_start,
                    listen.reason_end,
                    listen.shuffle as i64,
                    listen.skipped as i64,
                    listen.offline.map(|b| b as i64),
                    listen.offline_timestamp,
                ],
            )?;
        }
        tx.execute(
            &format!(
                "UPDATE {} SET status = ?1, updated_at = cast(strftime('%s','now') as int) WHERE rowid = ?2",
                IMPORT_JOBS_TABLE.name
            ),
            params![ImportJobStatus::Parsed.as_str(), rowid],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_listens_for_job(&self, job_id: &str) -> Result<Vec<ParsedListen>> {
        let conn = self.conn.lock().unwrap();
        let rowid = job_rowid(&conn, job_id)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT spotify_track_id, played_at, platform, ms_played, reason_start, reason_end,
                    shuffle, skipped, offline, offline_timestamp
             FROM {} WHERE job_rowid = ?1 ORDER BY rowid",
            PARSED_LISTENS_TABLE.name
        ))?;
        let rows = stmt.query_map(params![rowid], listen_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn delete_listens_for_job(&self, job_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let rowid = job_rowid(&conn, job_id)?;
        conn.execute(
            &format!("DELETE FROM {} WHERE job_rowid = ?1", PARSED_LISTENS_TABLE.name),
            params![rowid],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteImportStore {
        SqliteImportStore::new(&Database::in_memory().unwrap())
    }

    fn listen(track_id: &str) -> ParsedListen {
        ParsedListen {
            spotify_track_id: track_id.to_string(),
            played_at: DateTime::parse_from_rfc3339("2023-01-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            platform: "android".to_string(),
            ms_played: 60_000,
            reason_start: "clickrow".to_string(),
            reason_end: "trackdone".to_string(),
            shuffle: true,
            skipped: false,
            offline: Some(false),
            offline_timestamp: None,
        }
    }

    #[test]
    fn test_create_and_get_job() {
        let store = store();
        let job = store.create_job("u1", "history_2023.json").unwrap();
        assert_eq!(job.status, ImportJobStatus::Uploaded);
        assert_eq!(job.error, "");

        let fetched = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.source_file, "history_2023.json");

        assert!(store.get_job("no-such-job").unwrap().is_none());
    }

    #[test]
    fn test_commit_parsed_listens_transitions_status() {
        let store = store();
        let job = store.create_job("u1", "f.json").unwrap();

        store
            .commit_parsed_listens(&job.id, &[listen("t1"), listen("t2")])
            .unwrap();

        let job = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.status, ImportJobStatus::Parsed);

        let listens = store.get_listens_for_job(&job.id).unwrap();
        assert_eq!(listens.len(), 2);
        assert_eq!(listens[0].spotify_track_id, "t1");
        assert!(listens[0].shuffle);
        assert_eq!(listens[0].offline, Some(false));
    }

    #[test]
    fn test_set_failed_records_error() {
        let store = store();
        let job = store.create_job("u1", "f.json").unwrap();
        store.set_failed(&job.id, "2 invalid records").unwrap();

        let job = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.status, ImportJobStatus::Failed);
        assert_eq!(job.error, "2 invalid records");
    }

    #[test]
    fn test_delete_listens_for_job() {
        let store = store();
        let job = store.create_job("u1", "f.json").unwrap();
        store.commit_parsed_listens(&job.id, &[listen("t1")]).unwrap();

        store.delete_listens_for_job(&job.id).unwrap();
        assert!(store.get_listens_for_job(&job.id).unwrap().is_empty());
    }

    #[test]
    fn test_list_jobs_for_user_scopes_by_user() {
        let store = store();
        store.create_job("u1", "a.json").unwrap();
        store.create_job("u1", "b.json").unwrap();
        store.create_job("u2", "c.json").unwrap();

        let jobs = store.list_jobs_for_user("u1").unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.user_id == "u1"));
    }
}
