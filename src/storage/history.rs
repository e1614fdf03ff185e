use std::sync::{Arc, Mutex};

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

use super::models::ListeningHistoryEntry;
use super::schema::{ARTISTS_TABLE, LISTENING_HISTORY_TABLE, TRACKS_TABLE, TRACK_ARTISTS_TABLE};
use super::Database;

const MS_IN_MINUTE: i64 = 1000 * 60;
const MINUTES_IN_HOUR: i64 = 60;

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct OverviewStats {
    pub total_streams: i64,
    pub minutes_streamed: i64,
    pub hours_streamed: i64,
    pub different_tracks: i64,
    pub different_artists: i64,
    pub different_albums: i64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct PlatformStats {
    pub platform: String,
    pub count: i64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SkippedStats {
    pub skipped: bool,
    pub count: i64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ShuffleStats {
    pub shuffle: bool,
    pub count: i64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct HourlyActivity {
    pub hour: u32,
    pub streams: i64,
    pub minutes: i64,
}

/// Stream count per artist name. The final entry may be the synthetic
/// "Other" bucket aggregating everything outside the top slots.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct TopArtist {
    pub name: String,
    pub count: i64,
}

/// Append-only access to the listening history plus the aggregate queries
/// that back the analytics views.
pub trait HistoryStore: Send + Sync {
    /// Inserts all entries in one transaction and returns how many were
    /// written.
    fn insert_history_batch(&self, entries: &[ListeningHistoryEntry]) -> Result<usize>;

    fn history_count_for_user(&self, user_id: &str) -> Result<i64>;

    fn overview(&self, user_id: &str) -> Result<OverviewStats>;
    fn platform_stats(&self, user_id: &str) -> Result<Vec<PlatformStats>>;
    fn skipped_stats(&self, user_id: &str) -> Result<Vec<SkippedStats>>;
    fn shuffle_stats(&self, user_id: &str) -> Result<Vec<ShuffleStats>>;
    /// Always returns 24 entries, hours without activity zero-filled.
    fn activity_by_hour(&self, user_id: &str) -> Result<Vec<HourlyActivity>>;
    fn top_artists(&self, user_id: &str, top_n: usize) -> Result<Vec<TopArtist>>;
}

pub struct SqliteHistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistoryStore {
    pub fn new(database: &Database) -> Self {
        SqliteHistoryStore {
            conn: database.connection(),
        }
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn insert_history_batch(&self, entries: &[ListeningHistoryEntry]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for entry in entries {
            tx.execute(
                &format!(
                    "INSERT INTO {} (user_id, track_rowid, spotify_track_id, played_at, platform, ms_played,
                                     reason_start, reason_end, shuffle, skipped, offline, offline_timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    LISTENING_HISTORY_TABLE.name
                ),
                params![
                    entry.user_id,
                    entry.track_rowid,
                    entry.spotify_track_id,
                    entry.played_at.to_rfc3339(),
                    entry.platform,
                    entry.ms_played,
                    entry.reason_start,
                    entry.reason_end,
                    entry.shuffle as i64,
                    entry.skipped as i64,
                    entry.offline.map(|b| b as i64),
                    entry.offline_timestamp,
                ],
            )?;
        }
        tx.commit()?;
        Ok(entries.len())
    }

    fn history_count_for_user(&self, user_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE user_id = ?1",
                LISTENING_HISTORY_TABLE.name
            ),
            params![user_id],
            |row| row.get(0),
        )?)
    }

    fn overview(&self, user_id: &str) -> Result<OverviewStats> {
        let conn = self.conn.lock().unwrap();

        let (total_streams, total_ms, different_tracks): (i64, i64, i64) = conn.query_row(
            &format!(
                "SELECT COUNT(*), COALESCE(SUM(ms_played), 0), COUNT(DISTINCT track_rowid)
                 FROM {} WHERE user_id = ?1",
                LISTENING_HISTORY_TABLE.name
            ),
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let different_albums: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(DISTINCT t.album_rowid)
                 FROM {} h JOIN {} t ON t.rowid = h.track_rowid
                 WHERE h.user_id = ?1",
                LISTENING_HISTORY_TABLE.name, TRACKS_TABLE.name
            ),
            params![user_id],
            |row| row.get(0),
        )?;

        let different_artists: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(DISTINCT ta.artist_rowid)
                 FROM {} h JOIN {} ta ON ta.track_rowid = h.track_rowid
                 WHERE h.user_id = ?1",
                LISTENING_HISTORY_TABLE.name, TRACK_ARTISTS_TABLE.name
            ),
            params![user_id],
            |row| row.get(0),
        )?;

        let minutes_streamed = total_ms / MS_IN_MINUTE;
        Ok(OverviewStats {
            total_streams,
            minutes_streamed,
            hours_streamed: minutes_streamed / MINUTES_IN_HOUR,
            different_tracks,
            different_artists,
            different_albums,
        })
    }

    fn platform_stats(&self, user_id: &str) -> Result<Vec<PlatformStats>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT platform, COUNT(*) as count FROM {}
             WHERE user_id = ?1 GROUP BY platform ORDER BY count DESC",
            LISTENING_HISTORY_TABLE.name
        ))?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(PlatformStats {
                platform: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn skipped_stats(&self, user_id: &str) -> Result<Vec<SkippedStats>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT skipped, COUNT(*) FROM {} WHERE user_id = ?1 GROUP BY skipped",
            LISTENING_HISTORY_TABLE.name
        ))?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(SkippedStats {
                skipped: row.get::<_, i64>(0)? != 0,
                count: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn shuffle_stats(&self, user_id: &str) -> Result<Vec<ShuffleStats>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT shuffle, COUNT(*) FROM {} WHERE user_id = ?1 GROUP BY shuffle",
            LISTENING_HISTORY_TABLE.name
        ))?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(ShuffleStats {
                shuffle: row.get::<_, i64>(0)? != 0,
                count: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn activity_by_hour(&self, user_id: &str) -> Result<Vec<HourlyActivity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT cast(strftime('%H', played_at) as int) as hour,
                    COUNT(*),
                    COALESCE(SUM(ms_played), 0) / {MS_IN_MINUTE}
             FROM {} WHERE user_id = ?1 GROUP BY hour ORDER BY hour",
            LISTENING_HISTORY_TABLE.name
        ))?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut activity: Vec<HourlyActivity> = (0..24)
            .map(|hour| HourlyActivity {
                hour,
                streams: 0,
                minutes: 0,
            })
            .collect();
        for row in rows {
            let (hour, streams, minutes) = row?;
            if let Some(slot) = activity.get_mut(hour as usize) {
                slot.streams = streams;
                slot.minutes = minutes;
            }
        }
        Ok(activity)
    }

    fn top_artists(&self, user_id: &str, top_n: usize) -> Result<Vec<TopArtist>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT a.name, COUNT(*) as count
             FROM {} h
             JOIN {} ta ON ta.track_rowid = h.track_rowid
             JOIN {} a ON a.rowid = ta.artist_rowid
             WHERE h.user_id = ?1
             GROUP BY a.rowid
             ORDER BY count DESC, a.name ASC",
            LISTENING_HISTORY_TABLE.name, TRACK_ARTISTS_TABLE.name, ARTISTS_TABLE.name
        ))?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(TopArtist {
                name: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        let all: Vec<TopArtist> = rows.collect::<Result<Vec<_>, _>>()?;

        let mut result: Vec<TopArtist> = all.iter().take(top_n).cloned().collect();
        let other: i64 = all.iter().skip(top_n).map(|a| a.count).sum();
        if other > 0 {
            result.push(TopArtist {
                name: "Other".to_string(),
                count: other,
            });
        }
        Ok(result)
    }
}
