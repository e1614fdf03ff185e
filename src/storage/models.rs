//! Catalog and history entities backed by the SQLite store.
//!
//! Spotify ids are the stable external keys: unique per entity type and the
//! sole deduplication key across imports. Rowids are internal and never leave
//! the storage layer except to build junction and history rows.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Album type classification as reported by the catalog API.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlbumType {
    Album,
    Single,
    Compilation,
    Ep,
}

impl AlbumType {
    pub fn from_db_str(s: &str) -> Self {
        match s {
            "album" => AlbumType::Album,
            "single" => AlbumType::Single,
            "compilation" => AlbumType::Compilation,
            "ep" => AlbumType::Ep,
            _ => AlbumType::Album, // Default fallback
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            AlbumType::Album => "album",
            AlbumType::Single => "single",
            AlbumType::Compilation => "compilation",
            AlbumType::Ep => "ep",
        }
    }
}

/// Artist entity. Write-once per spotify id; enrichment fields
/// (image, popularity, followers) are nullable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artist {
    pub rowid: i64,
    pub spotify_id: String,
    pub name: String,
    pub spotify_url: String,
    pub image: Option<String>,
    pub popularity: Option<i32>,
    pub followers: Option<i64>,
}

/// Album entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Album {
    pub rowid: i64,
    pub spotify_id: String,
    pub name: String,
    pub spotify_url: String,
    pub album_type: AlbumType,
    /// Null unless the source declared day-level precision.
    pub release_date: Option<NaiveDate>,
    pub image: Option<String>,
    pub popularity: Option<i32>,
}

/// Track entity. The album reference is nullable so album deletion
/// never cascades into tracks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Track {
    pub rowid: i64,
    pub spotify_id: String,
    pub name: String,
    pub spotify_url: String,
    pub duration_ms: Option<i64>,
    pub explicit: bool,
    pub popularity: Option<i32>,
    pub release_date: Option<NaiveDate>,
    pub image: Option<String>,
    pub album_rowid: Option<i64>,
}

/// Insert payload for a new artist row.
#[derive(Clone, Debug)]
pub struct NewArtist {
    pub spotify_id: String,
    pub name: String,
    pub spotify_url: String,
    pub image: Option<String>,
    pub popularity: Option<i32>,
    pub followers: Option<i64>,
}

/// Insert payload for a new album row.
#[derive(Clone, Debug)]
pub struct NewAlbum {
    pub spotify_id: String,
    pub name: String,
    pub spotify_url: String,
    pub album_type: AlbumType,
    pub release_date: Option<NaiveDate>,
    pub image: Option<String>,
    pub popularity: Option<i32>,
}

/// Insert payload for a new track row.
#[derive(Clone, Debug)]
pub struct NewTrack {
    pub spotify_id: String,
    pub name: String,
    pub spotify_url: String,
    pub duration_ms: Option<i64>,
    pub explicit: bool,
    pub popularity: Option<i32>,
    pub release_date: Option<NaiveDate>,
    pub image: Option<String>,
    pub album_rowid: Option<i64>,
}

/// One materialized listening event. Created only by reconciliation,
/// never updated, deleted only by cascade with the owning user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListeningHistoryEntry {
    pub user_id: String,
    pub track_rowid: i64,
    /// Denormalized for fast filtering without a join.
    pub spotify_track_id: String,
    pub played_at: DateTime<Utc>,
    pub platform: String,
    pub ms_played: i64,
    pub reason_start: String,
    pub reason_end: String,
    pub shuffle: bool,
    pub skipped: bool,
    pub offline: Option<bool>,
    pub offline_timestamp: Option<i64>,
}
