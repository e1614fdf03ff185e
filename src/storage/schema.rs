//! SQLite schema for the analytics database.
//!
//! Everything lives in one database file: the shared catalog tables
//! (artists/albums/tracks plus junctions), the import-job tables, and the
//! listening history. Primary keys are integer rowids; Spotify ids are unique
//! text columns used for lookups and cross-import deduplication.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema,
};

pub const DEFAULT_TIMESTAMP: &str = "(cast(strftime('%s','now') as int))";

// =============================================================================
// Catalog Tables
// =============================================================================

pub const ARTISTS_TABLE: Table = Table {
    name: "artists",
    columns: &[
        sqlite_column!("rowid", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("spotify_id", &SqlType::Text, non_null = true), // base62 id
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("spotify_url", &SqlType::Text, non_null = true),
        sqlite_column!("image", &SqlType::Text),
        sqlite_column!("popularity", &SqlType::Integer),
        sqlite_column!("followers", &SqlType::Integer),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_artists_spotify_id", "spotify_id")],
    unique_constraints: &[&["spotify_id"]],
};

pub const ALBUMS_TABLE: Table = Table {
    name: "albums",
    columns: &[
        sqlite_column!("rowid", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("spotify_id", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("spotify_url", &SqlType::Text, non_null = true),
        sqlite_column!("album_type", &SqlType::Text, non_null = true), // 'album', 'single', 'compilation', 'ep'
        sqlite_column!("release_date", &SqlType::Text), // '2020-05-01'; null unless day precision
        sqlite_column!("image", &SqlType::Text),
        sqlite_column!("popularity", &SqlType::Integer),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_albums_spotify_id", "spotify_id")],
    unique_constraints: &[&["spotify_id"]],
};

const ALBUMS_FK: ForeignKey = ForeignKey {
    foreign_table: "albums",
    foreign_column: "rowid",
    on_delete: ForeignKeyOnChange::SetNull,
};

pub const TRACKS_TABLE: Table = Table {
    name: "tracks",
    columns: &[
        sqlite_column!("rowid", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("spotify_id", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("spotify_url", &SqlType::Text, non_null = true),
        sqlite_column!("duration_ms", &SqlType::Integer),
        sqlite_column!("explicit", &SqlType::Integer, non_null = true),
        sqlite_column!("popularity", &SqlType::Integer),
        sqlite_column!("release_date", &SqlType::Text),
        sqlite_column!("image", &SqlType::Text),
        sqlite_column!("album_rowid", &SqlType::Integer, foreign_key = Some(&ALBUMS_FK)),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[
        ("idx_tracks_spotify_id", "spotify_id"),
        ("idx_tracks_album", "album_rowid"),
    ],
    unique_constraints: &[&["spotify_id"]],
};

// Junction pairs carry a composite unique constraint so concurrent jobs
// linking the same pair resolve through INSERT OR IGNORE.
pub const ALBUM_ARTISTS_TABLE: Table = Table {
    name: "album_artists",
    columns: &[
        sqlite_column!("album_rowid", &SqlType::Integer, non_null = true),
        sqlite_column!("artist_rowid", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_album_artists_album", "album_rowid"),
        ("idx_album_artists_artist", "artist_rowid"),
    ],
    unique_constraints: &[&["album_rowid", "artist_rowid"]],
};

pub const TRACK_ARTISTS_TABLE: Table = Table {
    name: "track_artists",
    columns: &[
        sqlite_column!("track_rowid", &SqlType::Integer, non_null = true),
        sqlite_column!("artist_rowid", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_track_artists_track", "track_rowid"),
        ("idx_track_artists_artist", "artist_rowid"),
    ],
    unique_constraints: &[&["track_rowid", "artist_rowid"]],
};

// =============================================================================
// Import Tables
// =============================================================================

pub const IMPORT_JOBS_TABLE: Table = Table {
    name: "import_jobs",
    columns: &[
        sqlite_column!("rowid", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("id", &SqlType::Text, non_null = true), // uuid
        sqlite_column!("user_id", &SqlType::Text, non_null = true),
        sqlite_column!("source_file", &SqlType::Text, non_null = true),
        sqlite_column!(
            "status",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'uploaded'")
        ),
        sqlite_column!(
            "error",
            &SqlType::Text,
            non_null = true,
            default_value = Some("''")
        ),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!(
            "updated_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[
        ("idx_import_jobs_id", "id"),
        ("idx_import_jobs_user", "user_id"),
    ],
    unique_constraints: &[&["id"]],
};

const IMPORT_JOBS_FK: ForeignKey = ForeignKey {
    foreign_table: "import_jobs",
    foreign_column: "rowid",
    on_delete: ForeignKeyOnChange::Cascade,
};

/// Canonical listen records, scoped to one job and discardable after
/// reconciliation.
pub const PARSED_LISTENS_TABLE: Table = Table {
    name: "parsed_listens",
    columns: &[
        sqlite_column!("rowid", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "job_rowid",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&IMPORT_JOBS_FK)
        ),
        sqlite_column!("spotify_track_id", &SqlType::Text, non_null = true),
        sqlite_column!("played_at", &SqlType::Text, non_null = true), // RFC 3339
        sqlite_column!("platform", &SqlType::Text, non_null = true),
        sqlite_column!("ms_played", &SqlType::Integer, non_null = true),
        sqlite_column!("reason_start", &SqlType::Text, non_null = true),
        sqlite_column!("reason_end", &SqlType::Text, non_null = true),
        sqlite_column!("shuffle", &SqlType::Integer, non_null = true),
        sqlite_column!("skipped", &SqlType::Integer, non_null = true),
        sqlite_column!("offline", &SqlType::Integer),
        sqlite_column!("offline_timestamp", &SqlType::Integer),
    ],
    indices: &[("idx_parsed_listens_job", "job_rowid")],
    unique_constraints: &[],
};

// =============================================================================
// History Table
// =============================================================================

const TRACKS_FK: ForeignKey = ForeignKey {
    foreign_table: "tracks",
    foreign_column: "rowid",
    on_delete: ForeignKeyOnChange::Cascade,
};

pub const LISTENING_HISTORY_TABLE: Table = Table {
    name: "listening_history",
    columns: &[
        sqlite_column!("rowid", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("user_id", &SqlType::Text, non_null = true),
        sqlite_column!(
            "track_rowid",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&TRACKS_FK)
        ),
        sqlite_column!("spotify_track_id", &SqlType::Text, non_null = true),
        sqlite_column!("played_at", &SqlType::Text, non_null = true),
        sqlite_column!("platform", &SqlType::Text, non_null = true),
        sqlite_column!("ms_played", &SqlType::Integer, non_null = true),
        sqlite_column!("reason_start", &SqlType::Text, non_null = true),
        sqlite_column!("reason_end", &SqlType::Text, non_null = true),
        sqlite_column!("shuffle", &SqlType::Integer, non_null = true),
        sqlite_column!("skipped", &SqlType::Integer, non_null = true),
        sqlite_column!("offline", &SqlType::Integer),
        sqlite_column!("offline_timestamp", &SqlType::Integer),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[
        ("idx_listening_history_user", "user_id"),
        ("idx_listening_history_track", "track_rowid"),
        ("idx_listening_history_spotify_track", "spotify_track_id"),
    ],
    unique_constraints: &[],
};

// =============================================================================
// Versioned Schema Definition
// =============================================================================

pub const ANALYTICS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[
        ARTISTS_TABLE,
        ALBUMS_TABLE,
        TRACKS_TABLE,
        ALBUM_ARTISTS_TABLE,
        TRACK_ARTISTS_TABLE,
        IMPORT_JOBS_TABLE,
        PARSED_LISTENS_TABLE,
        LISTENING_HISTORY_TABLE,
    ],
}];
