use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::{params, Connection, Row};

use super::models::{Album, AlbumType, Artist, NewAlbum, NewArtist, NewTrack, Track};
use super::schema::{
    ALBUMS_TABLE, ALBUM_ARTISTS_TABLE, ARTISTS_TABLE, TRACKS_TABLE, TRACK_ARTISTS_TABLE,
};
use super::Database;

/// SQLite limits the number of bound variables per statement; membership
/// queries chunk their id lists to stay under it.
const ID_QUERY_CHUNK_SIZE: usize = 500;

/// Read and write access to the shared catalog entities.
///
/// All inserts are INSERT OR IGNORE: the first writer of a spotify id wins
/// and existing rows are never modified afterwards.
pub trait CatalogStore: Send + Sync {
    /// Returns the subset of the given track spotify ids that already have
    /// catalog rows.
    fn existing_track_spotify_ids(&self, spotify_ids: &[String]) -> Result<HashSet<String>>;

    fn insert_artists(&self, artists: &[NewArtist]) -> Result<()>;
    fn insert_albums(&self, albums: &[NewAlbum]) -> Result<()>;
    fn insert_tracks(&self, tracks: &[NewTrack]) -> Result<()>;

    fn get_artists_by_spotify_ids(&self, spotify_ids: &[String])
        -> Result<HashMap<String, Artist>>;
    fn get_albums_by_spotify_ids(&self, spotify_ids: &[String]) -> Result<HashMap<String, Album>>;
    fn get_tracks_by_spotify_ids(&self, spotify_ids: &[String]) -> Result<HashMap<String, Track>>;

    /// Links are (album_rowid, artist_rowid) pairs, deduplicated by the
    /// composite unique constraint.
    fn link_album_artists(&self, links: &[(i64, i64)]) -> Result<()>;
    /// Links are (track_rowid, artist_rowid) pairs.
    fn link_track_artists(&self, links: &[(i64, i64)]) -> Result<()>;

    /// (artists, albums, tracks) row counts.
    fn entity_counts(&self) -> Result<(i64, i64, i64)>;
}

pub struct SqliteCatalogStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCatalogStore {
    pub fn new(database: &Database) -> Self {
        SqliteCatalogStore {
            conn: database.connection(),
        }
    }
}

fn placeholders(count: usize) -> String {
    let mut s = String::with_capacity(count * 3);
    for i in 1..=count {
        if i > 1 {
            s.push_str(", ");
        }
        s.push_str(&format!("?{}", i));
    }
    s
}

fn parse_release_date(value: Option<String>) -> rusqlite::Result<Option<NaiveDate>> {
    match value {
        None => Ok(None),
        Some(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map(Some)
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
    }
}

fn artist_from_row(row: &Row) -> rusqlite::Result<Artist> {
    Ok(Artist {
        rowid: row.get(0)?,
        spotify_id: row.get(1)?,
        name: row.get(2)?,
        spotify_url: row.get(3)?,
        image: row.get(4)?,
        popularity: row.get(5)?,
        followers: row.get(6)?,
    })
}

fn album_from_row(row: &Row) -> rusqlite::Result<Album> {
    Ok(Album {
        rowid: row.get(0)?,
        spotify_id: row.get(1)?,
        name: row.get(2)?,
        spotify_url: row.get(3)?,
        album_type: AlbumType::from_db_str(&row.get::<_, String>(4)?),
        release_date: parse_release_date(row.get(5)?)?,
        image: row.get(6)?,
        popularity: row.get(7)?,
    })
}

fn track_from_row(row: &Row) -> rusqlite::Result<Track> {
    Ok(Track {
        rowid: row.get(0)?,
        spotify_id: row.get(1)?,
        name: row.get(2)?,
        spotify_url: row.get(3)?,
        duration_ms: row.get(4)?,
        explicit: row.get::<_, i64>(5)? != 0,
        popularity: row.get(6)?,
        release_date: parse_release_date(row.get(7)?)?,
        image: row.get(8)?,
        album_rowid: row.get(9)?,
    })
}

impl CatalogStore for SqliteCatalogStore {
    fn existing_track_spotify_ids(&self, spotify_ids: &[String]) -> Result<HashSet<String>> {
        let conn = self.conn.lock().unwrap();
        let mut existing = HashSet::new();
        for chunk in spotify_ids.chunks(ID_QUERY_CHUNK_SIZE) {
            let mut stmt = conn.prepare(&format!(
                "SELECT spotify_id FROM {} WHERE spotify_id IN ({})",
                TRACKS_TABLE.name,
                placeholders(chunk.len())
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                row.get::<_, String>(0)
            })?;
            for row in rows {
                existing.insert(row?);
            }
        }
        Ok(existing)
    }

    fn insert_artists(&self, artists: &[NewArtist]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for artist in artists {
            tx.execute(
                &format!(
                    "INSERT OR IGNORE INTO {} (spotify_id, name, spotify_url, image, popularity, followers)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    ARTISTS_TABLE.name
                ),
                params![
                    artist.spotify_id,
                    artist.name,
                    artist.spotify_url,
                    artist.image,
                    artist.popularity,
                    artist.followers,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_albums(&self, albums: &[NewAlbum]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for album in albums {
            tx.execute(
                &format!(
                    "INSERT OR IGNORE INTO {} (spotify_id, name, spotify_url, album_type, release_date, image, popularity)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    ALBUMS_TABLE.name
                ),
                params![
                    album.spotify_id,
                    album.name,
                    album.spotify_url,
                    album.album_type.to_db_str(),
                    album.release_date.map(|d| d.to_string()),
                    album.image,
                    album.popularity,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_tracks(&self, tracks: &[NewTrack]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for track in tracks {
            tx.execute(
                &format!(
                    "INSERT OR IGNORE INTO {} (spotify_id, name, spotify_url, duration_ms, explicit, popularity, release_date, image, album_rowid)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    TRACKS_TABLE.name
                ),
                params![
                    track.spotify_id,
                    track.name,
                    track.spotify_url,
                    track.duration_ms,
                    track.explicit as i64,
                    track.popularity,
                    track.release_date.map(|d| d.to_string()),
                    track.image,
                    track.album_rowid,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_artists_by_spotify_ids(
        &self,
        spotify_ids: &[String],
    ) -> Result<HashMap<String, Artist>> {
        let conn = self.conn.lock().unwrap();
        let mut artists = HashMap::new();
        for chunk in spotify_ids.chunks(ID_QUERY_CHUNK_SIZE) {
            let mut stmt = conn.prepare(&format!(
                "SELECT rowid, spotify_id, name, spotify_url, image, popularity, followers
                 FROM {} WHERE spotify_id IN ({})",
                ARTISTS_TABLE.name,
                placeholders(chunk.len())
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), artist_from_row)?;
            for row in rows {
                let artist = row?;
                artists.insert(artist.spotify_id.clone(), artist);
            }
        }
        Ok(artists)
    }

    fn get_albums_by_spotify_ids(&self, spotify_ids: &[String]) -> Result<HashMap<String, Album>> {
        let conn = self.conn.lock().unwrap();
        let mut albums = HashMap::new();
        for chunk in spotify_ids.chunks(ID_QUERY_CHUNK_SIZE) {
            let mut stmt = conn.prepare(&format!(
                "SELECT rowid, spotify_id, name, spotify_url, album_type, release_date, image, popularity
                 FROM {} WHERE spotify_id IN ({})",
                ALBUMS_TABLE.name,
                placeholders(chunk.len())
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), album_from_row)?;
            for row in rows {
                let album = row?;
                albums.insert(album.spotify_id.clone(), album);
            }
        }
        Ok(albums)
    }

    fn get_tracks_by_spotify_ids(&self, spotify_ids: &[String]) -> Result<HashMap<String, Track>> {
        let conn = self.conn.lock().unwrap();
        let mut tracks = HashMap::new();
        for chunk in spotify_ids.chunks(ID_QUERY_CHUNK_SIZE) {
            let mut stmt = conn.prepare(&format!(
                "SELECT rowid, spotify_id, name, spotify_url, duration_ms, explicit, popularity, release_date, image, album_rowid
                 FROM {} WHERE spotify_id IN ({})",
                TRACKS_TABLE.name,
                placeholders(chunk.len())
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), track_from_row)?;
            for row in rows {
                let track = row?;
                tracks.insert(track.spotify_id.clone(), track);
            }
        }
        Ok(tracks)
    }

    fn link_album_artists(&self, links: &[(i64, i64)]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for (album_rowid, artist_rowid) in links {
            tx.execute(
                &format!(
                    "INSERT OR IGNORE INTO {} (album_rowid, artist_rowid) VALUES (?1, ?2)",
                    ALBUM_ARTISTS_TABLE.name
                ),
                params![album_rowid, artist_rowid],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn link_track_artists(&self, links: &[(i64, i64)]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for (track_rowid, artist_rowid) in links {
            tx.execute(
                &format!(
                    "INSERT OR IGNORE INTO {} (track_rowid, artist_rowid) VALUES (?1, ?2)",
                    TRACK_ARTISTS_TABLE.name
                ),
                params![track_rowid, artist_rowid],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn entity_counts(&self) -> Result<(i64, i64, i64)> {
        let conn = self.conn.lock().unwrap();
        let artists: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", ARTISTS_TABLE.name),
            [],
            |row| row.get(0),
        )?;
        let albums: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", ALBUMS_TABLE.name),
            [],
            |row| row.get(0),
        )?;
        let tracks: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", TRACKS_TABLE.name),
            [],
            |row| row.get(0),
        )?;
        Ok((artists, albums, tracks))
    }
}
