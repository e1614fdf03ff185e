//! Reconciliation of parsed listens into the catalog and listening history.
//!
//! Stages run strictly in order: resolve missing tracks against the catalog
//! API, upsert artists, albums and tracks write-once, link junctions, then
//! materialize history rows. Listens whose track never resolves are dropped
//! silently; only authentication failures abort a run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::models::{ImportJobStatus, ParsedListen};
use super::store::ImportStore;
use crate::spotify::models::{ArtistRef, TrackObject};
use crate::spotify::CatalogApi;
use crate::storage::models::{
    AlbumType, ListeningHistoryEntry, NewAlbum, NewArtist, NewTrack,
};
use crate::storage::{CatalogStore, HistoryStore};

pub struct Reconciler {
    imports: Arc<dyn ImportStore>,
    catalog: Arc<dyn CatalogStore>,
    history: Arc<dyn HistoryStore>,
    api: Arc<dyn CatalogApi>,
}

impl Reconciler {
    pub fn new(
        imports: Arc<dyn ImportStore>,
        catalog: Arc<dyn CatalogStore>,
        history: Arc<dyn HistoryStore>,
        api: Arc<dyn CatalogApi>,
    ) -> Self {
        Reconciler {
            imports,
            catalog,
            history,
            api,
        }
    }

    /// Runs the full reconciliation for one parsed job.
    pub async fn run(&self, job_id: &str) -> Result<()> {
        let job = self
            .imports
            .get_job(job_id)?
            .with_context(|| format!("Import job {} not found", job_id))?;
        let listens = self.imports.get_listens_for_job(job_id)?;

        let distinct_ids = distinct_track_ids(&listens);
        let existing_ids = self.catalog.existing_track_spotify_ids(&distinct_ids)?;
        let ids_to_fetch: Vec<String> = distinct_ids
            .iter()
            .filter(|id| !existing_ids.contains(*id))
            .cloned()
            .collect();
        info!(
            "Job {}: {} listens, {} distinct tracks, {} to fetch",
            job_id,
            listens.len(),
            distinct_ids.len(),
            ids_to_fetch.len()
        );

        self.imports.set_status(job_id, ImportJobStatus::Fetching)?;

        let fetched_tracks = if ids_to_fetch.is_empty() {
            HashMap::new()
        } else {
            self.api.get_tracks(&ids_to_fetch).await?
        };
        if fetched_tracks.len() < ids_to_fetch.len() {
            warn!(
                "Job {}: {} of {} track ids did not resolve",
                job_id,
                ids_to_fetch.len() - fetched_tracks.len(),
                ids_to_fetch.len()
            );
        }

        self.upsert_artists(&fetched_tracks).await?;
        let artist_map = self
            .catalog
            .get_artists_by_spotify_ids(&artist_ids(&fetched_tracks))?;

        self.upsert_albums(&fetched_tracks).await?;
        let album_map = self
            .catalog
            .get_albums_by_spotify_ids(&album_ids(&fetched_tracks))?;

        let album_artist_links: Vec<(i64, i64)> = fetched_tracks
            .values()
            .flat_map(|t| {
                t.album
                    .artists
                    .iter()
                    .map(move |a| (t.album.id.as_str(), a.id.as_str()))
            })
            .filter_map(|(album_id, artist_id)| {
                Some((album_map.get(album_id)?.rowid, artist_map.get(artist_id)?.rowid))
            })
            .collect();
        self.catalog.link_album_artists(&album_artist_links)?;

        let new_tracks: Vec<NewTrack> = fetched_tracks
            .values()
            .map(|t| NewTrack {
                spotify_id: t.id.clone(),
                name: t.name.clone(),
                spotify_url: t.external_urls.spotify.clone(),
                duration_ms: t.duration_ms,
                explicit: t.explicit,
                popularity: t.popularity,
                release_date: t.album.release_date_if_day_precision(),
                image: album_map.get(&t.album.id).and_then(|a| a.image.clone()),
                album_rowid: album_map.get(&t.album.id).map(|a| a.rowid),
            })
            .collect();
        self.catalog.insert_tracks(&new_tracks)?;

        // Pre-existing rows included: the map covers every distinct id.
        let track_map = self.catalog.get_tracks_by_spotify_ids(&distinct_ids)?;

        let track_artist_links: Vec<(i64, i64)> = fetched_tracks
            .values()
            .flat_map(|t| t.artists.iter().map(move |a| (t.id.as_str(), a.id.as_str())))
            .filter_map(|(track_id, artist_id)| {
                Some((track_map.get(track_id)?.rowid, artist_map.get(artist_id)?.rowid))
            })
            .collect();
        self.catalog.link_track_artists(&track_artist_links)?;

        let history_rows: Vec<ListeningHistoryEntry> = listens
            .iter()
            .filter_map(|listen| {
                let track = track_map.get(&listen.spotify_track_id)?;
                Some(ListeningHistoryEntry {
                    user_id: job.user_id.clone(),
                    track_rowid: track.rowid,
                    spotify_track_id: listen.spotify_track_id.clone(),
                    played_at: listen.played_at,
                    platform: listen.platform.clone(),
                    ms_played: listen.ms_played,
                    reason_start: listen.reason_start.clone(),
                    reason_end: listen.reason_end.clone(),
                    shuffle: listen.shuffle,
                    skipped: listen.skipped,
                    offline: listen.offline,
                    offline_timestamp: listen.offline_timestamp,
                })
            })
            .collect();
        let written = self.history.insert_history_batch(&history_rows)?;
        debug!(
            "Job {}: materialized {} of {} listens",
            job_id,
            written,
            listens.len()
        );

        self.imports.set_status(job_id, ImportJobStatus::Completed)?;
        self.imports.delete_listens_for_job(job_id)?;
        Ok(())
    }

    /// Upserts every artist referenced by the fetched tracks, at either the
    /// track or the album level. Missing ones get enrichment fields from a
    /// best-effort `/artists` lookup.
    async fn upsert_artists(&self, tracks: &HashMap<String, TrackObject>) -> Result<()> {
        let mut refs: HashMap<String, &ArtistRef> = HashMap::new();
        for track in tracks.values() {
            for artist in track.artists.iter().chain(track.album.artists.iter()) {
                refs.insert(artist.id.clone(), artist);
            }
        }
        let all_ids: Vec<String> = refs.keys().cloned().collect();
        let existing = self.catalog.get_artists_by_spotify_ids(&all_ids)?;
        let missing_ids: Vec<String> = all_ids
            .iter()
            .filter(|id| !existing.contains_key(*id))
            .cloned()
            .collect();
        if missing_ids.is_empty() {
            return Ok(());
        }

        let enrichment = self.api.get_artists(&missing_ids).await?;
        let new_artists: Vec<NewArtist> = missing_ids
            .iter()
            .map(|id| {
                let artist_ref = refs[id];
                let full = enrichment.get(id);
                NewArtist {
                    spotify_id: id.clone(),
                    name: artist_ref.name.clone(),
                    spotify_url: artist_ref.external_urls.spotify.clone(),
                    image: full.and_then(|a| a.first_image_url()),
                    popularity: full.and_then(|a| a.popularity),
                    followers: full.and_then(|a| a.followers.as_ref()?.total),
                }
            })
            .collect();
        self.catalog.insert_artists(&new_artists)
    }

    /// Upserts every album the fetched tracks belong to. Release date is
    /// kept only at day precision, the image is the first listed one.
    async fn upsert_albums(&self, tracks: &HashMap<String, TrackObject>) -> Result<()> {
        let albums: HashMap<String, &crate::spotify::models::AlbumObject> = tracks
            .values()
            .map(|t| (t.album.id.clone(), &t.album))
            .collect();
        let all_ids: Vec<String> = albums.keys().cloned().collect();
        let existing = self.catalog.get_albums_by_spotify_ids(&all_ids)?;
        let missing_ids: Vec<String> = all_ids
            .iter()
            .filter(|id| !existing.contains_key(*id))
            .cloned()
            .collect();
        if missing_ids.is_empty() {
            return Ok(());
        }

        let enrichment = self.api.get_albums(&missing_ids).await?;
        let new_albums: Vec<NewAlbum> = missing_ids
            .iter()
            .map(|id| {
                let album = albums[id];
                NewAlbum {
                    spotify_id: id.clone(),
                    name: album.name.clone(),
                    spotify_url: album.external_urls.spotify.clone(),
                    album_type: AlbumType::from_db_str(&album.album_type),
                    release_date: album.release_date_if_day_precision(),
                    image: album.first_image_url(),
                    popularity: enrichment.get(id).and_then(|a| a.popularity),
                }
            })
            .collect();
        self.catalog.insert_albums(&new_albums)
    }
}

fn distinct_track_ids(listens: &[ParsedListen]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for listen in listens {
        if seen.insert(listen.spotify_track_id.as_str()) {
            ids.push(listen.spotify_track_id.clone());
        }
    }
    ids
}

fn artist_ids(tracks: &HashMap<String, TrackObject>) -> Vec<String> {
    let mut ids: HashSet<String> = HashSet::new();
    for track in tracks.values() {
        for artist in track.artists.iter().chain(track.album.artists.iter()) {
            ids.insert(artist.id.clone());
        }
    }
    ids.into_iter().collect()
}

fn album_ids(tracks: &HashMap<String, TrackObject>) -> Vec<String> {
    tracks
        .values()
        .map(|t| t.album.id.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect()
}
