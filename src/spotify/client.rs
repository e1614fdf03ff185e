//! Batched catalog lookups against the Spotify Web API.
//!
//! Ids are chunked into batches of at most 50 and fetched with bounded
//! concurrency. Track batches retry transient failures with exponential
//! backoff and honor 429 Retry-After; enrichment batches (artists, albums)
//! are single-shot and best-effort.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::models::{
    AlbumObject, AlbumsResponse, ArtistObject, ArtistsResponse, TrackObject, TracksResponse,
};
use super::token::TokenProvider;
use super::CatalogError;

const MAX_IDS_PER_BATCH: usize = 50;
const MAX_CONCURRENT_BATCHES: usize = 3;
const MAX_ATTEMPTS_PER_BATCH: usize = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw HTTP response as seen by the retry logic.
#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub retry_after_secs: Option<u64>,
    pub body: String,
}

/// The HTTP layer under the client. Narrow on purpose: tests script status
/// codes and Retry-After values through it.
#[async_trait]
pub trait CatalogTransport: Send + Sync {
    async fn get(&self, path_and_query: &str, bearer: &str)
        -> Result<TransportResponse, CatalogError>;
}

pub struct HttpCatalogTransport {
    client: reqwest::Client,
    api_base_url: String,
}

impl HttpCatalogTransport {
    pub fn new(api_base_url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(HttpCatalogTransport {
            client,
            api_base_url,
        })
    }
}

#[async_trait]
impl CatalogTransport for HttpCatalogTransport {
    async fn get(
        &self,
        path_and_query: &str,
        bearer: &str,
    ) -> Result<TransportResponse, CatalogError> {
        let url = format!("{}{}", self.api_base_url, path_and_query);
        let response = self.client.get(&url).bearer_auth(bearer).send().await?;
        let status = response.status().as_u16();
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await?;
        Ok(TransportResponse {
            status,
            retry_after_secs,
            body,
        })
    }
}

/// Catalog lookups keyed by spotify id. Ids the API does not know are
/// simply absent from the result maps.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn get_tracks(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, TrackObject>, CatalogError>;
    async fn get_artists(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ArtistObject>, CatalogError>;
    async fn get_albums(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, AlbumObject>, CatalogError>;
}

pub struct SpotifyClient {
    transport: Arc<dyn CatalogTransport>,
    tokens: Arc<TokenProvider>,
}

impl SpotifyClient {
    pub fn new(transport: Arc<dyn CatalogTransport>, tokens: Arc<TokenProvider>) -> Self {
        SpotifyClient { transport, tokens }
    }

    fn backoff_delay(attempt: usize) -> Duration {
        BACKOFF_CAP.min(BACKOFF_BASE * 2u32.saturating_pow(attempt as u32))
    }

    /// One GET with auth. `Ok(None)` means a non-retryable non-2xx response
    /// that was logged; `Err(Transport)` is retryable by the caller.
    async fn get_json(&self, path_and_query: &str) -> Result<Option<TransportResponse>, CatalogError> {
        let token = self.tokens.access_token().await?;
        let response = self.transport.get(path_and_query, &token).await?;
        match response.status {
            200..=299 => Ok(Some(response)),
            401 | 403 => Err(CatalogError::Authentication(format!(
                "API rejected token with status {}",
                response.status
            ))),
            429 => {
                let wait = Duration::from_secs(response.retry_after_secs.unwrap_or(1));
                debug!("Rate limited, waiting {:?} before the next attempt", wait);
                tokio::time::sleep(wait).await;
                Err(CatalogError::Transport("rate limited".to_string()))
            }
            status => {
                warn!("Catalog request {} failed with status {}", path_and_query, status);
                Ok(None)
            }
        }
    }

    fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T, CatalogError> {
        serde_json::from_str(body)
            .map_err(|e| CatalogError::Transport(format!("Invalid response body: {e}")))
    }

    /// Fetch one batch of tracks with up to 5 attempts. Exhausted retries
    /// and non-retryable responses leave the batch unresolved.
    async fn fetch_tracks_batch(&self, ids: &[String]) -> Result<Vec<TrackObject>, CatalogError> {
        let path = format!("/tracks?ids={}", ids.join(","));
        for attempt in 0..MAX_ATTEMPTS_PER_BATCH {
            match self.get_json(&path).await {
                Ok(Some(response)) => {
                    match Self::parse_body::<TracksResponse>(&response.body) {
                        Ok(parsed) => return Ok(parsed.tracks.into_iter().flatten().collect()),
                        Err(e) => warn!("Track batch attempt {} failed: {}", attempt + 1, e),
                    }
                }
                Ok(None) => return Ok(Vec::new()),
                Err(e @ CatalogError::Authentication(_)) => return Err(e),
                Err(e) => warn!("Track batch attempt {} failed: {}", attempt + 1, e),
            }
            if attempt + 1 < MAX_ATTEMPTS_PER_BATCH {
                tokio::time::sleep(Self::backoff_delay(attempt)).await;
            }
        }
        warn!(
            "Track batch of {} ids unresolved after {} attempts",
            ids.len(),
            MAX_ATTEMPTS_PER_BATCH
        );
        Ok(Vec::new())
    }

    /// Single-attempt enrichment fetch. A failed batch is logged and
    /// resolves to nothing.
    async fn fetch_enrichment_batch<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        ids: &[String],
    ) -> Result<Option<T>, CatalogError> {
        let path = format!("/{}?ids={}", endpoint, ids.join(","));
        match self.get_json(&path).await {
            Ok(Some(response)) => match Self::parse_body::<T>(&response.body) {
                Ok(parsed) => Ok(Some(parsed)),
                Err(e) => {
                    warn!("Enrichment batch for {} failed: {}", endpoint, e);
                    Ok(None)
                }
            },
            Ok(None) => Ok(None),
            Err(e @ CatalogError::Authentication(_)) => Err(e),
            Err(e) => {
                warn!("Enrichment batch for {} failed: {}", endpoint, e);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl CatalogApi for SpotifyClient {
    async fn get_tracks(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, TrackObject>, CatalogError> {
        let chunks: Vec<Vec<String>> = ids.chunks(MAX_IDS_PER_BATCH).map(<[_]>::to_vec).collect();
        let batches: Vec<Vec<TrackObject>> = stream::iter(chunks)
            .map(|chunk| async move { self.fetch_tracks_batch(&chunk).await })
            .buffer_unordered(MAX_CONCURRENT_BATCHES)
            .try_collect()
            .await?;

        let mut tracks = HashMap::new();
        for batch in batches {
            for track in batch {
                tracks.insert(track.id.clone(), track);
            }
        }
        debug!("Resolved {} of {} requested tracks", tracks.len(), ids.len());
        Ok(tracks)
    }

    async fn get_artists(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ArtistObject>, CatalogError> {
        let chunks: Vec<Vec<String>> = ids.chunks(MAX_IDS_PER_BATCH).map(<[_]>::to_vec).collect();
        let batches: Vec<Option<ArtistsResponse>> = stream::iter(chunks)
            .map(|chunk| async move {
                self.fetch_enrichment_batch::<ArtistsResponse>("artists", &chunk)
                    .await
            })
            .buffer_unordered(MAX_CONCURRENT_BATCHES)
            .try_collect()
            .await?;

        let mut artists = HashMap::new();
        for response in batches.into_iter().flatten() {
            for artist in response.artists.into_iter().flatten() {
                artists.insert(artist.id.clone(), artist);
            }
        }
        Ok(artists)
    }

    async fn get_albums(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, AlbumObject>, CatalogError> {
        let chunks: Vec<Vec<String>> = ids.chunks(MAX_IDS_PER_BATCH).map(<[_]>::to_vec).collect();
        let batches: Vec<Option<AlbumsResponse>> = stream::iter(chunks)
            .map(|chunk| async move {
                self.fetch_enrichment_batch::<AlbumsResponse>("albums", &chunk)
                    .await
            })
            .buffer_unordered(MAX_CONCURRENT_BATCHES)
            .try_collect()
            .await?;

        let mut albums = HashMap::new();
        for response in batches.into_iter().flatten() {
            for album in response.albums.into_iter().flatten() {
                albums.insert(album.id.clone(), album);
            }
        }
        Ok(albums)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spotify::models::TokenResponse;
    use crate::spotify::token::{Grant, TokenFetcher};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct StaticTokenFetcher;

    #[async_trait]
    impl TokenFetcher for StaticTokenFetcher {
        async fn fetch_token(&self, _grant: &Grant) -> Result<TokenResponse, CatalogError> {
            Ok(TokenResponse {
                access_token: "test-token".to_string(),
                token_type: Some("Bearer".to_string()),
                expires_in: Some(3600),
                refresh_token: None,
            })
        }
    }

    struct ScriptedTransport {
        responses: Mutex<VecDeque<TransportResponse>>,
        requests: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<TransportResponse>) -> Self {
            ScriptedTransport {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CatalogTransport for ScriptedTransport {
        async fn get(
            &self,
            path_and_query: &str,
            bearer: &str,
        ) -> Result<TransportResponse, CatalogError> {
            assert_eq!(bearer, "test-token");
            self.requests
                .lock()
                .unwrap()
                .push(path_and_query.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| CatalogError::Transport("script exhausted".to_string()))
        }
    }

    fn client(transport: Arc<ScriptedTransport>) -> SpotifyClient {
        let tokens = Arc::new(TokenProvider::client_credentials(Arc::new(
            StaticTokenFetcher,
        )));
        SpotifyClient::new(transport, tokens)
    }

    fn ok_response(body: serde_json::Value) -> TransportResponse {
        TransportResponse {
            status: 200,
            retry_after_secs: None,
            body: body.to_string(),
        }
    }

    fn track_json(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": format!("Track {id}"),
            "external_urls": {"spotify": format!("https://open.spotify.com/track/{id}")},
            "duration_ms": 200_000,
            "explicit": false,
            "artists": [],
            "album": {
                "id": "al1",
                "name": "Album",
                "external_urls": {"spotify": "https://open.spotify.com/album/al1"},
                "album_type": "album"
            }
        })
    }

    fn ids(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("id{i}")).collect()
    }

    #[tokio::test]
    async fn test_ids_batched_in_chunks_of_fifty() {
        let responses = (0..3)
            .map(|_| ok_response(serde_json::json!({"tracks": [track_json("t")]})))
            .collect();
        let transport = Arc::new(ScriptedTransport::new(responses));
        let client = client(transport.clone());

        client.get_tracks(&ids(130)).await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        let mut batch_sizes: Vec<usize> = requests
            .iter()
            .map(|path| {
                path.strip_prefix("/tracks?ids=")
                    .unwrap()
                    .split(',')
                    .count()
            })
            .collect();
        batch_sizes.sort_unstable();
        assert_eq!(batch_sizes, vec![30, 50, 50]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_waits_retry_after_and_consumes_an_attempt() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            TransportResponse {
                status: 429,
                retry_after_secs: Some(2),
                body: String::new(),
            },
            ok_response(serde_json::json!({"tracks": [track_json("t1")]})),
        ]));
        let client = client(transport.clone());

        let started = tokio::time::Instant::now();
        let tracks = client.get_tracks(&[t("t1")]).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(tracks.len(), 1);
        assert_eq!(transport.request_count(), 2);
        // Retry-After wait plus the first backoff step.
        assert!(elapsed >= Duration::from_secs(3), "elapsed: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retry_up_to_five_attempts() {
        let transport = Arc::new(ScriptedTransport::new(Vec::new()));
        let client = client(transport.clone());

        // Script exhausted on every attempt: a transport error each time.
        let tracks = client.get_tracks(&[t("t1")]).await.unwrap();
        assert!(tracks.is_empty());
        assert_eq!(transport.request_count(), 5);
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![TransportResponse {
            status: 500,
            retry_after_secs: None,
            body: String::new(),
        }]));
        let client = client(transport.clone());

        let tracks = client.get_tracks(&[t("t1")]).await.unwrap();
        assert!(tracks.is_empty());
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_response_is_fatal() {
        let transport = Arc::new(ScriptedTransport::new(vec![TransportResponse {
            status: 401,
            retry_after_secs: None,
            body: String::new(),
        }]));
        let client = client(transport);

        assert!(matches!(
            client.get_tracks(&[t("t1")]).await,
            Err(CatalogError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_null_entries_absent_from_result() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok_response(
            serde_json::json!({"tracks": [null, track_json("t2")]}),
        )]));
        let client = client(transport);

        let tracks = client.get_tracks(&[t("t1"), t("t2")]).await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert!(tracks.contains_key("t2"));
    }

    #[tokio::test]
    async fn test_enrichment_failure_resolves_to_nothing() {
        let transport = Arc::new(ScriptedTransport::new(vec![TransportResponse {
            status: 503,
            retry_after_secs: None,
            body: String::new(),
        }]));
        let client = client(transport.clone());

        let artists = client.get_artists(&[t("a1")]).await.unwrap();
        assert!(artists.is_empty());
        // Single attempt, no retries.
        assert_eq!(transport.request_count(), 1);
    }

    fn t(id: &str) -> String {
        id.to_string()
    }
}
