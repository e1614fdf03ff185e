//! Wire-format types for the Spotify Web API responses we consume.

use chrono::NaiveDate;
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct ExternalUrls {
    pub spotify: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ImageObject {
    pub url: String,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
}

/// Artist reference as embedded in track and album payloads. Carries no
/// enrichment fields.
#[derive(Clone, Debug, Deserialize)]
pub struct ArtistRef {
    pub id: String,
    pub name: String,
    pub external_urls: ExternalUrls,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Followers {
    #[serde(default)]
    pub total: Option<i64>,
}

/// Full artist object from `/artists`.
#[derive(Clone, Debug, Deserialize)]
pub struct ArtistObject {
    pub id: String,
    pub name: String,
    pub external_urls: ExternalUrls,
    #[serde(default)]
    pub images: Vec<ImageObject>,
    #[serde(default)]
    pub popularity: Option<i32>,
    #[serde(default)]
    pub followers: Option<Followers>,
}

impl ArtistObject {
    pub fn first_image_url(&self) -> Option<String> {
        self.images.first().map(|i| i.url.clone())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AlbumObject {
    pub id: String,
    pub name: String,
    pub external_urls: ExternalUrls,
    pub album_type: String,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub release_date_precision: Option<String>,
    #[serde(default)]
    pub images: Vec<ImageObject>,
    #[serde(default)]
    pub artists: Vec<ArtistRef>,
    #[serde(default)]
    pub popularity: Option<i32>,
}

impl AlbumObject {
    pub fn first_image_url(&self) -> Option<String> {
        self.images.first().map(|i| i.url.clone())
    }

    /// The release date, only when the API declared day-level precision.
    /// Year- and month-precision dates are discarded.
    pub fn release_date_if_day_precision(&self) -> Option<NaiveDate> {
        if self.release_date_precision.as_deref() != Some("day") {
            return None;
        }
        self.release_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct TrackObject {
    pub id: String,
    pub name: String,
    pub external_urls: ExternalUrls,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub explicit: bool,
    #[serde(default)]
    pub popularity: Option<i32>,
    #[serde(default)]
    pub artists: Vec<ArtistRef>,
    pub album: AlbumObject,
}

/// Unknown ids come back as `null` entries, position-matched to the request.
#[derive(Debug, Deserialize)]
pub struct TracksResponse {
    pub tracks: Vec<Option<TrackObject>>,
}

#[derive(Debug, Deserialize)]
pub struct ArtistsResponse {
    pub artists: Vec<Option<ArtistObject>>,
}

#[derive(Debug, Deserialize)]
pub struct AlbumsResponse {
    pub albums: Vec<Option<AlbumObject>>,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_date_precision_rule() {
        let mut album: AlbumObject = serde_json::from_value(serde_json::json!({
            "id": "al1",
            "name": "Album",
            "external_urls": {"spotify": "https://open.spotify.com/album/al1"},
            "album_type": "album",
            "release_date": "2020-05-01",
            "release_date_precision": "day"
        }))
        .unwrap();
        assert_eq!(
            album.release_date_if_day_precision(),
            Some(NaiveDate::from_ymd_opt(2020, 5, 1).unwrap())
        );

        album.release_date = Some("2020".to_string());
        album.release_date_precision = Some("year".to_string());
        assert_eq!(album.release_date_if_day_precision(), None);

        album.release_date_precision = None;
        assert_eq!(album.release_date_if_day_precision(), None);
    }

    #[test]
    fn test_tracks_response_tolerates_nulls() {
        let response: TracksResponse = serde_json::from_value(serde_json::json!({
            "tracks": [
                null,
                {
                    "id": "t1",
                    "name": "Track",
                    "external_urls": {"spotify": "https://open.spotify.com/track/t1"},
                    "duration_ms": 215000,
                    "explicit": true,
                    "artists": [],
                    "album": {
                        "id": "al1",
                        "name": "Album",
                        "external_urls": {"spotify": "https://open.spotify.com/album/al1"},
                        "album_type": "album"
                    }
                }
            ]
        }))
        .unwrap();
        assert_eq!(response.tracks.len(), 2);
        assert!(response.tracks[0].is_none());
        assert_eq!(response.tracks[1].as_ref().unwrap().id, "t1");
    }
}
