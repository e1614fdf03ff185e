//! Listen record parsing for exported streaming history archives.
//!
//! An archive is a JSON array of listen objects. Records without a usable
//! `spotify:track:` URI are skipped silently; records with a usable URI but
//! missing or malformed required fields are collected and reported as a
//! single job-level failure.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use super::models::ParsedListen;

const TRACK_URI_PREFIX: &str = "spotify:track:";
const MAX_REPORTED_RECORD_ERRORS: usize = 5;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Archive is not a valid JSON array: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("{count} invalid records: {details}")]
    InvalidRecords { count: usize, details: String },
}

/// One raw archive record, minus the track URI which is checked on the raw
/// JSON value before this decode runs. Every field is optional so that a
/// missing field is reported per record, not as a decode failure.
#[derive(Debug, Deserialize)]
struct RawListen {
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    ms_played: Option<i64>,
    #[serde(default)]
    reason_start: Option<String>,
    #[serde(default)]
    reason_end: Option<String>,
    #[serde(default)]
    shuffle: Option<bool>,
    #[serde(default)]
    skipped: Option<bool>,
    #[serde(default)]
    offline: Option<bool>,
    #[serde(default)]
    offline_timestamp: Option<i64>,
}

fn track_id_from_uri(uri: Option<&str>) -> Option<String> {
    let id = uri?.strip_prefix(TRACK_URI_PREFIX)?;
    if id.is_empty() {
        return None;
    }
    Some(id.to_string())
}

fn required<T>(value: Option<T>, field: &str, index: usize) -> Result<T, String> {
    value.ok_or_else(|| format!("record {}: missing field '{}'", index, field))
}

fn parse_record(index: usize, raw: RawListen, track_id: String) -> Result<ParsedListen, String> {
    let ts = required(raw.ts, "ts", index)?;
    let played_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts)
        .map_err(|e| format!("record {}: invalid ts '{}': {}", index, ts, e))?
        .with_timezone(&Utc);

    Ok(ParsedListen {
        spotify_track_id: track_id,
        played_at,
        platform: required(raw.platform, "platform", index)?,
        ms_played: required(raw.ms_played, "ms_played", index)?,
        reason_start: required(raw.reason_start, "reason_start", index)?,
        reason_end: required(raw.reason_end, "reason_end", index)?,
        shuffle: required(raw.shuffle, "shuffle", index)?,
        skipped: required(raw.skipped, "skipped", index)?,
        offline: raw.offline,
        offline_timestamp: raw.offline_timestamp,
    })
}

/// Result of a successful parse: the valid listens in input order, plus how
/// many records were skipped for lacking a usable track URI.
#[derive(Debug)]
pub struct ParseOutcome {
    pub listens: Vec<ParsedListen>,
    pub skipped_records: usize,
}

/// Parses the archive content. Returns the valid listens, or the aggregated
/// record errors if any record with a usable track URI was invalid.
pub fn parse_archive(content: &str) -> Result<ParseOutcome, ImportError> {
    let records: Vec<serde_json::Value> = serde_json::from_str(content)?;

    let mut listens = Vec::new();
    let mut errors = Vec::new();
    let mut skipped_records = 0;
    for (index, value) in records.into_iter().enumerate() {
        // The URI gate runs first: a record that is not a track listen is
        // skipped without looking at its remaining fields.
        let uri = value.get("spotify_track_uri").and_then(|v| v.as_str());
        let track_id = match track_id_from_uri(uri) {
            Some(id) => id,
            None => {
                skipped_records += 1;
                continue;
            }
        };

        let raw: RawListen = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(e) => {
                errors.push(format!("record {}: {}", index, e));
                continue;
            }
        };

        match parse_record(index, raw, track_id) {
            Ok(listen) => listens.push(listen),
            Err(e) => errors.push(e),
        }
    }

    if !errors.is_empty() {
        let count = errors.len();
        let mut details = errors
            .iter()
            .take(MAX_REPORTED_RECORD_ERRORS)
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        if count > MAX_REPORTED_RECORD_ERRORS {
            details.push_str(", ...");
        }
        return Err(ImportError::InvalidRecords { count, details });
    }

    Ok(ParseOutcome {
        listens,
        skipped_records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(track_uri: &str) -> serde_json::Value {
        serde_json::json!({
            "ts": "2023-04-15T20:30:00Z",
            "platform": "android",
            "ms_played": 215_000,
            "spotify_track_uri": track_uri,
            "reason_start": "clickrow",
            "reason_end": "trackdone",
            "shuffle": false,
            "skipped": false,
            "offline": false,
            "offline_timestamp": 1681590600
        })
    }

    #[test]
    fn test_parses_valid_records() {
        let content = serde_json::json!([record("spotify:track:abc123")]).to_string();
        let outcome = parse_archive(&content).unwrap();
        assert_eq!(outcome.listens.len(), 1);
        assert_eq!(outcome.skipped_records, 0);
        assert_eq!(outcome.listens[0].spotify_track_id, "abc123");
        assert_eq!(outcome.listens[0].ms_played, 215_000);
        assert_eq!(outcome.listens[0].offline, Some(false));
    }

    #[test]
    fn test_skips_records_without_track_uri() {
        let mut podcast = record("spotify:track:abc123");
        podcast["spotify_track_uri"] = serde_json::Value::Null;
        let mut episode = record("spotify:episode:xyz");
        episode["spotify_track_uri"] = "spotify:episode:xyz".into();

        let content =
            serde_json::json!([podcast, episode, record("spotify:track:keep")]).to_string();
        let outcome = parse_archive(&content).unwrap();
        assert_eq!(outcome.listens.len(), 1);
        assert_eq!(outcome.skipped_records, 2);
        assert_eq!(outcome.listens[0].spotify_track_id, "keep");
    }

    #[test]
    fn test_missing_required_field_fails_with_aggregated_errors() {
        let mut bad_one = record("spotify:track:a");
        bad_one.as_object_mut().unwrap().remove("platform");
        let mut bad_two = record("spotify:track:b");
        bad_two["ts"] = "not-a-timestamp".into();

        let content =
            serde_json::json!([bad_one, record("spotify:track:ok"), bad_two]).to_string();
        let err = parse_archive(&content).unwrap_err();
        match err {
            ImportError::InvalidRecords { count, details } => {
                assert_eq!(count, 2);
                assert!(details.contains("record 0: missing field 'platform'"));
                assert!(details.contains("record 2: invalid ts"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        assert!(matches!(
            parse_archive("{not json"),
            Err(ImportError::InvalidJson(_))
        ));
        // A JSON object at the root is also not an archive.
        assert!(matches!(
            parse_archive("{}"),
            Err(ImportError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_empty_archive_yields_no_listens() {
        assert!(parse_archive("[]").unwrap().listens.is_empty());
    }

    #[test]
    fn test_non_track_record_with_bad_field_is_still_skipped() {
        // Episode rows in real exports sometimes carry junk in fields we
        // would otherwise validate; they must never fail the job.
        let mut episode = record("spotify:episode:xyz");
        episode["ms_played"] = "not-a-number".into();

        let content = serde_json::json!([episode, record("spotify:track:keep")]).to_string();
        let outcome = parse_archive(&content).unwrap();
        assert_eq!(outcome.listens.len(), 1);
        assert_eq!(outcome.skipped_records, 1);

        // The same junk on a track record is a real error.
        let mut track = record("spotify:track:bad");
        track["ms_played"] = "not-a-number".into();
        let err = parse_archive(&serde_json::json!([track]).to_string()).unwrap_err();
        assert!(matches!(err, ImportError::InvalidRecords { count: 1, .. }));
    }

    #[test]
    fn test_empty_track_id_is_skipped() {
        let content = serde_json::json!([record("spotify:track:")]).to_string();
        let outcome = parse_archive(&content).unwrap();
        assert!(outcome.listens.is_empty());
        assert_eq!(outcome.skipped_records, 1);
    }
}
