use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an import job.
///
/// uploaded -> parsed -> fetching -> completed, with failed reachable from
/// any non-terminal state.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImportJobStatus {
    Uploaded,
    Parsed,
    Fetching,
    Completed,
    Failed,
}

impl ImportJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportJobStatus::Uploaded => "uploaded",
            ImportJobStatus::Parsed => "parsed",
            ImportJobStatus::Fetching => "fetching",
            ImportJobStatus::Completed => "completed",
            ImportJobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "uploaded" => Ok(ImportJobStatus::Uploaded),
            "parsed" => Ok(ImportJobStatus::Parsed),
            "fetching" => Ok(ImportJobStatus::Fetching),
            "completed" => Ok(ImportJobStatus::Completed),
            "failed" => Ok(ImportJobStatus::Failed),
            _ => bail!("Unknown import job status: {}", s),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportJobStatus::Completed | ImportJobStatus::Failed)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ImportJob {
    pub rowid: i64,
    /// External identifier, a UUID assigned at upload.
    pub id: String,
    pub user_id: String,
    pub source_file: String,
    pub status: ImportJobStatus,
    /// Empty unless the job failed.
    pub error: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One validated listen record, staged between parsing and reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedListen {
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
