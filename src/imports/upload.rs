//! Upload boundary: validates incoming archive files, creates one import
//! job per accepted file and hands the parse stage to the runner.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use super::runner::ImportRunner;
use super::store::ImportStore;

/// An uploaded file: original name plus raw content.
pub struct UploadFile {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Default)]
pub struct UploadOutcome {
    pub job_ids: Vec<String>,
    /// (file name, reason) for files rejected at the boundary.
    pub rejected: Vec<(String, String)>,
}

pub struct UploadService {
    imports: Arc<dyn ImportStore>,
    runner: ImportRunner,
}

impl UploadService {
    pub fn new(imports: Arc<dyn ImportStore>, runner: ImportRunner) -> Self {
        UploadService { imports, runner }
    }

    /// Accepts a batch of files. Files that are not syntactically valid JSON
    /// are rejected individually without affecting their siblings.
    pub fn accept(&self, user_id: &str, files: Vec<UploadFile>) -> Result<UploadOutcome> {
        std::fs::create_dir_all(self.runner.uploads_dir())?;

        let mut outcome = UploadOutcome::default();
        for file in files {
            if let Err(e) = serde_json::from_str::<serde_json::Value>(&file.content) {
                outcome
                    .rejected
                    .push((file.name, format!("Not valid JSON: {e}")));
                continue;
            }

            let job = self.imports.create_job(user_id, &file.name)?;
            let path = self.runner.payload_path(&job.id);
            std::fs::write(&path, &file.content)
                .with_context(|| format!("Failed to spool upload to {:?}", path))?;

            info!("Created import job {} for file {}", job.id, job.source_file);
            self.runner.enqueue_parse(&job.id);
            outcome.job_ids.push(job.id);
        }
        Ok(outcome)
    }
}
