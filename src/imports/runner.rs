//! In-process execution of import job stages.
//!
//! Each enqueued stage runs as its own spawned task, so jobs from one upload
//! batch proceed fully in parallel. A stage error marks the job failed with
//! the error text and is logged here; nothing is retried automatically.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{error, info};

use super::parser::parse_archive;
use super::reconciler::Reconciler;
use super::store::ImportStore;

#[derive(Debug)]
enum ImportStage {
    Parse { job_id: String },
    Reconcile { job_id: String },
}

struct StageTracker {
    pending: Mutex<usize>,
    notify: Notify,
}

impl StageTracker {
    fn started(&self) {
        *self.pending.lock().unwrap() += 1;
    }

    fn finished(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending -= 1;
        if *pending == 0 {
            self.notify.notify_waiters();
        }
    }
}

struct RunnerInner {
    imports: Arc<dyn ImportStore>,
    reconciler: Arc<Reconciler>,
    uploads_dir: PathBuf,
    sender: mpsc::UnboundedSender<ImportStage>,
    tracker: StageTracker,
}

/// Task queue for import stages. Cheap to clone, all clones share the queue.
#[derive(Clone)]
pub struct ImportRunner {
    inner: Arc<RunnerInner>,
}

impl ImportRunner {
    pub fn new(
        imports: Arc<dyn ImportStore>,
        reconciler: Arc<Reconciler>,
        uploads_dir: PathBuf,
    ) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let runner = ImportRunner {
            inner: Arc::new(RunnerInner {
                imports,
                reconciler,
                uploads_dir,
                sender,
                tracker: StageTracker {
                    pending: Mutex::new(0),
                    notify: Notify::new(),
                },
            }),
        };

        let dispatcher = runner.clone();
        tokio::spawn(async move {
            while let Some(stage) = receiver.recv().await {
                let runner = dispatcher.clone();
                tokio::spawn(async move {
                    runner.run_stage(stage).await;
                    runner.inner.tracker.finished();
                });
            }
        });

        runner
    }

    /// The path a job's uploaded payload is spooled at.
    pub fn payload_path(&self, job_id: &str) -> PathBuf {
        self.inner.uploads_dir.join(format!("{}.json", job_id))
    }

    pub(crate) fn uploads_dir(&self) -> &std::path::Path {
        &self.inner.uploads_dir
    }

    pub fn enqueue_parse(&self, job_id: &str) {
        self.enqueue(ImportStage::Parse {
            job_id: job_id.to_string(),
        });
    }

    pub fn enqueue_reconcile(&self, job_id: &str) {
        self.enqueue(ImportStage::Reconcile {
            job_id: job_id.to_string(),
        });
    }

    /// Resolves once every enqueued stage (including stages they enqueue in
    /// turn) has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.tracker.notify.notified();
            if *self.inner.tracker.pending.lock().unwrap() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn enqueue(&self, stage: ImportStage) {
        self.inner.tracker.started();
        if self.inner.sender.send(stage).is_err() {
            // Receiver task only dies at shutdown.
            self.inner.tracker.finished();
        }
    }

    async fn run_stage(&self, stage: ImportStage) {
        let (label, job_id) = match &stage {
            ImportStage::Parse { job_id } => ("parse", job_id.clone()),
            ImportStage::Reconcile { job_id } => ("reconcile", job_id.clone()),
        };

        let result = match stage {
            ImportStage::Parse { job_id } => self.run_parse(&job_id).await,
            ImportStage::Reconcile { job_id } => self.inner.reconciler.run(&job_id).await,
        };

        if let Err(e) = result {
            error!("Import job {} failed at {} stage: {:#}", job_id, label, e);
            if let Err(store_err) = self.inner.imports.set_failed(&job_id, &format!("{:#}", e)) {
                error!(
                    "Could not mark import job {} as failed: {:#}",
                    job_id, store_err
                );
            }
        }
    }

    async fn run_parse(&self, job_id: &str) -> Result<()> {
        let path = self.payload_path(job_id);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read uploaded payload {:?}", path))?;

        let outcome = parse_archive(&content)?;
        info!(
            "Import job {}: parsed {} listens ({} records skipped)",
            job_id,
            outcome.listens.len(),
            outcome.skipped_records
        );

        self.inner
            .imports
            .commit_parsed_listens(job_id, &outcome.listens)?;
        // Reconciliation only after the listens are durably committed.
        self.enqueue_reconcile(job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imports::models::ImportJobStatus;
    use crate::imports::store::SqliteImportStore;
    use crate::imports::upload::{UploadFile, UploadService};
    use crate::spotify::models::{AlbumObject, ArtistObject, TrackObject};
    use crate::spotify::{CatalogApi, CatalogError};
    use crate::storage::{Database, HistoryStore, SqliteCatalogStore, SqliteHistoryStore};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct EmptyCatalogApi;

    #[async_trait]
    impl CatalogApi for EmptyCatalogApi {
        async fn get_tracks(
            &self,
            _ids: &[String],
        ) -> Result<HashMap<String, TrackObject>, CatalogError> {
            Ok(HashMap::new())
        }

        async fn get_artists(
            &self,
            _ids: &[String],
        ) -> Result<HashMap<String, ArtistObject>, CatalogError> {
            Ok(HashMap::new())
        }

        async fn get_albums(
            &self,
            _ids: &[String],
        ) -> Result<HashMap<String, AlbumObject>, CatalogError> {
            Ok(HashMap::new())
        }
    }

    struct Fixture {
        imports: Arc<SqliteImportStore>,
        history: Arc<SqliteHistoryStore>,
        runner: ImportRunner,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let imports = Arc::new(SqliteImportStore::new(&db));
        let catalog = Arc::new(SqliteCatalogStore::new(&db));
        let history = Arc::new(SqliteHistoryStore::new(&db));
        let reconciler = Arc::new(Reconciler::new(
            imports.clone(),
            catalog,
            history.clone(),
            Arc::new(EmptyCatalogApi),
        ));
        let dir = tempfile::tempdir().unwrap();
        let runner = ImportRunner::new(imports.clone(), reconciler, dir.path().to_path_buf());
        Fixture {
            imports,
            history,
            runner,
            _dir: dir,
        }
    }

    fn archive(track_ids: &[&str]) -> String {
        let records: Vec<serde_json::Value> = track_ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "ts": "2023-04-15T20:30:00Z",
                    "platform": "android",
                    "ms_played": 215_000,
                    "spotify_track_uri": format!("spotify:track:{id}"),
                    "reason_start": "clickrow",
                    "reason_end": "trackdone",
                    "shuffle": false,
                    "skipped": false
                })
            })
            .collect();
        serde_json::Value::Array(records).to_string()
    }

    #[tokio::test]
    async fn test_upload_runs_jobs_to_completion() {
        let f = fixture();
        let service = UploadService::new(f.imports.clone(), f.runner.clone());

        let outcome = service
            .accept(
                "u1",
                vec![UploadFile {
                    name: "history.json".to_string(),
                    content: archive(&["t1"]),
                }],
            )
            .unwrap();
        assert_eq!(outcome.job_ids.len(), 1);
        assert!(outcome.rejected.is_empty());

        f.runner.wait_idle().await;

        let job = f.imports.get_job(&outcome.job_ids[0]).unwrap().unwrap();
        // No track resolved, but the job still completes.
        assert_eq!(job.status, ImportJobStatus::Completed);
        assert_eq!(f.history.history_count_for_user("u1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_json_rejected_without_affecting_siblings() {
        let f = fixture();
        let service = UploadService::new(f.imports.clone(), f.runner.clone());

        let outcome = service
            .accept(
                "u1",
                vec![
                    UploadFile {
                        name: "broken.json".to_string(),
                        content: "{not json".to_string(),
                    },
                    UploadFile {
                        name: "good.json".to_string(),
                        content: archive(&["t1"]),
                    },
                ],
            )
            .unwrap();

        assert_eq!(outcome.job_ids.len(), 1);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].0, "broken.json");

        f.runner.wait_idle().await;
        assert_eq!(
            f.imports
                .get_job(&outcome.job_ids[0])
                .unwrap()
                .unwrap()
                .status,
            ImportJobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_parse_failure_marks_job_failed_with_error_text() {
        let f = fixture();
        let service = UploadService::new(f.imports.clone(), f.runner.clone());

        // Structurally valid JSON, but a record with a track URI is missing
        // required fields, which fails the parse stage.
        let content = serde_json::json!([{
            "spotify_track_uri": "spotify:track:t1",
            "ts": "2023-04-15T20:30:00Z"
        }])
        .to_string();

        let outcome = service
            .accept(
                "u1",
                vec![UploadFile {
                    name: "partial.json".to_string(),
                    content,
                }],
            )
            .unwrap();
        f.runner.wait_idle().await;

        let job = f.imports.get_job(&outcome.job_ids[0]).unwrap().unwrap();
        assert_eq!(job.status, ImportJobStatus::Failed);
        assert!(job.error.contains("missing field"), "error: {}", job.error);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_nothing_pending() {
        let f = fixture();
        f.runner.wait_idle().await;
    }
}
