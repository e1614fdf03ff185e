//! The import pipeline: upload boundary, archive parsing, job bookkeeping
//! and reconciliation into the catalog and listening history.

pub mod models;
pub mod parser;
pub mod reconciler;
pub mod runner;
pub mod store;
pub mod upload;

pub use models::{ImportJob, ImportJobStatus, ParsedListen};
pub use parser::{parse_archive, ImportError, ParseOutcome};
pub use reconciler::Reconciler;
pub use runner::ImportRunner;
pub use store::{ImportStore, SqliteImportStore};
pub use upload::{UploadFile, UploadOutcome, UploadService};
