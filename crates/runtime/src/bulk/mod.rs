//! Collection bulk operations: NDJSON import, background export jobs, and
//! direct streaming downloads.

pub mod export;
pub mod import;
pub mod job_store;

pub use export::{DownloadParams, ExportManager};
pub use import::{ImportOptions, ImportRequest};
pub use job_store::{ExportJob, ExportParams, JobStatus, JobStore};
