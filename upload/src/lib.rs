//!
//! Client-side chunked multipart upload orchestration.
//!
//! Users hand the conversion service large comic/manga archives; this crate
//! splits a file into parts sized to the measured bandwidth, uploads them in
//! parallel to object storage through presigned URLs fetched progressively in
//! batches, and finalizes the upload with the backend. It owns the retry and
//! backoff policy, per-process concurrency budgeting, cross-context session
//! collision detection, cancellation, and monotonic progress reporting.
//!
//! The network edge lives in the `backend` crate and is consumed through
//! traits, so everything here can run against in-memory fakes.
//!
#![warn(missing_docs)]

use std::path::Path;

/// Error taxonomy for upload tasks.
pub mod error;

/// Local file access and logical file identity.
pub mod file;

/// Cross-context session markers and heartbeats.
pub mod guard;

/// The upload lifecycle driver.
pub mod orchestrator;

/// The part data model.
pub mod part;

/// Single-part upload with retry and backoff.
pub mod part_uploader;

/// Bandwidth-adaptive work planning.
pub mod planner;

/// Monotonic aggregate progress.
pub mod progress;

/// The process-wide upload registry.
pub mod registry;

/// Progressive presigned-URL batches.
pub mod source;

/// Persisted bandwidth measurements.
pub mod speed;

pub use error::UploadError;
pub use file::{FileIdentity, FileSource};
pub use orchestrator::{MultipartUploadClient, UploadOptions};
pub use planner::PartPlan;
pub use progress::{ProgressSink, UploadProgress};
pub use registry::{UploadRegistry, UploadState};

/// Upload the file at `path` for `job_id`.
///
/// Convenience wrapper over [`MultipartUploadClient::upload_file`] that
/// opens the file and captures its identity first.
///
pub async fn upload_path(
    client: &MultipartUploadClient,
    path: impl AsRef<Path>,
    job_id: &str,
    on_progress: Option<ProgressSink>,
) -> Result<(), UploadError> {
    let file = FileSource::open(path).await?;
    client.upload_file(file, job_id, on_progress).await
}
