use std::sync::Arc;
use std::time::Duration;

use backend::{ApiError, ByteProgress, CompletePartRequest, MultipartApi, PartStore};
use log::debug;

use crate::error::UploadError;
use crate::file::FileSource;
use crate::part::Part;
use crate::progress::ProgressTracker;
use crate::registry::AbortFlag;

/// Attempts spent on a part before it fails the whole upload.
///
pub const MAX_ATTEMPTS: u32 = 4;

/// Base of the exponential backoff between attempts
/// (`delay = base * 2^attempt`).
///
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Uploads single parts: PUT to the presigned URL, then backend
/// confirmation, with retry, backoff, timeout and abort handling.
///
pub struct PartUploader {
    api: Arc<dyn MultipartApi>,
    store: Arc<dyn PartStore>,
    job_id: String,
    file: FileSource,
    tracker: Arc<ProgressTracker>,
    abort: AbortFlag,
    timeout: Duration,
    max_attempts: u32,
    backoff_base: Duration,
}

impl PartUploader {
    /// Create an uploader for one task's parts.
    ///
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn MultipartApi>,
        store: Arc<dyn PartStore>,
        job_id: impl Into<String>,
        file: FileSource,
        tracker: Arc<ProgressTracker>,
        abort: AbortFlag,
        timeout: Duration,
    ) -> Self {
        Self {
            api,
            store,
            job_id: job_id.into(),
            file,
            tracker,
            abort,
            timeout,
            max_attempts: MAX_ATTEMPTS,
            backoff_base: BACKOFF_BASE,
        }
    }

    /// Override the retry policy; tests shrink the backoff to keep suites
    /// fast.
    ///
    pub fn with_retry(mut self, max_attempts: u32, backoff_base: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.backoff_base = backoff_base;
        self
    }

    /// Upload one part to its presigned URL and confirm it with the backend.
    ///
    /// Transient failures are absorbed by the retry budget and logged at
    /// debug level; abort and authorization failures propagate immediately
    /// without spending further attempts. `part.etag` and `part.uploaded`
    /// are mutated only after the backend acknowledges the part.
    ///
    pub async fn upload_part(&self, part: &mut Part) -> Result<(), UploadError> {
        let part_len = part.len();
        let mut last_err: Option<UploadError> = None;

        for attempt in 0..self.max_attempts {
            if self.abort.is_aborted() {
                return Err(UploadError::Aborted);
            }

            if attempt > 0 {
                let delay = self.backoff_base * 2u32.pow(attempt);
                debug!(
                    "retrying part {} of job {} in {:?} (attempt {})",
                    part.part_number, self.job_id, delay, attempt + 1
                );
                tokio::select! {
                    _ = self.abort.cancelled() => return Err(UploadError::Aborted),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            // A failed attempt must not leave its bytes counted against the
            // aggregate.
            self.tracker.reset_part(part.part_number);

            match self.attempt(part).await {
                Ok(etag) => {
                    part.etag = Some(etag);
                    part.uploaded = true;
                    self.tracker.part_completed(part.part_number, part_len);
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    debug!(
                        "part {} of job {} attempt {} failed: {}",
                        part.part_number,
                        self.job_id,
                        attempt + 1,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(UploadError::PartFailed {
            part_number: part.part_number,
            attempts: self.max_attempts,
            source: Box::new(last_err.unwrap_or_else(|| {
                UploadError::Internal("part retry budget exhausted without an error".to_string())
            })),
        })
    }

    async fn attempt(&self, part: &Part) -> Result<String, UploadError> {
        let part_number = part.part_number;
        let body = self.file.read_range(part.start, part.end).await?;

        let tracker = self.tracker.clone();
        let on_progress: ByteProgress =
            Arc::new(move |sent| tracker.part_progress(part_number, sent));

        let put = self.store.put_part(&part.url, body, on_progress);
        let etag = tokio::select! {
            // Dropping the PUT future cancels the request, so bytes stop
            // moving promptly on abort.
            _ = self.abort.cancelled() => return Err(UploadError::Aborted),
            result = tokio::time::timeout(self.timeout, put) => match result {
                Err(_) => return Err(UploadError::Timeout { part_number }),
                Ok(Err(ApiError::MissingEtag)) => {
                    return Err(UploadError::MissingEtag { part_number })
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(etag)) => etag,
            },
        };

        // The PUT succeeded; report the full part for responsive progress,
        // independent of backend confirmation.
        self.tracker.part_progress(part_number, part.len());

        let response = self
            .api
            .complete_part(
                &self.job_id,
                &CompletePartRequest {
                    part_number,
                    etag: etag.clone(),
                },
            )
            .await?;

        if !response.success {
            return Err(UploadError::CompletionRejected { part_number });
        }
        Ok(etag)
    }
}
