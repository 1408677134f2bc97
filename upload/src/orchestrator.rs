use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use backend::{Config, InitiateRequest, MultipartApi, PartStore};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::error::UploadError;
use crate::file::FileSource;
use crate::guard::{MarkerStore, SessionGuard, HEARTBEAT_INTERVAL};
use crate::part::part_count;
use crate::part_uploader::{PartUploader, BACKOFF_BASE, MAX_ATTEMPTS};
use crate::planner::{self, PartPlan};
use crate::progress::{ProgressSink, ProgressTracker};
use crate::registry::{AbortFlag, UploadHandle, UploadRegistry, UploadState};
use crate::source::{PartSource, DEFAULT_BATCH_SIZE};
use crate::speed::SpeedCache;

/// Tuning knobs for the orchestrator. The defaults are the production
/// behavior; overrides exist for operational tuning and fast tests.
///
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Presigned URLs requested in the initiate call.
    pub initial_batch_size: u32,

    /// Presigned URLs requested per background batch.
    pub batch_size: u32,

    /// Attempts per part before the task fails.
    pub max_attempts: u32,

    /// Base of the per-part exponential backoff.
    pub backoff_base: Duration,

    /// Fixed part size, bypassing the planner's bandwidth-adaptive sizing.
    pub part_size: Option<u64>,

    /// Fixed per-task concurrency, bypassing the planner's choice.
    pub max_concurrent_parts: Option<usize>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            initial_batch_size: 20,
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: MAX_ATTEMPTS,
            backoff_base: BACKOFF_BASE,
            part_size: None,
            max_concurrent_parts: None,
        }
    }
}

/// Aborts the wrapped task when dropped; keeps the heartbeat loop from
/// outliving its upload.
///
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drives the full lifecycle of chunked multipart uploads.
///
/// One client serves many uploads; each `upload_file` call runs one task
/// through `INIT → INITIATING → UPLOADING → FINALIZING → COMPLETE`, with
/// `ABORTED` and `FAILED` as the other terminal states. Every terminal
/// failure path performs best-effort cleanup (abort notification, session
/// marker release, registry release) before returning the error.
///
pub struct MultipartUploadClient {
    api: Arc<dyn MultipartApi>,
    store: Arc<dyn PartStore>,
    registry: Arc<UploadRegistry>,
    guard: SessionGuard,
    speed: SpeedCache,
    options: UploadOptions,
}

impl MultipartUploadClient {
    /// Create a client over the given backend, object store, registry and
    /// marker store. `state_dir` holds the persisted speed cache.
    ///
    pub fn new(
        api: Arc<dyn MultipartApi>,
        store: Arc<dyn PartStore>,
        registry: Arc<UploadRegistry>,
        markers: Arc<dyn MarkerStore>,
        state_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            api,
            store,
            registry,
            guard: SessionGuard::new(markers),
            speed: SpeedCache::new(state_dir),
            options: UploadOptions::default(),
        }
    }

    /// Replace the default options.
    ///
    pub fn with_options(mut self, options: UploadOptions) -> Self {
        self.options = options;
        self
    }

    /// The registry this client registers its uploads in.
    ///
    pub fn registry(&self) -> &Arc<UploadRegistry> {
        &self.registry
    }

    /// Upload `file` for `job_id`, reporting progress through `on_progress`.
    ///
    /// Rejects duplicate attempts (same job id or same logical file, in this
    /// process or in another context holding a live session marker) before
    /// any network activity. On success the backend has finalized the
    /// multipart upload; on any error the backend has been sent a
    /// best-effort abort and all local state is released.
    ///
    pub async fn upload_file(
        &self,
        file: FileSource,
        job_id: &str,
        on_progress: Option<ProgressSink>,
    ) -> Result<(), UploadError> {
        let handle = self.registry.register(job_id, file.identity.clone())?;

        if let Err(e) = self.guard.try_acquire(job_id) {
            self.registry.release(job_id);
            return Err(e);
        }

        let initiated = AtomicBool::new(false);
        let result = self.run(&file, job_id, &handle, on_progress, &initiated).await;

        match &result {
            Ok(()) => {
                handle.set_state(UploadState::Complete);
                info!("upload for job {} complete", job_id);
            }
            Err(e) if e.is_aborted() => {
                // Cancellation is an expected outcome, not an error worth
                // surfacing loudly.
                handle.set_state(UploadState::Aborted);
                debug!("upload for job {} aborted", job_id);
                if initiated.load(Ordering::SeqCst) {
                    self.notify_abort(job_id).await;
                }
            }
            Err(e) => {
                handle.set_state(UploadState::Failed);
                error!("upload for job {} failed: {}", job_id, e);
                if initiated.load(Ordering::SeqCst) {
                    self.notify_abort(job_id).await;
                }
            }
        }

        self.guard.release(job_id);
        self.registry.release(job_id);
        result
    }

    async fn run(
        &self,
        file: &FileSource,
        job_id: &str,
        handle: &UploadHandle,
        on_progress: Option<ProgressSink>,
        initiated: &AtomicBool,
    ) -> Result<(), UploadError> {
        handle.set_state(UploadState::Initiating);
        let plan = self.plan_for(file.size);
        debug!(
            "job {}: planning {} parts of {} bytes, {} concurrent, {:?} timeout",
            job_id, plan.num_parts, plan.part_size, plan.max_concurrent_parts, plan.per_part_timeout
        );

        let request = InitiateRequest {
            file_size: file.size,
            part_size: plan.part_size,
            initial_batch_size: self.options.initial_batch_size,
        };
        // Fire-and-forget; a hung pre-warm must never hold up the upload.
        let prewarm_api = self.api.clone();
        tokio::spawn(async move {
            if let Err(e) = prewarm_api.prewarm().await {
                debug!("connection pre-warm failed (ignored): {}", e);
            }
        });

        let init = self.api.initiate(job_id, &request).await?;
        initiated.store(true, Ordering::SeqCst);
        debug!("job {}: initiated multipart upload {}", job_id, init.upload_id);

        let tracker = Arc::new(ProgressTracker::new(file.size, on_progress));
        let source = Arc::new(PartSource::new(
            self.api.clone(),
            job_id,
            file.size,
            plan.part_size,
            self.options.batch_size,
            init,
        ));
        tracker.set_total_parts_known(source.total_discovered().await);

        let _heartbeat = self.spawn_heartbeat(job_id, tracker.clone());

        handle.set_state(UploadState::Uploading);
        let started = Instant::now();
        let abort = handle.abort_flag();
        let uploader = Arc::new(
            PartUploader::new(
                self.api.clone(),
                self.store.clone(),
                job_id,
                file.clone(),
                tracker.clone(),
                abort.clone(),
                plan.per_part_timeout,
            )
            .with_retry(self.options.max_attempts, self.options.backoff_base),
        );

        let uploaded = Arc::new(AtomicU32::new(0));
        let first_error: Arc<Mutex<Option<UploadError>>> = Arc::new(Mutex::new(None));

        let workers: Vec<JoinHandle<()>> = (0..plan.max_concurrent_parts)
            .map(|_| {
                let source = source.clone();
                let uploader = uploader.clone();
                let tracker = tracker.clone();
                let abort = abort.clone();
                let uploaded = uploaded.clone();
                let first_error = first_error.clone();

                tokio::spawn(async move {
                    worker_loop(source, uploader, tracker, abort, uploaded, first_error).await
                })
            })
            .collect();

        for worker in workers {
            if let Err(e) = worker.await {
                record_error(
                    &first_error,
                    UploadError::Internal(format!("upload worker panicked: {}", e)),
                );
            }
        }

        if let Some(e) = first_error.lock().unwrap_or_else(|e| e.into_inner()).take() {
            return Err(e);
        }
        if abort.is_aborted() {
            return Err(UploadError::Aborted);
        }

        let total = source.total_discovered().await;
        let done = uploaded.load(Ordering::SeqCst);
        if done != total {
            return Err(UploadError::Internal(format!(
                "only {} of {} discovered parts confirmed before finalize",
                done, total
            )));
        }

        handle.set_state(UploadState::Finalizing);
        let response = self.api.finalize(job_id).await?;
        if !response.success {
            return Err(UploadError::Incomplete {
                completed: response.completed_parts.unwrap_or(u64::from(done)),
                total: response.total_parts.unwrap_or(u64::from(total)),
            });
        }

        let elapsed = started.elapsed().as_secs_f64();
        if file.size > 0 && elapsed >= 0.5 {
            self.speed.write((file.size as f64 / elapsed) as u64);
        }
        Ok(())
    }

    fn plan_for(&self, file_size: u64) -> PartPlan {
        let budget = Config
            .concurrency_budget()
            .unwrap_or(planner::GLOBAL_CONCURRENCY_BUDGET);
        let mut plan =
            planner::plan_with_budget(file_size, self.speed.read(), self.registry.in_flight(), budget);
        if let Some(part_size) = self.options.part_size {
            plan.num_parts = part_count(file_size, part_size);
            plan.part_size = part_size;
        }
        if let Some(concurrency) = self.options.max_concurrent_parts {
            plan.max_concurrent_parts = concurrency.max(1);
        }
        plan
    }

    fn spawn_heartbeat(&self, job_id: &str, tracker: Arc<ProgressTracker>) -> TaskGuard {
        let guard = self.guard.clone();
        let job_id = job_id.to_string();
        TaskGuard(tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                guard.heartbeat(&job_id, Some(tracker.snapshot()));
            }
        }))
    }

    async fn notify_abort(&self, job_id: &str) {
        if let Err(e) = self.api.abort(job_id).await {
            warn!("best-effort abort notification for job {} failed: {}", job_id, e);
        }
    }
}

async fn worker_loop(
    source: Arc<PartSource>,
    uploader: Arc<PartUploader>,
    tracker: Arc<ProgressTracker>,
    abort: AbortFlag,
    uploaded: Arc<AtomicU32>,
    first_error: Arc<Mutex<Option<UploadError>>>,
) {
    loop {
        if abort.is_aborted() {
            return;
        }

        let next = tokio::select! {
            _ = abort.cancelled() => return,
            next = source.next_part() => next,
        };

        match next {
            Ok(Some(mut part)) => {
                tracker.set_total_parts_known(source.total_discovered().await);
                if let Err(e) = uploader.upload_part(&mut part).await {
                    // A part out of retries fails the whole task; siblings
                    // observe the flag and drain.
                    if !e.is_aborted() {
                        record_error(&first_error, e);
                    }
                    abort.trigger();
                    return;
                }
                uploaded.fetch_add(1, Ordering::SeqCst);
            }
            Ok(None) => return,
            Err(e) => {
                record_error(&first_error, e);
                abort.trigger();
                return;
            }
        }
    }
}

fn record_error(slot: &Mutex<Option<UploadError>>, error: UploadError) {
    let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
    if slot.is_none() {
        *slot = Some(error);
    }
}
