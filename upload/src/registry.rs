use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::error::UploadError;
use crate::file::FileIdentity;

/// Lifecycle states of one upload task.
///
/// `Aborting`/`Aborted` are reachable from any non-terminal state; `Failed`
/// from `Initiating`, `Uploading` and `Finalizing`.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Created, nothing sent yet.
    Init,
    /// Waiting for the initiate call and first URL batch.
    Initiating,
    /// Parts in flight.
    Uploading,
    /// All parts confirmed, finalize call in flight.
    Finalizing,
    /// Terminal success.
    Complete,
    /// Abort requested, cleanup running.
    Aborting,
    /// Terminal cancelled.
    Aborted,
    /// Terminal failure.
    Failed,
}

/// Cooperative cancellation flag shared by everything belonging to one
/// upload task.
///
/// Checked at loop boundaries and raced against in-flight network operations
/// so bytes stop moving promptly after an abort.
///
#[derive(Debug, Clone)]
pub struct AbortFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortFlag {
    /// A fresh, untriggered flag.
    ///
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. Idempotent.
    ///
    pub fn trigger(&self) {
        // send() discards the value when no receiver exists; the flag must
        // stick even if nothing is parked in cancelled() right now.
        self.tx.send_replace(true);
    }

    /// Whether cancellation has been requested.
    ///
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once cancellation is requested.
    ///
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|aborted| *aborted).await;
    }
}

/// A live upload task as seen from outside: its state and its abort flag.
///
#[derive(Debug)]
pub struct UploadHandle {
    /// Job id this upload belongs to.
    pub job_id: String,

    identity: FileIdentity,
    abort: AbortFlag,
    state: watch::Sender<UploadState>,
}

impl UploadHandle {
    fn new(job_id: String, identity: FileIdentity) -> Self {
        let (state, _) = watch::channel(UploadState::Init);
        Self {
            job_id,
            identity,
            abort: AbortFlag::new(),
            state,
        }
    }

    /// The task's current lifecycle state.
    ///
    pub fn state(&self) -> UploadState {
        *self.state.borrow()
    }

    /// The task's shared cancellation flag.
    ///
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    pub(crate) fn set_state(&self, state: UploadState) {
        self.state.send_replace(state);
    }
}

/// Process-wide registry of in-flight uploads, keyed by job id.
///
/// Explicitly owned and injected rather than ambient module state, so tests
/// get isolated registries and teardown is just dropping it. Provides
/// duplicate detection (same job id or same logical file) and external
/// cancellation.
///
#[derive(Default)]
pub struct UploadRegistry {
    inner: Mutex<HashMap<String, Arc<UploadHandle>>>,
}

impl UploadRegistry {
    /// An empty registry.
    ///
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new upload, rejecting duplicates before any network
    /// activity can begin.
    ///
    pub fn register(
        &self,
        job_id: &str,
        identity: FileIdentity,
    ) -> Result<Arc<UploadHandle>, UploadError> {
        let mut inner = self.lock();

        let duplicate = inner.contains_key(job_id)
            || inner.values().any(|handle| handle.identity == identity);
        if duplicate {
            return Err(UploadError::DuplicateUpload {
                job_id: job_id.to_string(),
            });
        }

        let handle = Arc::new(UploadHandle::new(job_id.to_string(), identity));
        inner.insert(job_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Remove a settled upload. Safe to call for unknown job ids.
    ///
    pub fn release(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    /// Look up a running upload.
    ///
    pub fn get(&self, job_id: &str) -> Option<Arc<UploadHandle>> {
        self.lock().get(job_id).cloned()
    }

    /// Request cancellation of a running upload from anywhere in the
    /// process. Returns whether the job was found.
    ///
    pub fn abort(&self, job_id: &str) -> bool {
        match self.get(job_id) {
            Some(handle) => {
                handle.set_state(UploadState::Aborting);
                handle.abort_flag().trigger();
                true
            }
            None => false,
        }
    }

    /// How many uploads are currently in flight.
    ///
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<UploadHandle>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, size: u64) -> FileIdentity {
        FileIdentity {
            name: name.to_string(),
            size,
            modified: None,
        }
    }

    #[test]
    fn test_duplicate_job_id_rejected() {
        let registry = UploadRegistry::new();
        registry.register("job-1", identity("a.cbz", 10)).unwrap();

        let err = registry.register("job-1", identity("b.cbz", 20)).unwrap_err();
        assert!(matches!(err, UploadError::DuplicateUpload { .. }));
    }

    #[test]
    fn test_duplicate_file_identity_rejected() {
        let registry = UploadRegistry::new();
        registry.register("job-1", identity("a.cbz", 10)).unwrap();

        let err = registry.register("job-2", identity("a.cbz", 10)).unwrap_err();
        assert!(matches!(err, UploadError::DuplicateUpload { .. }));
    }

    #[test]
    fn test_release_allows_reregistration() {
        let registry = UploadRegistry::new();
        registry.register("job-1", identity("a.cbz", 10)).unwrap();
        registry.release("job-1");

        assert!(registry.register("job-1", identity("a.cbz", 10)).is_ok());
        assert_eq!(registry.in_flight(), 1);
    }

    #[test]
    fn test_abort_triggers_flag() {
        let registry = UploadRegistry::new();
        let handle = registry.register("job-1", identity("a.cbz", 10)).unwrap();

        assert!(!handle.abort_flag().is_aborted());
        assert!(registry.abort("job-1"));
        assert!(handle.abort_flag().is_aborted());
        assert_eq!(handle.state(), UploadState::Aborting);

        assert!(!registry.abort("missing"));
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_trigger() {
        let flag = AbortFlag::new();
        let waiter = flag.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        flag.trigger();
        task.await.unwrap();
        assert!(flag.is_aborted());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_when_already_triggered() {
        let flag = AbortFlag::new();
        flag.trigger();
        flag.cancelled().await;
    }

    #[test]
    fn test_trigger_sticks_without_waiters() {
        // No task is subscribed when the flag flips; it must still read as
        // aborted afterwards.
        let flag = AbortFlag::new();
        assert!(!flag.is_aborted());
        flag.trigger();
        assert!(flag.is_aborted());
    }

    #[test]
    fn test_state_transitions_visible_through_handle() {
        let registry = UploadRegistry::new();
        let handle = registry.register("job-1", identity("a.cbz", 10)).unwrap();

        assert_eq!(handle.state(), UploadState::Init);
        handle.set_state(UploadState::Uploading);
        assert_eq!(handle.state(), UploadState::Uploading);
        handle.set_state(UploadState::Complete);
        assert_eq!(handle.state(), UploadState::Complete);
    }
}
