use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::UploadError;
use crate::progress::UploadProgress;

/// How often a running upload refreshes its marker.
///
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Markers older than this are treated as abandoned and silently overridden.
///
pub const STALENESS_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Persisted record of an upload session holding a job id.
///
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMarker {
    /// Opaque id of the execution context that owns the marker.
    pub session_id: String,

    /// Job the marker is scoped to.
    pub job_id: String,

    /// Unix millis of creation or last heartbeat.
    pub timestamp: u64,

    /// Latest progress snapshot, so a competing context can report how far
    /// the active session has gotten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<UploadProgress>,
}

/// Persistence for session markers, keyed by job id.
///
/// The filesystem implementation mirrors the browser client's
/// localStorage keys (`multipart_upload_{jobId}`).
///
pub trait MarkerStore: Send + Sync {
    /// Load the marker for a job, if any.
    fn load(&self, job_id: &str) -> anyhow::Result<Option<SessionMarker>>;

    /// Create or replace a marker.
    fn save(&self, marker: &SessionMarker) -> anyhow::Result<()>;

    /// Remove a marker. Removing a missing marker is not an error.
    fn remove(&self, job_id: &str) -> anyhow::Result<()>;
}

/// `MarkerStore` on the local filesystem, one JSON file per job.
///
#[derive(Debug, Clone)]
pub struct FsMarkerStore {
    dir: PathBuf,
}

impl FsMarkerStore {
    /// A store rooted at `dir`; the directory is created on first save.
    ///
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("multipart_upload_{}.json", job_id))
    }
}

impl MarkerStore for FsMarkerStore {
    fn load(&self, job_id: &str) -> anyhow::Result<Option<SessionMarker>> {
        match std::fs::read(self.path(job_id)) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, marker: &SessionMarker) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let data = serde_json::to_vec(marker)?;
        std::fs::write(self.path(&marker.job_id), data)?;
        Ok(())
    }

    fn remove(&self, job_id: &str) -> anyhow::Result<()> {
        match std::fs::remove_file(self.path(job_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Cross-context mutual exclusion for upload attempts on one job id.
///
/// A marker younger than [`STALENESS_WINDOW`] blocks a new attempt; an older
/// one is assumed abandoned (crashed tab, suspended laptop) and overridden.
/// Heartbeats keep a genuinely active session from ever looking stale.
///
#[derive(Clone)]
pub struct SessionGuard {
    store: Arc<dyn MarkerStore>,
    session_id: String,
}

impl SessionGuard {
    /// A guard with a fresh session id over the given store.
    ///
    pub fn new(store: Arc<dyn MarkerStore>) -> Self {
        Self {
            store,
            session_id: Uuid::new_v4().to_string(),
        }
    }

    /// Claim the job id, failing with [`UploadError::SessionBusy`] if another
    /// live session holds it.
    ///
    pub fn try_acquire(&self, job_id: &str) -> Result<(), UploadError> {
        match self.store.load(job_id) {
            Ok(Some(marker)) if marker.session_id != self.session_id => {
                let age = marker_age(&marker);
                if age < STALENESS_WINDOW {
                    return Err(UploadError::SessionBusy { age });
                }
                info!(
                    "overriding stale upload session for job {} ({}s old)",
                    job_id,
                    age.as_secs()
                );
            }
            Ok(_) => {}
            Err(e) => {
                // An unreadable marker must not permanently block the job.
                warn!("could not read session marker for job {}: {}", job_id, e);
            }
        }

        self.write_marker(job_id, None)
            .map_err(|e| UploadError::Internal(format!("could not persist session marker: {}", e)))
    }

    /// Refresh the marker's timestamp and progress snapshot.
    ///
    pub fn heartbeat(&self, job_id: &str, progress: Option<UploadProgress>) {
        if let Err(e) = self.write_marker(job_id, progress) {
            debug!("session heartbeat for job {} failed: {}", job_id, e);
        }
    }

    /// Drop the marker. Called on success and failure alike so a retry of
    /// the same job is never blocked by its own leftovers.
    ///
    pub fn release(&self, job_id: &str) {
        if let Err(e) = self.store.remove(job_id) {
            warn!("could not remove session marker for job {}: {}", job_id, e);
        }
    }

    fn write_marker(&self, job_id: &str, progress: Option<UploadProgress>) -> anyhow::Result<()> {
        self.store.save(&SessionMarker {
            session_id: self.session_id.clone(),
            job_id: job_id.to_string(),
            timestamp: now_millis(),
            progress,
        })
    }
}

fn marker_age(marker: &SessionMarker) -> Duration {
    Duration::from_millis(now_millis().saturating_sub(marker.timestamp))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_guard(dir: &Path) -> SessionGuard {
        SessionGuard::new(Arc::new(FsMarkerStore::new(dir)))
    }

    #[test]
    fn test_acquire_then_competing_acquire_busy() {
        let dir = tempfile::tempdir().unwrap();
        let first = fs_guard(dir.path());
        let second = fs_guard(dir.path());

        first.try_acquire("job-1").unwrap();

        let err = second.try_acquire("job-1").unwrap_err();
        match err {
            UploadError::SessionBusy { age } => assert!(age < STALENESS_WINDOW),
            other => panic!("expected SessionBusy, got {}", other),
        }
    }

    #[test]
    fn test_reacquire_own_session_ok() {
        let dir = tempfile::tempdir().unwrap();
        let guard = fs_guard(dir.path());

        guard.try_acquire("job-1").unwrap();
        guard.try_acquire("job-1").unwrap();
    }

    #[test]
    fn test_stale_marker_overridden() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsMarkerStore::new(dir.path()));

        store
            .save(&SessionMarker {
                session_id: "dead-session".to_string(),
                job_id: "job-1".to_string(),
                timestamp: now_millis() - STALENESS_WINDOW.as_millis() as u64 - 1000,
                progress: None,
            })
            .unwrap();

        let guard = SessionGuard::new(store.clone());
        guard.try_acquire("job-1").unwrap();

        let marker = store.load("job-1").unwrap().unwrap();
        assert_ne!(marker.session_id, "dead-session");
    }

    #[test]
    fn test_release_unblocks_other_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let first = fs_guard(dir.path());
        let second = fs_guard(dir.path());

        first.try_acquire("job-1").unwrap();
        first.release("job-1");

        second.try_acquire("job-1").unwrap();
    }

    #[test]
    fn test_heartbeat_refreshes_timestamp_and_progress() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsMarkerStore::new(dir.path()));
        let guard = SessionGuard::new(store.clone());

        guard.try_acquire("job-1").unwrap();
        let before = store.load("job-1").unwrap().unwrap();

        let progress = UploadProgress {
            completed_parts: 1,
            total_parts_known: 3,
            uploaded_bytes: 100,
            total_bytes: 300,
            percentage: 33.3,
        };
        guard.heartbeat("job-1", Some(progress));

        let after = store.load("job-1").unwrap().unwrap();
        assert!(after.timestamp >= before.timestamp);
        assert_eq!(after.progress.unwrap().completed_parts, 1);
    }

    #[test]
    fn test_remove_missing_marker_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMarkerStore::new(dir.path());
        store.remove("never-existed").unwrap();
    }
}
