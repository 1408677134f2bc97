use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;
use serde::{Deserialize, Serialize};

/// How long a stored measurement stays usable before the planner ignores it.
///
pub const SPEED_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

const SPEED_CACHE_FILE: &str = "upload_speed.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpeedRecord {
    upload_speed_bps: u64,
    upload_speed_ts: u64,
}

/// Persisted last-known upload bandwidth, used to seed the planner.
///
/// All I/O failures are swallowed: a missing or corrupt cache only costs one
/// upload's worth of adaptive sizing.
///
#[derive(Debug, Clone)]
pub struct SpeedCache {
    path: PathBuf,
}

impl SpeedCache {
    /// A cache stored under `dir`.
    ///
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(SPEED_CACHE_FILE),
        }
    }

    /// The stored measurement, if one exists and is fresher than
    /// [`SPEED_CACHE_TTL`].
    ///
    pub fn read(&self) -> Option<u64> {
        let data = std::fs::read(&self.path).ok()?;
        let record: SpeedRecord = serde_json::from_slice(&data).ok()?;
        let age = now_secs().checked_sub(record.upload_speed_ts)?;
        if age > SPEED_CACHE_TTL.as_secs() {
            debug!("ignoring stale speed cache ({}s old)", age);
            return None;
        }
        Some(record.upload_speed_bps)
    }

    /// Store a fresh measurement.
    ///
    pub fn write(&self, bps: u64) {
        let record = SpeedRecord {
            upload_speed_bps: bps,
            upload_speed_ts: now_secs(),
        };
        let result = std::fs::create_dir_all(self.path.parent().unwrap_or(Path::new(".")))
            .and_then(|_| {
                let data = serde_json::to_vec(&record)?;
                std::fs::write(&self.path, data)
            });
        if let Err(e) = result {
            debug!("failed to persist speed cache: {}", e);
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SpeedCache::new(dir.path());

        assert_eq!(cache.read(), None);
        cache.write(1_500_000);
        assert_eq!(cache.read(), Some(1_500_000));
    }

    #[test]
    fn test_stale_record_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SpeedCache::new(dir.path());

        let stale = SpeedRecord {
            upload_speed_bps: 1_000_000,
            upload_speed_ts: now_secs() - SPEED_CACHE_TTL.as_secs() - 10,
        };
        std::fs::write(&cache.path, serde_json::to_vec(&stale).unwrap()).unwrap();

        assert_eq!(cache.read(), None);
    }

    #[test]
    fn test_corrupt_record_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SpeedCache::new(dir.path());

        std::fs::write(&cache.path, b"not json").unwrap();
        assert_eq!(cache.read(), None);
    }
}
