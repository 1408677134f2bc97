//!
//! # Test Utilities
//!
//! Shared fixtures for the upload workspace: random payload generation,
//! temp-file helpers, and an in-memory fake of the conversion backend and
//! object store with scriptable failures.
//!
#![warn(missing_docs)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use backend::{
    ApiError, ByteProgress, CompletePartRequest, CompletePartResponse, FinalizeResponse,
    GetPartsRequest, InitiateRequest, InitiateResponse, MultipartApi, PartBatch, PartStore,
    PresignedPart,
};
use bytes::Bytes;
use rand::Rng;
use tempfile::NamedTempFile;

/// Generate `len` random bytes.
///
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

/// Write `data` to a fresh temp file and return it (the file is deleted when
/// the handle drops).
///
pub fn temp_file_with(data: &[u8]) -> anyhow::Result<NamedTempFile> {
    use std::io::Write;
    let mut file = NamedTempFile::new()?;
    file.write_all(data)?;
    file.flush()?;
    Ok(file)
}

#[derive(Default)]
struct Script {
    initiate_status: Option<u16>,
    put_failures: HashMap<u32, u32>,
    missing_etag_parts: BTreeSet<u32>,
    completion_rejections: HashMap<u32, u32>,
    finalize_counts: Option<(u64, u64)>,
    put_delay: Duration,
    prewarm_delay: Duration,
}

#[derive(Default)]
struct Uploaded {
    parts: BTreeMap<u32, Vec<u8>>,
    completed: BTreeSet<u32>,
    total_parts: u32,
}

/// In-memory stand-in for both the conversion backend and object storage.
///
/// Presigned URLs are `fake://part/{n}`; `put_part` parses the part number
/// back out. Failures are scripted per part; every endpoint counts its
/// calls so tests can assert on exactly what traffic occurred.
///
#[derive(Default)]
pub struct FakeBackend {
    script: Mutex<Script>,
    uploaded: Mutex<Uploaded>,

    /// Calls observed on `initiate`.
    pub initiate_calls: AtomicUsize,

    /// Calls observed on `get-parts`.
    pub get_parts_calls: AtomicUsize,

    /// Calls observed on `complete-part`.
    pub complete_part_calls: AtomicUsize,

    /// Calls observed on `finalize`.
    pub finalize_calls: AtomicUsize,

    /// Calls observed on `abort`.
    pub abort_calls: AtomicUsize,

    puts_in_flight: AtomicUsize,

    /// High-water mark of simultaneously running `put_part` calls.
    pub max_concurrent_puts: AtomicUsize,
}

impl FakeBackend {
    /// A fake with nothing scripted: every call succeeds.
    ///
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `initiate` answer with the given HTTP status.
    ///
    pub fn reject_initiate(&self, status: u16) {
        self.script.lock().unwrap().initiate_status = Some(status);
    }

    /// Make the next `times` PUTs of `part_number` fail with a 500.
    ///
    pub fn fail_puts(&self, part_number: u32, times: u32) {
        self.script.lock().unwrap().put_failures.insert(part_number, times);
    }

    /// Make every PUT of `part_number` succeed without returning an ETag.
    ///
    pub fn drop_etag(&self, part_number: u32) {
        self.script.lock().unwrap().missing_etag_parts.insert(part_number);
    }

    /// Make the next `times` `complete-part` calls for `part_number` answer
    /// `success: false`.
    ///
    pub fn reject_completion(&self, part_number: u32, times: u32) {
        self.script
            .lock()
            .unwrap()
            .completion_rejections
            .insert(part_number, times);
    }

    /// Make `finalize` report failure with the given counts.
    ///
    pub fn force_finalize_counts(&self, completed: u64, total: u64) {
        self.script.lock().unwrap().finalize_counts = Some((completed, total));
    }

    /// Hold every PUT open for `delay`, forcing overlap between workers.
    ///
    pub fn set_put_delay(&self, delay: Duration) {
        self.script.lock().unwrap().put_delay = delay;
    }

    /// Hold the connection pre-warm open for `delay`.
    ///
    pub fn set_prewarm_delay(&self, delay: Duration) {
        self.script.lock().unwrap().prewarm_delay = delay;
    }

    /// The uploaded file as object storage would assemble it.
    ///
    pub fn assembled(&self) -> Vec<u8> {
        let uploaded = self.uploaded.lock().unwrap();
        uploaded.parts.values().flatten().copied().collect()
    }

    /// Part numbers the backend has confirmed.
    ///
    pub fn completed_parts(&self) -> Vec<u32> {
        self.uploaded.lock().unwrap().completed.iter().copied().collect()
    }

    fn batch(&self, start: u32, batch_size: u32) -> PartBatch {
        let total = self.uploaded.lock().unwrap().total_parts;
        let end = (start + batch_size - 1).min(total);
        let parts = (start..=end)
            .map(|part_number| PresignedPart {
                part_number,
                url: format!("fake://part/{}", part_number),
            })
            .collect();

        PartBatch {
            parts,
            has_more_parts: end < total,
            next_part_number: end + 1,
        }
    }
}

#[async_trait]
impl MultipartApi for FakeBackend {
    async fn initiate(
        &self,
        _job_id: &str,
        request: &InitiateRequest,
    ) -> Result<InitiateResponse, ApiError> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(status) = self.script.lock().unwrap().initiate_status {
            return Err(ApiError::from_status(status, "scripted rejection".to_string()));
        }

        let total = if request.file_size <= request.part_size {
            1
        } else {
            ((request.file_size + request.part_size - 1) / request.part_size) as u32
        };
        self.uploaded.lock().unwrap().total_parts = total;

        let batch = self.batch(1, request.initial_batch_size);
        Ok(InitiateResponse {
            upload_id: "fake-upload".to_string(),
            parts: batch.parts,
            has_more_parts: batch.has_more_parts,
            next_part_number: batch.next_part_number,
        })
    }

    async fn get_parts(
        &self,
        _job_id: &str,
        request: &GetPartsRequest,
    ) -> Result<PartBatch, ApiError> {
        self.get_parts_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.batch(request.start_part, request.batch_size))
    }

    async fn complete_part(
        &self,
        _job_id: &str,
        request: &CompletePartRequest,
    ) -> Result<CompletePartResponse, ApiError> {
        self.complete_part_calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut script = self.script.lock().unwrap();
            if let Some(remaining) = script.completion_rejections.get_mut(&request.part_number) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(CompletePartResponse { success: false });
                }
            }
        }

        self.uploaded
            .lock()
            .unwrap()
            .completed
            .insert(request.part_number);
        Ok(CompletePartResponse { success: true })
    }

    async fn finalize(&self, _job_id: &str) -> Result<FinalizeResponse, ApiError> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);

        if let Some((completed, total)) = self.script.lock().unwrap().finalize_counts {
            return Ok(FinalizeResponse {
                success: false,
                completed_parts: Some(completed),
                total_parts: Some(total),
            });
        }

        let uploaded = self.uploaded.lock().unwrap();
        let complete = uploaded.completed.len() as u64 == u64::from(uploaded.total_parts);
        Ok(FinalizeResponse {
            success: complete,
            completed_parts: Some(uploaded.completed.len() as u64),
            total_parts: Some(u64::from(uploaded.total_parts)),
        })
    }

    async fn abort(&self, _job_id: &str) -> Result<(), ApiError> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn prewarm(&self) -> Result<(), ApiError> {
        let delay = self.script.lock().unwrap().prewarm_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

/// Decrements the in-flight counter on every exit path of `put_part`.
///
struct InFlight<'a>(&'a FakeBackend);

impl<'a> InFlight<'a> {
    fn enter(fake: &'a FakeBackend) -> Self {
        let now = fake.puts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        fake.max_concurrent_puts.fetch_max(now, Ordering::SeqCst);
        Self(fake)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.puts_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PartStore for FakeBackend {
    async fn put_part(
        &self,
        url: &str,
        body: Bytes,
        on_progress: ByteProgress,
    ) -> Result<String, ApiError> {
        let part_number: u32 = url
            .strip_prefix("fake://part/")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| ApiError::Malformed(format!("unexpected fake URL {}", url)))?;

        let _in_flight = InFlight::enter(self);

        let delay = self.script.lock().unwrap().put_delay;
        if !delay.is_zero() {
            on_progress(body.len() as u64 / 2);
            tokio::time::sleep(delay).await;
        }

        {
            let mut script = self.script.lock().unwrap();
            if let Some(remaining) = script.put_failures.get_mut(&part_number) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ApiError::Status {
                        status: 500,
                        body: "scripted storage failure".to_string(),
                    });
                }
            }
            if script.missing_etag_parts.contains(&part_number) {
                return Err(ApiError::MissingEtag);
            }
        }

        on_progress(body.len() as u64);
        self.uploaded
            .lock()
            .unwrap()
            .parts
            .insert(part_number, body.to_vec());
        Ok(format!("etag-{}", part_number))
    }
}
