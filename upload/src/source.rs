use std::collections::VecDeque;
use std::sync::Arc;

use backend::{ApiError, GetPartsRequest, InitiateResponse, MultipartApi};
use log::debug;
use tokio::sync::{Mutex, Notify};

use crate::error::UploadError;
use crate::part::Part;

/// When the unconsumed queue drops to this many parts and more exist on the
/// backend, the next batch fetch starts in the background. High enough that
/// workers rarely run dry, low enough that URLs are not fetched long before
/// their limited validity window is needed.
///
pub const LOW_WATERMARK: usize = 5;

/// How many presigned URLs to request per batch.
///
pub const DEFAULT_BATCH_SIZE: u32 = 20;

/// Progressive source of presigned parts for one upload.
///
/// Seeded with the initiate response's first batch; refills itself from
/// `get-parts` in the background once consumption approaches the watermark,
/// so uploads already running are never interrupted by URL fetching. Workers
/// pull parts with [`PartSource::next_part`] and park when the queue is dry
/// but more parts are known to exist.
///
pub struct PartSource {
    api: Arc<dyn MultipartApi>,
    job_id: String,
    file_size: u64,
    part_size: u64,
    batch_size: u32,
    state: Mutex<SourceState>,
    notify: Notify,
}

struct SourceState {
    pending: VecDeque<Part>,
    next_part_number: u32,
    has_more: bool,
    fetch_in_flight: bool,
    discovered: u32,
    failed: bool,
    error: Option<ApiError>,
}

impl PartSource {
    /// Build a source seeded from the initiate response.
    ///
    pub fn new(
        api: Arc<dyn MultipartApi>,
        job_id: impl Into<String>,
        file_size: u64,
        part_size: u64,
        batch_size: u32,
        initial: InitiateResponse,
    ) -> Self {
        let mut pending = VecDeque::new();
        let mut error = None;
        for presigned in initial.parts {
            match Part::from_presigned(presigned, part_size, file_size) {
                Ok(part) => pending.push_back(part),
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }
        let discovered = pending.len() as u32;
        let failed = error.is_some();

        Self {
            api,
            job_id: job_id.into(),
            file_size,
            part_size,
            batch_size,
            state: Mutex::new(SourceState {
                pending,
                next_part_number: initial.next_part_number,
                has_more: initial.has_more_parts && !failed,
                fetch_in_flight: false,
                discovered,
                failed,
                error,
            }),
            notify: Notify::new(),
        }
    }

    /// Pull the next part to upload.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(part))` - A part ready for upload.
    /// * `Ok(None)` - Every part has been handed out; the upload can move to
    ///   finalize once outstanding parts confirm.
    /// * `Err(_)` - A background batch fetch failed; the task must abort.
    ///
    pub async fn next_part(self: &Arc<Self>) -> Result<Option<Part>, UploadError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;

                if state.failed {
                    return Err(match state.error.take() {
                        Some(e) => e.into(),
                        None => UploadError::Internal("presigned URL fetch failed".to_string()),
                    });
                }

                if let Some(part) = state.pending.pop_front() {
                    if state.pending.len() <= LOW_WATERMARK
                        && state.has_more
                        && !state.fetch_in_flight
                    {
                        self.spawn_fetch(&mut state);
                    }
                    return Ok(Some(part));
                }

                if !state.has_more && !state.fetch_in_flight {
                    return Ok(None);
                }

                if state.has_more && !state.fetch_in_flight {
                    self.spawn_fetch(&mut state);
                }
            }

            // Queue dry but more parts are coming; park until the fetch
            // lands.
            notified.await;
        }
    }

    /// How many parts have been discovered so far (grows as batches arrive).
    ///
    pub async fn total_discovered(&self) -> u32 {
        self.state.lock().await.discovered
    }

    fn spawn_fetch(self: &Arc<Self>, state: &mut SourceState) {
        state.fetch_in_flight = true;
        let this = self.clone();
        let request = GetPartsRequest {
            start_part: state.next_part_number,
            batch_size: this.batch_size,
        };

        tokio::spawn(async move {
            debug!(
                "fetching URL batch for job {} from part {}",
                this.job_id, request.start_part
            );
            let result = this.api.get_parts(&this.job_id, &request).await;

            let mut state = this.state.lock().await;
            state.fetch_in_flight = false;
            match result {
                Ok(batch) => {
                    for presigned in batch.parts {
                        match Part::from_presigned(presigned, this.part_size, this.file_size) {
                            Ok(part) => {
                                state.discovered += 1;
                                state.pending.push_back(part);
                            }
                            Err(e) => {
                                state.failed = true;
                                state.error = Some(e);
                                break;
                            }
                        }
                    }
                    if state.failed {
                        state.has_more = false;
                    } else {
                        state.has_more = batch.has_more_parts;
                        state.next_part_number = batch.next_part_number;
                    }
                }
                Err(e) => {
                    state.failed = true;
                    state.error = Some(e);
                    state.has_more = false;
                }
            }
            drop(state);
            this.notify.notify_waiters();
        });
    }
}
