use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, ETAG};
use reqwest::Body;

use crate::ApiError;

/// Callback invoked with the cumulative byte count sent so far for one
/// part-upload attempt.
///
pub type ByteProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// Size of the chunks fed into the request body stream. Small enough that
/// progress callbacks stay responsive, large enough not to dominate overhead.
///
const BODY_CHUNK_SIZE: usize = 64 * 1024;

/// Destination for raw part bytes: a presigned PUT to object storage.
///
#[async_trait]
pub trait PartStore: Send + Sync {
    /// Upload `body` to the presigned `url`, reporting progress as bytes are
    /// handed to the transport.
    ///
    /// # Returns
    ///
    /// * `Ok(etag)` - The ETag object storage assigned to the part.
    /// * `Err(ApiError::MissingEtag)` - The PUT succeeded but the response
    ///   carried no `ETag` header; the part cannot be finalized.
    /// * `Err(_)` - The PUT failed.
    ///
    async fn put_part(
        &self,
        url: &str,
        body: Bytes,
        on_progress: ByteProgress,
    ) -> Result<String, ApiError>;
}

/// `PartStore` over HTTP. Presigned URLs embed their own credentials, so no
/// auth headers are attached; any non-2xx from the store is treated as
/// transient and left to the caller's retry budget.
///
#[derive(Debug, Clone, Default)]
pub struct HttpPartStore {
    client: reqwest::Client,
}

impl HttpPartStore {
    /// Create a store sharing the given HTTP client's connection pool.
    ///
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PartStore for HttpPartStore {
    async fn put_part(
        &self,
        url: &str,
        body: Bytes,
        on_progress: ByteProgress,
    ) -> Result<String, ApiError> {
        let total = body.len();
        let stream = async_stream::stream! {
            let mut sent = 0usize;
            while sent < total {
                let end = (sent + BODY_CHUNK_SIZE).min(total);
                let chunk = body.slice(sent..end);
                sent = end;
                on_progress(sent as u64);
                yield Ok::<Bytes, std::io::Error>(chunk);
            }
        };

        let response = self
            .client
            .put(url)
            .header(CONTENT_LENGTH, total)
            .body(Body::wrap_stream(stream))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Presigned URLs carry their own auth; a 403 here usually means
            // an expired URL, not a bad session, so it stays retryable.
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .filter(|v| !v.is_empty());

        etag.ok_or(ApiError::MissingEtag)
    }
}
