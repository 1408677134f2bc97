use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{ApiError, SessionKeys};

/// Header carrying the session credential on every backend call.
///
pub const SESSION_KEY_HEADER: &str = "X-Session-Key";

/// Request body for `POST /jobs/{jobId}/multipart/initiate`.
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateRequest {
    /// Total size of the file being uploaded, in bytes.
    pub file_size: u64,

    /// Planned size of each part except possibly the last, in bytes.
    pub part_size: u64,

    /// How many presigned URLs to return in the initiate response itself.
    pub initial_batch_size: u32,
}

/// One presigned part URL as issued by the backend.
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedPart {
    /// 1-based part number.
    pub part_number: u32,

    /// Presigned URL accepting a raw PUT of this part's bytes.
    pub url: String,
}

/// Response body of the initiate call.
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateResponse {
    /// Opaque identifier of the multipart upload on the backend.
    pub upload_id: String,

    /// The first batch of presigned URLs.
    pub parts: Vec<PresignedPart>,

    /// Whether further batches remain to be fetched.
    pub has_more_parts: bool,

    /// The part number the next `get-parts` call should start from.
    pub next_part_number: u32,
}

/// Request body for `POST /jobs/{jobId}/multipart/get-parts`.
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPartsRequest {
    /// First part number to issue URLs for.
    pub start_part: u32,

    /// Maximum number of URLs to issue.
    pub batch_size: u32,
}

/// A batch of presigned URLs returned by `get-parts`.
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartBatch {
    /// Presigned URLs, in ascending part-number order.
    pub parts: Vec<PresignedPart>,

    /// Whether further batches remain to be fetched.
    pub has_more_parts: bool,

    /// The part number the next `get-parts` call should start from.
    pub next_part_number: u32,
}

/// Request body for `POST /jobs/{jobId}/multipart/complete-part`.
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePartRequest {
    /// 1-based part number.
    pub part_number: u32,

    /// ETag returned by object storage for this part's PUT.
    pub etag: String,
}

/// Response body of `complete-part`.
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePartResponse {
    /// Whether the backend recorded the part.
    pub success: bool,
}

/// Response body of `finalize`.
///
/// When the backend has fewer confirmed parts than it expects, `success` is
/// false and the counts say how far the upload actually got.
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeResponse {
    /// Whether the multipart upload was assembled successfully.
    #[serde(default)]
    pub success: bool,

    /// Parts the backend had confirmation for.
    #[serde(default)]
    pub completed_parts: Option<u64>,

    /// Parts the backend expected.
    #[serde(default)]
    pub total_parts: Option<u64>,
}

/// The multipart-upload REST surface of the conversion backend.
///
/// Implementations must not retry internally: the caller owns the retry
/// policy and needs authorization failures surfaced untouched.
///
#[async_trait]
pub trait MultipartApi: Send + Sync {
    /// Start a multipart upload and obtain the first URL batch.
    ///
    async fn initiate(
        &self,
        job_id: &str,
        request: &InitiateRequest,
    ) -> Result<InitiateResponse, ApiError>;

    /// Fetch a further batch of presigned URLs.
    ///
    async fn get_parts(&self, job_id: &str, request: &GetPartsRequest)
        -> Result<PartBatch, ApiError>;

    /// Confirm receipt of one uploaded part.
    ///
    async fn complete_part(
        &self,
        job_id: &str,
        request: &CompletePartRequest,
    ) -> Result<CompletePartResponse, ApiError>;

    /// Assemble the uploaded parts into the final object.
    ///
    async fn finalize(&self, job_id: &str) -> Result<FinalizeResponse, ApiError>;

    /// Cancel the multipart upload, releasing backend resources.
    ///
    async fn abort(&self, job_id: &str) -> Result<(), ApiError>;

    /// Best-effort connection pre-warm; failures carry no meaning.
    ///
    async fn prewarm(&self) -> Result<(), ApiError>;
}

/// `MultipartApi` over HTTP, the production implementation.
///
pub struct HttpMultipartApi {
    client: reqwest::Client,
    base_url: Url,
    keys: Arc<dyn SessionKeys>,
}

impl HttpMultipartApi {
    /// Create a client for the backend at `base_url`.
    ///
    pub fn new(base_url: impl AsRef<str>, keys: Arc<dyn SessionKeys>) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url.as_ref())?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            keys,
        })
    }

    fn endpoint(&self, job_id: &str, operation: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(&format!("jobs/{}/multipart/{}", job_id, operation))
            .map_err(|e| ApiError::Malformed(format!("invalid endpoint URL: {}", e)))
    }

    async fn post<Req, Resp>(
        &self,
        job_id: &str,
        operation: &str,
        request: &Req,
    ) -> Result<Resp, ApiError>
    where
        Req: Serialize + Sync,
        Resp: for<'de> Deserialize<'de>,
    {
        let url = self.endpoint(job_id, operation)?;
        let key = self
            .keys
            .key()
            .await
            .map_err(|e| ApiError::Malformed(format!("no session credential: {}", e)))?;

        debug!("POST {} for job {}", operation, job_id);
        let response = self
            .client
            .post(url)
            .header(SESSION_KEY_HEADER, key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), body));
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| ApiError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl MultipartApi for HttpMultipartApi {
    async fn initiate(
        &self,
        job_id: &str,
        request: &InitiateRequest,
    ) -> Result<InitiateResponse, ApiError> {
        self.post(job_id, "initiate", request).await
    }

    async fn get_parts(
        &self,
        job_id: &str,
        request: &GetPartsRequest,
    ) -> Result<PartBatch, ApiError> {
        self.post(job_id, "get-parts", request).await
    }

    async fn complete_part(
        &self,
        job_id: &str,
        request: &CompletePartRequest,
    ) -> Result<CompletePartResponse, ApiError> {
        self.post(job_id, "complete-part", request).await
    }

    async fn finalize(&self, job_id: &str) -> Result<FinalizeResponse, ApiError> {
        self.post(job_id, "finalize", &serde_json::json!({})).await
    }

    async fn abort(&self, job_id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(job_id, "abort")?;
        let key = self
            .keys
            .key()
            .await
            .map_err(|e| ApiError::Malformed(format!("no session credential: {}", e)))?;

        let response = self
            .client
            .post(url)
            .header(SESSION_KEY_HEADER, key)
            .json(&serde_json::json!({}))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), body));
        }
        Ok(())
    }

    async fn prewarm(&self) -> Result<(), ApiError> {
        self.client
            .head(self.base_url.clone())
            .send()
            .await
            .map(|_| ())
            .map_err(ApiError::from)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_initiate_request_wire_shape() {
        let request = InitiateRequest {
            file_size: 12_000_000,
            part_size: 5_000_000,
            initial_batch_size: 20,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "file_size": 12_000_000,
                "part_size": 5_000_000,
                "initial_batch_size": 20,
            })
        );
    }

    #[test]
    fn test_initiate_response_wire_shape() {
        let body = serde_json::json!({
            "upload_id": "u-123",
            "parts": [
                { "part_number": 1, "url": "https://store/p1" },
                { "part_number": 2, "url": "https://store/p2" },
            ],
            "has_more_parts": true,
            "next_part_number": 3,
        });

        let response: InitiateResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.upload_id, "u-123");
        assert_eq!(response.parts.len(), 2);
        assert_eq!(response.parts[1].part_number, 2);
        assert!(response.has_more_parts);
        assert_eq!(response.next_part_number, 3);
    }

    #[test]
    fn test_finalize_response_failure_counts() {
        let body = serde_json::json!({
            "success": false,
            "completed_parts": 8,
            "total_parts": 10,
        });

        let response: FinalizeResponse = serde_json::from_value(body).unwrap();
        assert!(!response.success);
        assert_eq!(response.completed_parts, Some(8));
        assert_eq!(response.total_parts, Some(10));
    }

    #[test]
    fn test_finalize_response_success_without_counts() {
        let response: FinalizeResponse =
            serde_json::from_value(serde_json::json!({ "success": true })).unwrap();
        assert!(response.success);
        assert_eq!(response.completed_parts, None);
    }

    #[test]
    fn test_endpoint_paths() {
        let api = HttpMultipartApi::new(
            "https://api.example.com/",
            Arc::new(crate::StaticSessionKeys::new("k")),
        )
        .unwrap();

        let url = api.endpoint("job-7", "get-parts").unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/jobs/job-7/multipart/get-parts");
    }
}
