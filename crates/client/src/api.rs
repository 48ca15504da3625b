//! REST API client for the analysis service.
//!
//! Wraps submission, status, results, full-record retrieval, list
//! search and cancellation using [`reqwest`]. The [`AnalysisBackend`]
//! trait abstracts these calls so the poller and tracker session can be
//! driven by fakes in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sitetrack_core::job::{ErrorInfo, JobStatus, JobUpdate};
use sitetrack_core::request::AnalysisRequest;
use sitetrack_core::result::Attachment;
use sitetrack_core::types::Timestamp;

/// Default page size for list searches.
pub const DEFAULT_SEARCH_LIMIT: u32 = 50;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Response of `POST /analyze`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned canonical id.
    pub job_id: String,
    #[serde(default)]
    pub status: Option<JobStatus>,
}

/// Response of `GET /status/{job_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StatusReport {
    /// Translate the report into a tracker update.
    ///
    /// A `failed` report becomes a server-reported failure; a
    /// `completed` report always carries a result (JSON null if absent).
    pub fn to_job_update(&self) -> JobUpdate {
        match self.status {
            JobStatus::Failed => {
                let message = self
                    .error
                    .clone()
                    .or_else(|| self.message.clone())
                    .unwrap_or_else(|| "Analysis failed".to_string());
                JobUpdate::failed(ErrorInfo::server(message))
            }
            JobStatus::Completed => JobUpdate {
                message: self.message.clone(),
                ..JobUpdate::completed(self.result.clone().unwrap_or(serde_json::Value::Null))
            },
            status => JobUpdate {
                status: Some(status),
                progress: self.progress,
                message: self.message.clone(),
                ..Default::default()
            },
        }
    }
}

/// Response of `GET /results/{job_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultsResponse {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default, alias = "payload")]
    pub result: serde_json::Value,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Body of `POST /search`.
#[derive(Debug, Clone, Serialize)]
pub struct SearchQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            filter: None,
            limit: DEFAULT_SEARCH_LIMIT,
            offset: 0,
        }
    }
}

/// One canonical record returned by `POST /search`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListRecord {
    #[serde(alias = "job_id", alias = "analysis_id")]
    pub id: String,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

/// A page of list records.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchPage {
    pub items: Vec<ListRecord>,
    #[serde(default)]
    pub total: Option<u64>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, decoding).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service returned a non-2xx status code.
    #[error("Analysis API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

/// How a failed fetch should be treated by retrying callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailure {
    /// The job does not exist. Retrying is pointless.
    NotFound,
    /// Credentials were rejected. Retrying is pointless.
    Unauthorized,
    /// Anything else; may succeed on a later attempt.
    Transient,
}

impl ApiError {
    pub fn classify(&self) -> FetchFailure {
        match self {
            Self::Api { status: 404, .. } => FetchFailure::NotFound,
            Self::Api {
                status: 401 | 403, ..
            } => FetchFailure::Unauthorized,
            _ => FetchFailure::Transient,
        }
    }

    /// Whether this is a 404 from the service.
    pub fn is_not_found(&self) -> bool {
        self.classify() == FetchFailure::NotFound
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// The analysis service as seen by the tracker.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    async fn submit(&self, request: &AnalysisRequest) -> Result<SubmitResponse, ApiError>;
    async fn status(&self, job_id: &str) -> Result<StatusReport, ApiError>;
    async fn results(&self, job_id: &str) -> Result<ResultsResponse, ApiError>;
    async fn analysis(&self, analysis_id: &str) -> Result<serde_json::Value, ApiError>;
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, ApiError>;
    async fn cancel(&self, job_id: &str) -> Result<(), ApiError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// HTTP client for the analysis service.
pub struct AnalysisApi {
    client: reqwest::Client,
    api_url: String,
}

impl AnalysisApi {
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8000`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code, turning anything
    /// else into [`ApiError::Api`] with the body text attached.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<(), ApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl AnalysisBackend for AnalysisApi {
    /// `POST /analyze`.
    async fn submit(&self, request: &AnalysisRequest) -> Result<SubmitResponse, ApiError> {
        let response = self
            .client
            .post(format!("{}/analyze", self.api_url))
            .json(request)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `GET /status/{job_id}`.
    async fn status(&self, job_id: &str) -> Result<StatusReport, ApiError> {
        let response = self
            .client
            .get(format!("{}/status/{}", self.api_url, job_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `GET /results/{job_id}`: completed payload plus attachment descriptors.
    async fn results(&self, job_id: &str) -> Result<ResultsResponse, ApiError> {
        let response = self
            .client
            .get(format!("{}/results/{}", self.api_url, job_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `GET /analysis/{analysis_id}`: the full record, no status envelope.
    async fn analysis(&self, analysis_id: &str) -> Result<serde_json::Value, ApiError> {
        let response = self
            .client
            .get(format!("{}/analysis/{}", self.api_url, analysis_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `POST /search`.
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, ApiError> {
        let response = self
            .client
            .post(format!("{}/search", self.api_url))
            .json(query)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `DELETE /status/{job_id}`.
    async fn cancel(&self, job_id: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(format!("{}/status/{}", self.api_url, job_id))
            .send()
            .await?;

        Self::check_status(response).await
    }
}
