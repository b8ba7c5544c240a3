//! Conversion service client.
//!
//! The relay only needs three calls from the remote service: upload a chunk
//! and get a record id back, ask for the result of a record, and ask for its
//! raw status. [`ConversionClient`] is that contract; [`HttpConversionClient`]
//! implements it over the service's REST API:
//!
//! ```text
//! POST {base}/extract-async   multipart: file, output_type=markdown, model_type
//!   → { "success": true, "record_id": "…", "message": "…" }
//! GET  {base}/files/{id}
//!   → { "success": true, "processing_status": "completed", "content": "…",
//!       "pages_processed": 12, "processing_time": 3.4, "filename": "…" }
//! ```

use crate::config::RelayConfig;
use crate::error::RelayError;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Default model the service converts with.
pub const DEFAULT_MODEL_TYPE: &str = "nanonets";

/// Result of asking the service for a record's output.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Conversion finished; the Markdown content.
    Ready(String),
    /// Still being processed. `pages_processed` when the service reports it.
    Pending { pages_processed: Option<u32> },
    /// The service gave up on this record.
    Failed(String),
}

/// Raw status of a record, as shown by `--file-status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordStatus {
    pub record_id: String,
    pub success: bool,
    pub status: Option<String>,
    pub filename: Option<String>,
    pub pages_processed: Option<u32>,
    pub processing_time: Option<f64>,
    pub detail: Option<String>,
}

/// Submit chunks to, and collect results from, the conversion service.
#[async_trait]
pub trait ConversionClient: Send + Sync {
    /// Upload `chunk` and return the service's record id.
    ///
    /// # Errors
    /// [`RelayError::Submission`] or [`RelayError::RateLimited`], both
    /// transient.
    async fn submit(&self, chunk: &Path) -> Result<String, RelayError>;

    /// Ask once for the result of `record_id`. Never polls.
    async fn fetch(&self, record_id: &str) -> Result<FetchOutcome, RelayError>;

    /// Raw status of `record_id`, without touching local state.
    async fn status(&self, record_id: &str) -> Result<RecordStatus, RelayError>;
}

// ── HTTP implementation ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    success: bool,
    record_id: Option<serde_json::Value>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    #[serde(default)]
    success: bool,
    processing_status: Option<String>,
    status: Option<String>,
    content: Option<String>,
    pages_processed: Option<u32>,
    processing_time: Option<f64>,
    filename: Option<String>,
    detail: Option<String>,
}

impl FileResponse {
    fn state(&self) -> Option<&str> {
        self.processing_status.as_deref().or(self.status.as_deref())
    }
}

/// [`ConversionClient`] over the service's HTTP API.
pub struct HttpConversionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model_type: String,
}

impl std::fmt::Debug for HttpConversionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConversionClient")
            .field("base_url", &self.base_url)
            .field("model_type", &self.model_type)
            .finish_non_exhaustive()
    }
}

impl HttpConversionClient {
    /// Build a client from the relay configuration.
    ///
    /// # Errors
    /// [`RelayError::InvalidConfig`] when no API key is configured.
    pub fn from_config(config: &RelayConfig) -> Result<Self, RelayError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                RelayError::InvalidConfig(
                    "no API key: set PDF2MD_RELAY_API_KEY or pass --api-key".into(),
                )
            })?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| RelayError::Internal(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.api_base_url.clone(),
            api_key,
            model_type: DEFAULT_MODEL_TYPE.to_string(),
        })
    }

    /// Override the service model (default `nanonets`).
    pub fn with_model_type(mut self, model_type: impl Into<String>) -> Self {
        self.model_type = model_type.into();
        self
    }

    async fn get_file(&self, record_id: &str) -> Result<FileResponse, RelayError> {
        let url = format!("{}/files/{}", self.base_url, record_id);
        let fetch_err = |reason: String| RelayError::Fetch {
            record_id: record_id.to_string(),
            reason,
        };

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| fetch_err(e.to_string()))?;
        // Error responses still carry a JSON `detail` worth surfacing.
        let parsed: Result<FileResponse, _> = serde_json::from_str(&body);
        match parsed {
            Ok(file) if status.is_success() => Ok(file),
            Ok(file) => Err(fetch_err(format!(
                "HTTP {status}: {}",
                file.detail.unwrap_or_else(|| "no detail".into())
            ))),
            Err(e) if status.is_success() => Err(fetch_err(format!("malformed response: {e}"))),
            Err(_) => Err(fetch_err(format!("HTTP {status}: {}", truncate(&body, 200)))),
        }
    }
}

#[async_trait]
impl ConversionClient for HttpConversionClient {
    async fn submit(&self, chunk: &Path) -> Result<String, RelayError> {
        let chunk_name = chunk
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let submit_err = |reason: String| RelayError::Submission {
            chunk: chunk_name.clone(),
            reason,
        };

        let bytes = tokio::fs::read(chunk)
            .await
            .map_err(|e| RelayError::ReadFailed {
                path: chunk.to_path_buf(),
                source: e,
            })?;
        let part = Part::bytes(bytes)
            .file_name(chunk_name.clone())
            .mime_str("application/pdf")
            .map_err(|e| submit_err(e.to_string()))?;
        let form = Form::new()
            .part("file", part)
            .text("output_type", "markdown")
            .text("model_type", self.model_type.clone());

        let url = format!("{}/extract-async", self.base_url);
        debug!("POST {} ({})", url, chunk_name);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| submit_err(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            warn!("{}: rate limited (retry after {:?}s)", chunk_name, retry_after_secs);
            return Err(RelayError::RateLimited {
                chunk: chunk_name,
                retry_after_secs,
            });
        }

        let body = response.text().await.map_err(|e| submit_err(e.to_string()))?;
        if !status.is_success() {
            return Err(submit_err(format!("HTTP {status}: {}", truncate(&body, 200))));
        }

        let parsed: SubmitResponse =
            serde_json::from_str(&body).map_err(|e| submit_err(format!("malformed response: {e}")))?;
        if !parsed.success {
            return Err(submit_err(
                parsed.message.unwrap_or_else(|| "service reported failure".into()),
            ));
        }
        // Some deployments return the id as a number.
        match parsed.record_id {
            Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id),
            Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
            _ => Err(submit_err("response has no record_id".into())),
        }
    }

    async fn fetch(&self, record_id: &str) -> Result<FetchOutcome, RelayError> {
        let file = self.get_file(record_id).await?;
        if !file.success {
            return Err(RelayError::Fetch {
                record_id: record_id.to_string(),
                reason: file.detail.unwrap_or_else(|| "service reported failure".into()),
            });
        }

        match file.state() {
            Some("completed") => {
                let content = file.content.unwrap_or_default();
                if content.is_empty() {
                    warn!("Record {}: completed with empty content", record_id);
                }
                Ok(FetchOutcome::Ready(content))
            }
            Some("failed") => Ok(FetchOutcome::Failed(
                file.detail.unwrap_or_else(|| "processing failed".into()),
            )),
            Some("processing") | Some("pending") | Some("queued") | None => Ok(FetchOutcome::Pending {
                pages_processed: file.pages_processed,
            }),
            Some(other) => {
                warn!("Record {}: unknown status '{}', treating as pending", record_id, other);
                Ok(FetchOutcome::Pending {
                    pages_processed: file.pages_processed,
                })
            }
        }
    }

    async fn status(&self, record_id: &str) -> Result<RecordStatus, RelayError> {
        let file = self.get_file(record_id).await?;
        Ok(RecordStatus {
            record_id: record_id.to_string(),
            success: file.success,
            status: file.state().map(str::to_string),
            filename: file.filename,
            pages_processed: file.pages_processed,
            processing_time: file.processing_time,
            detail: file.detail,
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_response_prefers_processing_status() {
        let r: FileResponse = serde_json::from_str(
            r#"{"success":true,"processing_status":"completed","status":"queued","content":"x"}"#,
        )
        .unwrap();
        assert_eq!(r.state(), Some("completed"));

        let r: FileResponse =
            serde_json::from_str(r#"{"success":true,"status":"processing","pages_processed":3}"#).unwrap();
        assert_eq!(r.state(), Some("processing"));
        assert_eq!(r.pages_processed, Some(3));
    }

    #[test]
    fn submit_response_accepts_numeric_id() {
        let r: SubmitResponse =
            serde_json::from_str(r#"{"success":true,"record_id":12345}"#).unwrap();
        assert!(matches!(r.record_id, Some(serde_json::Value::Number(_))));
    }

    #[test]
    fn client_requires_api_key() {
        let cfg = RelayConfig::builder().build().unwrap();
        assert!(matches!(
            HttpConversionClient::from_config(&cfg),
            Err(RelayError::InvalidConfig(_))
        ));

        let cfg = RelayConfig::builder().api_key("k").build().unwrap();
        let client = HttpConversionClient::from_config(&cfg).unwrap();
        assert!(!format!("{client:?}").contains("\"k\""));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("привет", 3), "при");
        assert_eq!(truncate("ok", 10), "ok");
    }

    #[test]
    fn record_status_serialises() {
        let s = RecordStatus {
            record_id: "r1".into(),
            success: true,
            status: Some("processing".into()),
            pages_processed: Some(4),
            ..Default::default()
        };
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["status"], "processing");
        assert_eq!(json["pages_processed"], 4);
    }
}
