//! Per-chunk job state, kept entirely in the output folder.
//!
//! | On disk                          | Meaning                              |
//! |----------------------------------|--------------------------------------|
//! | no marker, no output             | not submitted                        |
//! | `<chunk>.pdf.lock`               | submitted, result not yet stored     |
//! | `<chunk>.md`, no marker          | retrieved                            |
//! | `<chunk>.md` and marker          | retrieved; crashed before the delete |
//!
//! The last row counts as retrieved and heals itself: retrieval is
//! idempotent and simply fetches and overwrites again before removing the
//! marker.

use crate::client::{ConversionClient, FetchOutcome};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::naming::{ChunkName, MARKER_SUFFIX, OUTPUT_EXT};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::workspace::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Longest wait between two submission attempts inside a pass, whether
/// from backoff or from the server's Retry-After.
const MAX_RETRY_WAIT: Duration = Duration::from_secs(60);

/// Contents of a job marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMarker {
    pub record_id: String,
    pub chunk: String,
    /// Unix seconds. Absent in bare-id markers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<u64>,
}

impl JobMarker {
    /// Parse marker file contents. Accepts the JSON form and a bare record id.
    pub fn parse(contents: &str, chunk: &str) -> Option<Self> {
        let trimmed = contents.trim();
        if trimmed.starts_with('{') {
            let marker: JobMarker = serde_json::from_str(trimmed).ok()?;
            return (!marker.record_id.trim().is_empty()).then_some(marker);
        }
        if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
            return None;
        }
        Some(JobMarker {
            record_id: trimmed.to_string(),
            chunk: chunk.to_string(),
            submitted_at: None,
        })
    }
}

/// What a retrieval attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrieveOutcome {
    /// Output written and verified, marker removed.
    Retrieved { output: PathBuf, bytes: usize },
    /// The service is still working; marker untouched.
    Pending { pages_processed: Option<u32> },
    /// No marker: nothing to retrieve.
    NotSubmitted,
}

/// Answers "submitted?" and "retrieved?" for a chunk from the output folder
/// alone, and moves chunks between those states.
pub struct JobStateTracker {
    client: Arc<dyn ConversionClient>,
    output_dir: PathBuf,
    max_retries: u32,
    retry_backoff_ms: u64,
    progress: ProgressCallback,
}

impl JobStateTracker {
    pub fn new(client: Arc<dyn ConversionClient>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            output_dir: output_dir.into(),
            max_retries: 0,
            retry_backoff_ms: 0,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    pub fn from_config(client: Arc<dyn ConversionClient>, config: &RelayConfig) -> Self {
        let tracker = Self::new(client, &config.output_dir).with_retry(config.max_retries, config.retry_backoff_ms);
        match &config.progress_callback {
            Some(cb) => tracker.with_progress(cb.clone()),
            None => tracker,
        }
    }

    /// Retry transient submission failures `max_retries` times inside one
    /// call, waiting `backoff_ms * 2^attempt` between tries.
    pub fn with_retry(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn marker_path(&self, chunk: &str) -> PathBuf {
        self.output_dir.join(format!("{chunk}{MARKER_SUFFIX}"))
    }

    pub fn output_path(&self, chunk: &str) -> PathBuf {
        self.output_dir
            .join(Path::new(chunk).with_extension(OUTPUT_EXT))
    }

    /// Submitted and not yet retrieved: a marker and no output.
    ///
    /// A marker next to an output means retrieval stopped between writing
    /// and deleting; that chunk is retrieved, and [`Self::retrieve`] clears
    /// the leftover marker.
    pub fn has_pending(&self, chunk: &str) -> bool {
        self.marker_path(chunk).exists() && !self.output_path(chunk).exists()
    }

    /// Output stored, whether or not a leftover marker remains.
    pub fn is_retrieved(&self, chunk: &str) -> bool {
        self.output_path(chunk).exists()
    }

    /// Read the marker of `chunk`, if any.
    ///
    /// # Errors
    /// [`RelayError::MarkerCorrupt`] when the marker holds no usable id.
    pub async fn read_marker(&self, chunk: &str) -> Result<Option<JobMarker>, RelayError> {
        let path = self.marker_path(chunk);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RelayError::ReadFailed { path, source: e }),
        };
        JobMarker::parse(&contents, chunk)
            .map(Some)
            .ok_or_else(|| RelayError::MarkerCorrupt {
                path,
                detail: "no record id".to_string(),
            })
    }

    /// Upload `chunk_path` and record the returned id in a marker.
    ///
    /// The marker is written only after the service accepted the upload, so
    /// a marker always means a real submission. Callers must check
    /// [`Self::has_pending`] first; submitting twice creates two remote jobs.
    pub async fn submit(&self, chunk_path: &Path) -> Result<JobMarker, RelayError> {
        let chunk = chunk_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RelayError::InvalidInput(format!("not a file: {}", chunk_path.display())))?;

        let record_id = self.submit_with_retry(chunk_path, &chunk).await?;
        let marker = JobMarker {
            record_id,
            chunk: chunk.clone(),
            submitted_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|d| d.as_secs()),
        };
        let json = serde_json::to_vec(&marker).map_err(|e| RelayError::Internal(e.to_string()))?;
        write_atomic(&self.marker_path(&chunk), &json).await?;

        info!("{}: submitted, record {}", chunk, marker.record_id);
        self.progress.on_chunk_submitted(&chunk, &marker.record_id);
        Ok(marker)
    }

    async fn submit_with_retry(&self, chunk_path: &Path, chunk: &str) -> Result<String, RelayError> {
        let mut attempt = 0u32;
        loop {
            match self.client.submit(chunk_path).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let retry_after = match &e {
                        RelayError::RateLimited { retry_after_secs, .. } => *retry_after_secs,
                        _ => None,
                    };
                    let wait = retry_delay(self.retry_backoff_ms, attempt, retry_after);
                    attempt += 1;
                    warn!(
                        "{}: retry {}/{} after {}ms ({})",
                        chunk,
                        attempt,
                        self.max_retries,
                        wait.as_millis(),
                        e
                    );
                    sleep(wait).await;
                }
                Err(e) => {
                    self.progress.on_chunk_error(chunk, &e.to_string());
                    return Err(e);
                }
            }
        }
    }

    /// Fetch the result of a submitted chunk once.
    ///
    /// On success the output is written atomically, read back, and only then
    /// is the marker deleted. A pending record leaves everything untouched.
    ///
    /// # Errors
    /// [`RelayError::PermanentFailure`] when the service failed the record
    /// (marker kept for inspection); [`RelayError::Fetch`] on transport
    /// failures (marker kept, retried next pass).
    pub async fn retrieve(&self, chunk: &str) -> Result<RetrieveOutcome, RelayError> {
        let Some(marker) = self.read_marker(chunk).await? else {
            debug!("{}: no marker, nothing to retrieve", chunk);
            return Ok(RetrieveOutcome::NotSubmitted);
        };

        let outcome = match self.client.fetch(&marker.record_id).await {
            Ok(o) => o,
            Err(e) => {
                warn!("{} (record {}): fetch failed: {}", chunk, marker.record_id, e);
                self.progress.on_chunk_error(chunk, &e.to_string());
                return Err(e);
            }
        };

        match outcome {
            FetchOutcome::Ready(content) => {
                let output = self.output_path(chunk);
                write_atomic(&output, content.as_bytes()).await?;
                verify_written(&output, content.len()).await?;

                let marker_path = self.marker_path(chunk);
                tokio::fs::remove_file(&marker_path)
                    .await
                    .map_err(|e| RelayError::OutputWriteFailed {
                        path: marker_path,
                        source: e,
                    })?;

                info!(
                    "{} (record {}): retrieved {} bytes → {}",
                    chunk,
                    marker.record_id,
                    content.len(),
                    output.display()
                );
                self.progress.on_chunk_retrieved(chunk, content.len());
                Ok(RetrieveOutcome::Retrieved {
                    output,
                    bytes: content.len(),
                })
            }
            FetchOutcome::Pending { pages_processed } => {
                let total = ChunkName::parse(chunk).map(|c| c.page_count());
                match (pages_processed, total) {
                    (Some(done), Some(total)) => {
                        info!("{} (record {}): processing, page {}/{}", chunk, marker.record_id, done, total)
                    }
                    _ => info!("{} (record {}): processing", chunk, marker.record_id),
                }
                self.progress.on_chunk_pending(chunk, pages_processed);
                Ok(RetrieveOutcome::Pending { pages_processed })
            }
            FetchOutcome::Failed(detail) => {
                warn!(
                    "{} (record {}): failed remotely, marker kept for inspection: {}",
                    chunk, marker.record_id, detail
                );
                self.progress.on_chunk_error(chunk, &detail);
                Err(RelayError::PermanentFailure {
                    chunk: chunk.to_string(),
                    record_id: marker.record_id,
                    detail,
                })
            }
        }
    }
}

/// `backoff_ms * 2^attempt`, raised to Retry-After when the server sent one,
/// capped at [`MAX_RETRY_WAIT`].
fn retry_delay(backoff_ms: u64, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let backoff = Duration::from_millis(backoff_ms.saturating_mul(2u64.saturating_pow(attempt)));
    let wait = match retry_after_secs {
        Some(secs) => backoff.max(Duration::from_secs(secs)),
        None => backoff,
    };
    wait.min(MAX_RETRY_WAIT)
}

async fn verify_written(path: &Path, expected_len: usize) -> Result<(), RelayError> {
    let read_back = tokio::fs::read(path)
        .await
        .map_err(|e| RelayError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
    if read_back.len() != expected_len {
        return Err(RelayError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: std::io::Error::other(format!(
                "wrote {expected_len} bytes, read back {}",
                read_back.len()
            )),
        });
    }
    Ok(())
}
