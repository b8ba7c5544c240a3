//! Configuration types for chunked, resumable conversion.
//!
//! All behaviour is controlled through [`RelayConfig`], built via its
//! [`RelayConfigBuilder`]. The service limits live in their own [`Limits`]
//! struct because the planner is a pure function of them and nothing else.

use crate::error::RelayError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Hard and target limits of the remote conversion service.
///
/// The `*_target` values are what the planner aims for; the `*_limit` values
/// are what the service rejects above. Targets leave headroom below limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum accepted upload size in bytes. Default: 50 MiB.
    pub size_limit_bytes: u64,
    /// Size the planner aims for when splitting by size. Default: 40 MiB.
    pub size_target_bytes: u64,
    /// Maximum accepted page count. Default: 200.
    pub page_limit: u32,
    /// Width of page-driven chunks. Default: 190.
    pub page_target: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            size_limit_bytes: 50 * MIB,
            size_target_bytes: 40 * MIB,
            page_limit: 200,
            page_target: 190,
        }
    }
}

impl Limits {
    /// Build limits from megabyte values, as the CLI takes them.
    ///
    /// # Errors
    /// [`RelayError::InvalidInput`] when a size does not fit in bytes.
    pub fn from_mib(size_limit_mib: u64, size_target_mib: u64, page_limit: u32, page_target: u32) -> Result<Self, RelayError> {
        let bytes = |mib: u64| {
            mib.checked_mul(MIB)
                .ok_or_else(|| RelayError::InvalidInput(format!("{mib} MiB is too large")))
        };
        Ok(Self {
            size_limit_bytes: bytes(size_limit_mib)?,
            size_target_bytes: bytes(size_target_mib)?,
            page_limit,
            page_target,
        })
    }

    /// Reject zero limits and targets above their limit.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.size_limit_bytes == 0 || self.size_target_bytes == 0 {
            return Err(RelayError::InvalidInput(
                "size limit and size target must be positive".into(),
            ));
        }
        if self.page_limit == 0 || self.page_target == 0 {
            return Err(RelayError::InvalidInput(
                "page limit and page target must be positive".into(),
            ));
        }
        if self.size_target_bytes > self.size_limit_bytes {
            return Err(RelayError::InvalidInput(format!(
                "size target ({} B) exceeds size limit ({} B)",
                self.size_target_bytes, self.size_limit_bytes
            )));
        }
        if self.page_target > self.page_limit {
            return Err(RelayError::InvalidInput(format!(
                "page target ({}) exceeds page limit ({})",
                self.page_target, self.page_limit
            )));
        }
        Ok(())
    }
}

/// Configuration for the relay: limits, folders, service access, retries.
///
/// # Example
/// ```rust
/// use pdf2md_relay::RelayConfig;
///
/// let config = RelayConfig::builder()
///     .output_dir("out")
///     .page_limit(100)
///     .page_target(90)
///     .build()
///     .unwrap();
/// assert_eq!(config.limits.page_target, 90);
/// ```
#[derive(Clone)]
pub struct RelayConfig {
    /// Service limits driving the chunk planner.
    pub limits: Limits,

    /// Folder watched by the daemon for new documents. Default: `input`.
    pub input_dir: PathBuf,

    /// Folder holding chunks, markers and Markdown outputs. Default: `output`.
    pub output_dir: PathBuf,

    /// Where finished documents and their artifacts end up. Default: `output/done`.
    pub archive_dir: PathBuf,

    /// Instance lock file for daemon passes. Default: `<tmp>/pdf2md-relay.lock`.
    pub lock_path: PathBuf,

    /// Age after which an unrefreshed, still-held instance lock is reported
    /// as a possibly hung pass. Default: 2 h.
    ///
    /// A killed pass needs no timeout: the OS releases its lock on exit.
    pub stale_lock_after: Duration,

    /// Base URL of the conversion service.
    pub api_base_url: String,

    /// Bearer token for the conversion service.
    pub api_key: Option<String>,

    /// Per-request HTTP timeout in seconds. Default: 300.
    pub http_timeout_secs: u64,

    /// In-pass retries of a transient submission failure. Default: 2.
    ///
    /// Anything still failing after these is left for the next pass.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 1000.
    pub retry_backoff_ms: u64,

    /// Optional per-chunk progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let output_dir = PathBuf::from("output");
        Self {
            limits: Limits::default(),
            input_dir: PathBuf::from("input"),
            archive_dir: output_dir.join("done"),
            output_dir,
            lock_path: std::env::temp_dir().join("pdf2md-relay.lock"),
            stale_lock_after: Duration::from_secs(2 * 60 * 60),
            api_base_url: "https://extraction-api.nanonets.com".to_string(),
            api_key: None,
            http_timeout_secs: 300,
            max_retries: 2,
            retry_backoff_ms: 1000,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("limits", &self.limits)
            .field("input_dir", &self.input_dir)
            .field("output_dir", &self.output_dir)
            .field("archive_dir", &self.archive_dir)
            .field("lock_path", &self.lock_path)
            .field("stale_lock_after", &self.stale_lock_after)
            .field("api_base_url", &self.api_base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn RelayProgressCallback>"),
            )
            .finish()
    }
}

impl RelayConfig {
    /// Create a new builder for `RelayConfig`.
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder {
            config: Self::default(),
            archive_set: false,
        }
    }
}

/// Builder for [`RelayConfig`].
#[derive(Debug)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
    archive_set: bool,
}

impl RelayConfigBuilder {
    pub fn limits(mut self, limits: Limits) -> Self {
        self.config.limits = limits;
        self
    }

    pub fn size_limit_bytes(mut self, bytes: u64) -> Self {
        self.config.limits.size_limit_bytes = bytes;
        self
    }

    pub fn size_target_bytes(mut self, bytes: u64) -> Self {
        self.config.limits.size_target_bytes = bytes;
        self
    }

    pub fn page_limit(mut self, pages: u32) -> Self {
        self.config.limits.page_limit = pages;
        self
    }

    pub fn page_target(mut self, pages: u32) -> Self {
        self.config.limits.page_target = pages;
        self
    }

    pub fn input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.input_dir = dir.into();
        self
    }

    /// Set the output folder. The archive follows it (`<output>/done`)
    /// unless [`Self::archive_dir`] is set explicitly.
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        if !self.archive_set {
            self.config.archive_dir = self.config.output_dir.join("done");
        }
        self
    }

    pub fn archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.archive_dir = dir.into();
        self.archive_set = true;
        self
    }

    pub fn lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.lock_path = path.into();
        self
    }

    pub fn stale_lock_after(mut self, age: Duration) -> Self {
        self.config.stale_lock_after = age;
        self
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn http_timeout_secs(mut self, secs: u64) -> Self {
        self.config.http_timeout_secs = secs.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<RelayConfig, RelayError> {
        let c = &self.config;
        c.limits
            .validate()
            .map_err(|e| RelayError::InvalidConfig(e.to_string()))?;
        if c.api_base_url.is_empty() {
            return Err(RelayError::InvalidConfig("API base URL must not be empty".into()));
        }
        if c.input_dir == c.output_dir {
            return Err(RelayError::InvalidConfig(
                "input and output folders must differ".into(),
            ));
        }
        Ok(self.config)
    }
}
