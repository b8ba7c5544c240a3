//! Error types for the pdf2md-relay library.
//!
//! Two distinct error types reflect two distinct failure scopes:
//!
//! * [`RelayError`] — **Fatal for one operation**: the document cannot be
//!   probed, a submission was refused, a finalisation found a hole in the
//!   chunk set. Returned as `Err(RelayError)` from library entry points.
//!
//! * [`ChunkError`] — **Non-fatal**: a single chunk (or document) failed
//!   during a reconciliation pass but every other one is fine. Stored inside
//!   [`crate::output::DocumentReport`] so a pass always runs to completion
//!   and the failure stays visible in the report and the logs.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdf2md-relay library.
#[derive(Debug, Error)]
pub enum RelayError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Bad limits or arguments. Never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Source file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// The document exists but cannot be opened or is not a supported format.
    #[error("Document '{path}' is unreadable: {detail}")]
    UnreadableDocument { path: PathBuf, detail: String },

    /// The external pre-converter (ddjvu) is missing or failed.
    #[error("Cannot convert '{path}' to PDF: {detail}")]
    ConverterUnavailable { path: PathBuf, detail: String },

    // ── Conversion service errors ─────────────────────────────────────────
    /// The service refused or failed the upload. Transient.
    #[error("Submission of '{chunk}' failed: {reason}")]
    Submission { chunk: String, reason: String },

    /// The service returned HTTP 429. Transient.
    #[error("Rate limit exceeded while submitting '{chunk}'")]
    RateLimited {
        chunk: String,
        retry_after_secs: Option<u64>,
    },

    /// The service reports the record as failed. Needs a human.
    #[error("Record {record_id} for '{chunk}' failed remotely: {detail}")]
    PermanentFailure {
        chunk: String,
        record_id: String,
        detail: String,
    },

    /// A fetch or status call failed at the transport level.
    #[error("Fetching record {record_id} failed: {reason}")]
    Fetch { record_id: String, reason: String },

    // ── Finalisation errors ───────────────────────────────────────────────
    /// Concatenation attempted while part of `[1, total_pages]` is missing.
    #[error("Incomplete chunk set for '{document}': {detail}")]
    IncompleteSet { document: String, detail: String },

    /// Renumbering found markers that are neither fresh nor already shifted.
    #[error("Refusing to renumber '{chunk}': first page marker is {found}, expected 1 or {start}")]
    RenumberConflict {
        chunk: String,
        found: u32,
        start: u32,
    },

    // ── State errors ──────────────────────────────────────────────────────
    /// A job marker exists but holds no usable record id.
    #[error("Job marker '{path}' is corrupt: {detail}")]
    MarkerCorrupt { path: PathBuf, detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not read or list a file or directory.
    #[error("Failed to read '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// `true` for failures that should simply be retried on a later pass.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::Submission { .. } | RelayError::RateLimited { .. } | RelayError::Fetch { .. }
        )
    }
}

/// A non-fatal error for a single chunk or document inside a pass.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum ChunkError {
    /// Source could not be probed, converted, or split.
    #[error("{document}: unreadable: {detail}")]
    Unreadable { document: String, detail: String },

    /// Upload failed; the document stays in New and is retried next pass.
    #[error("{chunk}: submission failed: {detail}")]
    SubmitFailed { chunk: String, detail: String },

    /// Fetch failed at the transport level; the marker is kept.
    #[error("{chunk} (record {record_id}): fetch failed: {detail}")]
    FetchFailed {
        chunk: String,
        record_id: String,
        detail: String,
    },

    /// The service gave up on the record; the marker is kept for inspection.
    #[error("{chunk} (record {record_id}): failed remotely: {detail}")]
    RemoteFailed {
        chunk: String,
        record_id: String,
        detail: String,
    },

    /// Renumbering or concatenation failed.
    #[error("{document}: finalisation failed: {detail}")]
    FinalizeFailed { document: String, detail: String },

    /// Moving artifacts into the archive failed.
    #[error("{document}: archiving failed: {detail}")]
    ArchiveFailed { document: String, detail: String },
}
