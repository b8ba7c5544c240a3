//! Serialisable reports returned by the relay's entry points.
//!
//! Nothing here is persisted: the filesystem is the only state. Reports
//! exist so callers (the CLI, tests, a wrapping service) can see what a
//! call or a pass did without re-scanning the output folder.

use crate::error::ChunkError;
use crate::pipeline::plan::{PageRange, SplitStrategy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle position of a document, inferred from the files on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    /// Not started, or a submission wave was interrupted.
    New,
    /// At least one chunk has a marker.
    AwaitingRetrieval,
    /// No markers, every chunk has an output, no concatenation yet.
    ReadyToFinalize,
    /// Concatenated output exists and no markers remain.
    Done,
}

/// One chunk of a dry-run plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedChunk {
    pub file_name: String,
    pub range: PageRange,
}

/// What splitting a document would produce, without doing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlanReport {
    pub document: String,
    pub size_bytes: u64,
    pub page_count: u32,
    pub strategy: SplitStrategy,
    pub chunks: Vec<PlannedChunk>,
}

impl ChunkPlanReport {
    /// The document is within limits and goes up as a single chunk.
    pub fn is_trivial(&self) -> bool {
        self.chunks.len() == 1
    }
}

/// What happened to one document during a call or pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentReport {
    pub document: String,
    /// State inferred at the start of the pass.
    pub state: DocumentState,
    /// Chunks submitted by this call.
    #[serde(default)]
    pub submitted: Vec<String>,
    /// Chunks whose output was stored by this call.
    #[serde(default)]
    pub retrieved: Vec<String>,
    /// Chunks still being processed remotely.
    #[serde(default)]
    pub pending: Vec<String>,
    /// Chunks larger than the size limit after splitting.
    #[serde(default)]
    pub oversize: Vec<String>,
    /// Concatenated output written by this call.
    pub concatenated: Option<PathBuf>,
    pub archived: bool,
    /// Non-fatal failures; the pass carried on past each of them.
    #[serde(default)]
    pub errors: Vec<ChunkError>,
}

impl DocumentReport {
    pub fn new(document: impl Into<String>, state: DocumentState) -> Self {
        Self {
            document: document.into(),
            state,
            submitted: Vec::new(),
            retrieved: Vec::new(),
            pending: Vec::new(),
            oversize: Vec::new(),
            concatenated: None,
            archived: false,
            errors: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    /// `false` when another pass held the instance lock; nothing was done.
    pub lock_acquired: bool,
    pub documents: Vec<DocumentReport>,
}

impl PassReport {
    pub fn skipped() -> Self {
        Self {
            lock_acquired: false,
            documents: Vec::new(),
        }
    }

    pub fn error_count(&self) -> usize {
        self.documents.iter().map(|d| d.errors.len()).sum()
    }

    pub fn archived_count(&self) -> usize {
        self.documents.iter().filter(|d| d.archived).count()
    }
}

/// Tally of a single retrieval sweep, as printed after a one-shot run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalSummary {
    pub total: usize,
    pub retrieved: usize,
    pub pending: usize,
    pub failed: usize,
}

impl From<&DocumentReport> for RetrievalSummary {
    fn from(report: &DocumentReport) -> Self {
        let failed = report
            .errors
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    ChunkError::FetchFailed { .. } | ChunkError::RemoteFailed { .. } | ChunkError::SubmitFailed { .. }
                )
            })
            .count();
        Self {
            total: report.retrieved.len() + report.pending.len() + failed,
            retrieved: report.retrieved.len(),
            pending: report.pending.len(),
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_failures() {
        let mut r = DocumentReport::new("book", DocumentState::AwaitingRetrieval);
        r.retrieved.push("book_pages_1_190.pdf".into());
        r.pending.push("book_pages_191_380.pdf".into());
        r.errors.push(ChunkError::RemoteFailed {
            chunk: "book_pages_381_450.pdf".into(),
            record_id: "r3".into(),
            detail: "bad scan".into(),
        });
        r.errors.push(ChunkError::FinalizeFailed {
            document: "book".into(),
            detail: "not counted as a chunk".into(),
        });

        let s = RetrievalSummary::from(&r);
        assert_eq!(
            s,
            RetrievalSummary {
                total: 3,
                retrieved: 1,
                pending: 1,
                failed: 1
            }
        );
    }

    #[test]
    fn pass_report_serialises() {
        let mut pass = PassReport {
            lock_acquired: true,
            documents: vec![DocumentReport::new("a", DocumentState::Done)],
        };
        pass.documents[0].archived = true;
        let json = serde_json::to_value(&pass).unwrap();
        assert_eq!(json["documents"][0]["state"], "done");
        assert_eq!(pass.archived_count(), 1);
        assert_eq!(PassReport::skipped().error_count(), 0);
    }
}
