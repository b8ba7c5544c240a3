//! Document probing and page extraction.
//!
//! [`PdfEngine`] is the seam between the relay and whatever library actually
//! understands PDF. The relay only ever needs two things from it: how big is
//! this document, and "write pages N..M of it to that path". Both are
//! blocking; async callers go through `spawn_blocking`.

use crate::error::RelayError;
use crate::pipeline::plan::PageRange;
use lopdf::Document;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// What the planner needs to know about a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub page_count: u32,
}

/// Probe and split PDF documents.
pub trait PdfEngine: Send + Sync {
    /// Report size and page count.
    ///
    /// # Errors
    /// [`RelayError::FileNotFound`] or [`RelayError::UnreadableDocument`].
    fn probe(&self, path: &Path) -> Result<DocumentInfo, RelayError>;

    /// Write pages `range` of `source` to `dest`, page content unchanged.
    fn extract_pages(&self, source: &Path, range: PageRange, dest: &Path) -> Result<(), RelayError>;

    /// Extract several ranges of the same source. Engines that can reuse a
    /// parsed document across ranges should override this.
    fn extract_ranges(&self, source: &Path, jobs: &[(PageRange, PathBuf)]) -> Result<(), RelayError> {
        for (range, dest) in jobs {
            self.extract_pages(source, *range, dest)?;
        }
        Ok(())
    }
}

/// Pure-Rust engine backed by `lopdf`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfEngine;

impl LopdfEngine {
    fn load(path: &Path) -> Result<Document, RelayError> {
        if !path.exists() {
            return Err(RelayError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let doc = Document::load(path).map_err(|e| RelayError::UnreadableDocument {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        if doc.trailer.get(b"Encrypt").is_ok() {
            return Err(RelayError::UnreadableDocument {
                path: path.to_path_buf(),
                detail: "document is encrypted".to_string(),
            });
        }
        Ok(doc)
    }

    fn write_range(doc: &Document, source: &Path, range: PageRange, dest: &Path) -> Result<(), RelayError> {
        let total = doc.get_pages().len() as u32;
        if range.start == 0 || range.end < range.start || range.end > total {
            return Err(RelayError::InvalidInput(format!(
                "page range {range} is outside '{}' ({total} pages)",
                source.display()
            )));
        }

        let mut part = doc.clone();
        let drop: Vec<u32> = (1..=total)
            .filter(|p| *p < range.start || *p > range.end)
            .collect();
        if !drop.is_empty() {
            part.delete_pages(&drop);
            part.prune_objects();
        }

        // Never leave a half-written chunk under its final name: the daemon
        // treats an existing chunk file as done.
        let tmp = dest.with_extension("pdf.tmp");
        part.save(&tmp).map_err(|e| RelayError::OutputWriteFailed {
            path: dest.to_path_buf(),
            source: std::io::Error::other(e.to_string()),
        })?;
        std::fs::rename(&tmp, dest).map_err(|e| RelayError::OutputWriteFailed {
            path: dest.to_path_buf(),
            source: e,
        })?;

        debug!("Extracted pages {} of {} → {}", range, source.display(), dest.display());
        Ok(())
    }
}

impl PdfEngine for LopdfEngine {
    fn probe(&self, path: &Path) -> Result<DocumentInfo, RelayError> {
        let size_bytes = std::fs::metadata(path)
            .map_err(|_| RelayError::FileNotFound {
                path: path.to_path_buf(),
            })?
            .len();
        let doc = Self::load(path)?;
        let page_count = doc.get_pages().len() as u32;
        Ok(DocumentInfo {
            path: path.to_path_buf(),
            size_bytes,
            page_count,
        })
    }

    fn extract_pages(&self, source: &Path, range: PageRange, dest: &Path) -> Result<(), RelayError> {
        let doc = Self::load(source)?;
        Self::write_range(&doc, source, range, dest)
    }

    fn extract_ranges(&self, source: &Path, jobs: &[(PageRange, PathBuf)]) -> Result<(), RelayError> {
        if jobs.is_empty() {
            return Ok(());
        }
        let doc = Self::load(source)?;
        for (range, dest) in jobs {
            Self::write_range(&doc, source, *range, dest)?;
        }
        Ok(())
    }
}
