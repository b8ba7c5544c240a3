//! Page renumbering and concatenation of chunk outputs.
//!
//! The service numbers pages of every chunk from 1. A chunk covering pages
//! `S..=E` therefore comes back with `## Page 1 … ## Page (E-S+1)`, and each
//! marker `n` has to become `S + n - 1` before the chunks can be joined.
//!
//! Renumbering rewrites the output in place, so it must be safe to run again
//! on an already shifted file. The first marker tells the two apart:
//!
//! | first marker | action                              |
//! |--------------|-------------------------------------|
//! | `S`          | already renumbered, left untouched  |
//! | `1`          | rewritten                           |
//! | other        | [`RelayError::RenumberConflict`]    |

use crate::error::RelayError;
use crate::naming::{self, ChunkName, OUTPUT_EXT};
use crate::pipeline::plan::{covers, PageRange};
use crate::workspace::write_atomic;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

static RE_PAGE_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^## Page (\d+)\b").unwrap());

/// Result of renumbering one chunk output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenumberOutcome {
    /// Markers were shifted by `start - 1`.
    Renumbered { markers: usize },
    /// First marker already equals the chunk's start page.
    AlreadyRenumbered,
    /// No page markers in the output; nothing to shift.
    NoMarkers,
}

/// A finished concatenation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatReport {
    pub path: PathBuf,
    pub total_pages: u32,
    pub chunks: usize,
}

fn page_numbers(content: &str) -> Vec<u32> {
    RE_PAGE_MARKER
        .captures_iter(content)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// Renumber the page markers of `content`, which belongs to `chunk`.
///
/// Returns the new content (unchanged unless the outcome is
/// [`RenumberOutcome::Renumbered`]).
pub fn renumber_content(content: &str, chunk: &ChunkName) -> Result<(String, RenumberOutcome), RelayError> {
    let numbers = page_numbers(content);
    let Some(&first) = numbers.first() else {
        return Ok((content.to_string(), RenumberOutcome::NoMarkers));
    };

    if numbers.len() as u32 != chunk.page_count() {
        warn!(
            "{}: {} page markers found, name says {} pages ({}-{})",
            chunk,
            numbers.len(),
            chunk.page_count(),
            chunk.start,
            chunk.end
        );
    }

    if first == chunk.start {
        return Ok((content.to_string(), RenumberOutcome::AlreadyRenumbered));
    }
    if first != 1 {
        return Err(RelayError::RenumberConflict {
            chunk: chunk.file_name(),
            found: first,
            start: chunk.start,
        });
    }

    let offset = chunk.start - 1;
    let rewritten = RE_PAGE_MARKER.replace_all(content, |caps: &Captures| {
        // `\d+` can exceed u32 only in garbage input; keep those verbatim.
        match caps[1].parse::<u32>() {
            Ok(n) => format!("## Page {}", n.saturating_add(offset)),
            Err(_) => caps[0].to_string(),
        }
    });

    let last = numbers.last().copied().unwrap_or(first).saturating_add(offset);
    if last != chunk.end {
        warn!("{}: last renumbered page is {}, expected {}", chunk, last, chunk.end);
    }
    Ok((
        rewritten.into_owned(),
        RenumberOutcome::Renumbered {
            markers: numbers.len(),
        },
    ))
}

/// Renumber one `<base>_pages_<S>_<E>.md` file in place.
pub async fn renumber_file(path: &Path) -> Result<RenumberOutcome, RelayError> {
    let chunk = ChunkName::from_path(path).ok_or_else(|| {
        RelayError::InvalidInput(format!("cannot parse page range from '{}'", path.display()))
    })?;
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RelayError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

    let (new_content, outcome) = renumber_content(&content, &chunk)?;
    match outcome {
        RenumberOutcome::Renumbered { markers } => {
            write_atomic(path, new_content.as_bytes()).await?;
            info!("{}: renumbered {} pages from {}", chunk, markers, chunk.start);
        }
        RenumberOutcome::AlreadyRenumbered => debug!("{}: numbering already correct", chunk),
        RenumberOutcome::NoMarkers => debug!("{}: no page markers", chunk),
    }
    Ok(outcome)
}

/// Chunk outputs of `base` in `output_dir`, ordered by start page.
pub fn chunk_outputs(output_dir: &Path, base: &str) -> Result<Vec<(ChunkName, PathBuf)>, RelayError> {
    let entries = std::fs::read_dir(output_dir).map_err(|e| RelayError::ReadFailed {
        path: output_dir.to_path_buf(),
        source: e,
    })?;
    let mut outputs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(chunk) = ChunkName::from_path(&path) {
            if chunk.base == base && chunk.ext == OUTPUT_EXT {
                outputs.push((chunk, path));
            }
        }
    }
    outputs.sort_by_key(|(c, _)| (c.start, c.end));
    Ok(outputs)
}

/// Renumber every chunk output of `base`. A conflict in one chunk does not
/// stop the others; each result is returned alongside its file name.
pub async fn renumber_document(
    output_dir: &Path,
    base: &str,
) -> Result<Vec<(String, Result<RenumberOutcome, RelayError>)>, RelayError> {
    let mut results = Vec::new();
    for (chunk, path) in chunk_outputs(output_dir, base)? {
        let result = renumber_file(&path).await;
        if let Err(e) = &result {
            warn!("{}: {}", chunk, e);
        }
        results.push((chunk.file_name(), result));
    }
    Ok(results)
}

/// Join the renumbered outputs of `base` into
/// `<base>_concat_pages_1_<total>.md`.
///
/// `expected_total` is the document's page count when known (from the chunk
/// files); otherwise the last output's end page is used.
///
/// # Errors
/// [`RelayError::IncompleteSet`] when the outputs do not cover
/// `[1, total]` exactly.
pub async fn concatenate(
    output_dir: &Path,
    base: &str,
    expected_total: Option<u32>,
) -> Result<ConcatReport, RelayError> {
    let outputs = chunk_outputs(output_dir, base)?;
    let ranges: Vec<PageRange> = outputs
        .iter()
        .map(|(c, _)| PageRange::new(c.start, c.end))
        .collect();

    let Some(last) = ranges.last() else {
        return Err(RelayError::IncompleteSet {
            document: base.to_string(),
            detail: "no chunk outputs".to_string(),
        });
    };
    let total = expected_total.unwrap_or(last.end);
    if !covers(&ranges, total) {
        let have: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
        return Err(RelayError::IncompleteSet {
            document: base.to_string(),
            detail: format!("outputs [{}] do not cover pages 1-{}", have.join(", "), total),
        });
    }

    let mut combined = String::new();
    for (i, (_, path)) in outputs.iter().enumerate() {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RelayError::ReadFailed {
                path: path.clone(),
                source: e,
            })?;
        if i > 0 && !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&content);
    }

    let numbers = page_numbers(&combined);
    if !numbers.is_empty() && !numbers.iter().copied().eq(1..=total) {
        warn!(
            "{}: concatenated page markers are not exactly 1..={} ({} markers)",
            base,
            total,
            numbers.len()
        );
    }

    let path = output_dir.join(naming::concat_file_name(base, total));
    write_atomic(&path, combined.as_bytes()).await?;
    info!("{}: concatenated {} chunks → {}", base, outputs.len(), path.display());
    Ok(ConcatReport {
        path,
        total_pages: total,
        chunks: outputs.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(pages: u32) -> String {
        (1..=pages)
            .map(|p| format!("## Page {p}\n\nbody {p}\n\n"))
            .collect()
    }

    fn chunk(start: u32, end: u32) -> ChunkName {
        ChunkName::new("book", start, end, OUTPUT_EXT)
    }

    #[test]
    fn shifts_markers_by_start_page() {
        let (out, outcome) = renumber_content(&fresh(3), &chunk(191, 193)).unwrap();
        assert_eq!(outcome, RenumberOutcome::Renumbered { markers: 3 });
        assert_eq!(page_numbers(&out), vec![191, 192, 193]);
        assert!(out.contains("body 2"));
    }

    #[test]
    fn renumbering_twice_is_a_noop() {
        let c = chunk(11, 13);
        let (once, _) = renumber_content(&fresh(3), &c).unwrap();
        let (twice, outcome) = renumber_content(&once, &c).unwrap();
        assert_eq!(outcome, RenumberOutcome::AlreadyRenumbered);
        assert_eq!(once, twice);
    }

    #[test]
    fn first_chunk_is_already_correct() {
        let (out, outcome) = renumber_content(&fresh(2), &chunk(1, 2)).unwrap();
        assert_eq!(outcome, RenumberOutcome::AlreadyRenumbered);
        assert_eq!(out, fresh(2));
    }

    #[test]
    fn unexpected_first_marker_is_conflict() {
        let content = "## Page 7\n\n## Page 8\n";
        let err = renumber_content(content, &chunk(191, 192)).unwrap_err();
        assert!(matches!(
            err,
            RelayError::RenumberConflict {
                found: 7,
                start: 191,
                ..
            }
        ));
    }

    #[test]
    fn no_markers_is_left_alone() {
        let (out, outcome) = renumber_content("plain text", &chunk(5, 9)).unwrap();
        assert_eq!(outcome, RenumberOutcome::NoMarkers);
        assert_eq!(out, "plain text");
    }

    #[test]
    fn only_line_start_markers_count() {
        let content = "## Page 1\nsee ## Page 1 above\n### Page 2 is not a marker\n";
        let (out, _) = renumber_content(content, &chunk(5, 5)).unwrap();
        assert_eq!(out, "## Page 5\nsee ## Page 1 above\n### Page 2 is not a marker\n");
    }

    #[tokio::test]
    async fn concatenate_orders_and_covers() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, s: &str| std::fs::write(dir.path().join(name), s).unwrap();
        // 10 must sort after 4, not before.
        write("book_pages_10_12.md", &fresh(3));
        write("book_pages_1_4.md", &fresh(4));
        write("book_pages_5_9.md", "## Page 1\nno newline at end");
        // One marker for five pages: renumbering only warns.
        renumber_document(dir.path(), "book").await.unwrap();

        let report = concatenate(dir.path(), "book", Some(12)).await.unwrap();
        assert_eq!(report.total_pages, 12);
        assert_eq!(report.chunks, 3);
        assert_eq!(report.path, dir.path().join("book_concat_pages_1_12.md"));

        let combined = std::fs::read_to_string(&report.path).unwrap();
        assert_eq!(page_numbers(&combined), vec![1, 2, 3, 4, 5, 10, 11, 12]);
        assert!(combined.contains("no newline at end\n## Page 10"));
        assert!(!combined.contains("---"));
    }

    #[tokio::test]
    async fn full_renumber_and_concat_has_every_page_once() {
        let dir = tempfile::tempdir().unwrap();
        for (s, e) in [(1, 190), (191, 380), (381, 450)] {
            std::fs::write(dir.path().join(format!("book_pages_{s}_{e}.md")), fresh(e - s + 1)).unwrap();
        }
        let results = renumber_document(dir.path(), "book").await.unwrap();
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        // Second run changes nothing.
        let again = renumber_document(dir.path(), "book").await.unwrap();
        assert!(again
            .iter()
            .all(|(_, r)| matches!(r, Ok(RenumberOutcome::AlreadyRenumbered))));

        let report = concatenate(dir.path(), "book", None).await.unwrap();
        let combined = std::fs::read_to_string(report.path).unwrap();
        assert_eq!(page_numbers(&combined), (1..=450).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn gap_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("book_pages_1_4.md"), "a").unwrap();
        std::fs::write(dir.path().join("book_pages_9_12.md"), "b").unwrap();
        let err = concatenate(dir.path(), "book", None).await.unwrap_err();
        assert!(matches!(err, RelayError::IncompleteSet { .. }));

        // Missing tail is caught only when the real total is known.
        std::fs::write(dir.path().join("book_pages_5_8.md"), "c").unwrap();
        assert!(concatenate(dir.path(), "book", None).await.is_ok());
        assert!(matches!(
            concatenate(dir.path(), "book", Some(20)).await,
            Err(RelayError::IncompleteSet { .. })
        ));
    }

    #[tokio::test]
    async fn conflict_does_not_touch_other_chunks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("book_pages_1_2.md"), fresh(2)).unwrap();
        std::fs::write(dir.path().join("book_pages_3_4.md"), "## Page 9\n").unwrap();
        std::fs::write(dir.path().join("book_pages_5_6.md"), fresh(2)).unwrap();

        let results = renumber_document(dir.path(), "book").await.unwrap();
        assert!(matches!(results[1].1, Err(RelayError::RenumberConflict { .. })));
        let third = std::fs::read_to_string(dir.path().join("book_pages_5_6.md")).unwrap();
        assert_eq!(page_numbers(&third), vec![5, 6]);
    }
}
