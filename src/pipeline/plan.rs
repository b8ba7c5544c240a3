//! Chunk planning: decide how to cut a document into submittable parts.
//!
//! Pure computation over `(size, page count, limits)`. Exact per-page byte
//! weight is unknown without rendering, so size-driven plans assume every
//! page weighs the same. Pages that are much heavier than average (full-page
//! scans between text pages) can still push a materialised chunk over the
//! size limit; [`crate::pipeline::split`] measures and flags those.

use crate::config::Limits;
use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A 1-based inclusive page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn page_count(&self) -> u32 {
        self.end - self.start + 1
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Which branch of the planner produced a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SplitStrategy {
    /// Within both limits; one range covers the document.
    Whole,
    /// Over the size limit; width derived from average page weight.
    BySize { pages_per_chunk: u32 },
    /// Only over the page limit; fixed `page_target` width.
    ByPages { pages_per_chunk: u32 },
}

/// Ordered ranges covering `[1, total_pages]` without gaps or overlaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    ranges: Vec<PageRange>,
    total_pages: u32,
    strategy: SplitStrategy,
}

impl ChunkPlan {
    pub fn ranges(&self) -> &[PageRange] {
        &self.ranges
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    pub fn strategy(&self) -> SplitStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// One range covering the whole document: no split needed.
    pub fn is_trivial(&self) -> bool {
        self.ranges.len() == 1
    }

    /// Check the coverage invariant. Always true for planner output; used
    /// to validate plans reconstructed from chunk files on disk.
    pub fn is_contiguous(&self) -> bool {
        covers(&self.ranges, self.total_pages)
    }
}

/// `true` iff `ranges` starts at 1, ends at `total`, and each range starts
/// right after the previous one ends.
pub fn covers(ranges: &[PageRange], total: u32) -> bool {
    let mut expected = 1u32;
    for r in ranges {
        if r.start != expected || r.end < r.start {
            return false;
        }
        expected = r.end + 1;
    }
    !ranges.is_empty() && expected == total + 1
}

/// Compute the chunk plan for a document.
///
/// # Errors
/// [`RelayError::InvalidInput`] when `page_count` is zero or the limits are
/// not usable (see [`Limits::validate`]).
pub fn plan(size_bytes: u64, page_count: u32, limits: &Limits) -> Result<ChunkPlan, RelayError> {
    limits.validate()?;
    if page_count == 0 {
        return Err(RelayError::InvalidInput(
            "document has no pages".to_string(),
        ));
    }

    if size_bytes <= limits.size_limit_bytes && page_count <= limits.page_limit {
        return Ok(ChunkPlan {
            ranges: vec![PageRange::new(1, page_count)],
            total_pages: page_count,
            strategy: SplitStrategy::Whole,
        });
    }

    let strategy = if size_bytes > limits.size_limit_bytes {
        // u128: page_count * size_target overflows u64 for multi-GB targets.
        let estimate =
            (page_count as u128 * limits.size_target_bytes as u128) / size_bytes as u128;
        let pages_per_chunk = (estimate.min(u32::MAX as u128) as u32).clamp(1, limits.page_limit);
        SplitStrategy::BySize { pages_per_chunk }
    } else {
        SplitStrategy::ByPages {
            pages_per_chunk: limits.page_target,
        }
    };

    let width = match strategy {
        SplitStrategy::BySize { pages_per_chunk } | SplitStrategy::ByPages { pages_per_chunk } => {
            pages_per_chunk
        }
        SplitStrategy::Whole => page_count,
    };

    Ok(ChunkPlan {
        ranges: fixed_width(page_count, width),
        total_pages: page_count,
        strategy,
    })
}

fn fixed_width(total: u32, width: u32) -> Vec<PageRange> {
    let mut ranges = Vec::with_capacity(total.div_ceil(width) as usize);
    let mut start = 1u32;
    while start <= total {
        let end = start.saturating_add(width - 1).min(total);
        ranges.push(PageRange::new(start, end));
        start = end + 1;
    }
    ranges
}
