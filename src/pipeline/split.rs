//! Materialise a [`ChunkPlan`] as chunk files in the output folder.
//!
//! Each range becomes `<base>_pages_<start>_<end>.pdf`. Chunk files that
//! already exist are kept as they are, so a split interrupted halfway simply
//! finishes on the next pass. A trivial plan copies the source under the
//! chunk name instead of re-encoding it.

use crate::config::Limits;
use crate::error::RelayError;
use crate::naming::{ChunkName, CHUNK_EXT};
use crate::pipeline::plan::{ChunkPlan, PageRange};
use crate::pipeline::probe::PdfEngine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A chunk sub-document on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub name: String,
    pub path: PathBuf,
    pub range: PageRange,
    pub size_bytes: u64,
    /// Measured size is above the service's size limit. The planner's
    /// uniform-weight estimate missed for this range.
    pub oversize: bool,
}

impl Chunk {
    pub fn chunk_name(&self) -> Option<ChunkName> {
        ChunkName::parse(&self.name)
    }
}

/// Write every range of `plan` for `source` into `output_dir`.
///
/// # Errors
/// [`RelayError::UnreadableDocument`] if the engine cannot read `source`,
/// [`RelayError::OutputWriteFailed`] if a chunk cannot be written.
pub async fn materialize(
    engine: Arc<dyn PdfEngine>,
    source: &Path,
    base: &str,
    plan: &ChunkPlan,
    output_dir: &Path,
    limits: &Limits,
) -> Result<Vec<Chunk>, RelayError> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|e| RelayError::OutputWriteFailed {
            path: output_dir.to_path_buf(),
            source: e,
        })?;

    let targets: Vec<(PageRange, PathBuf)> = plan
        .ranges()
        .iter()
        .map(|r| {
            let name = ChunkName::new(base, r.start, r.end, CHUNK_EXT);
            (*r, output_dir.join(name.file_name()))
        })
        .collect();

    let missing: Vec<(PageRange, PathBuf)> = targets
        .iter()
        .filter(|(_, path)| !path.exists())
        .cloned()
        .collect();

    if missing.is_empty() {
        debug!("{}: all {} chunk files already present", base, targets.len());
    } else if plan.is_trivial() {
        let (_, dest) = &missing[0];
        copy_whole(source, dest).await?;
        info!("{}: within limits, copied as {}", base, display_name(dest));
    } else {
        info!(
            "{}: writing {} of {} chunks",
            base,
            missing.len(),
            targets.len()
        );
        let src = source.to_path_buf();
        tokio::task::spawn_blocking(move || engine.extract_ranges(&src, &missing))
            .await
            .map_err(|e| RelayError::Internal(format!("split task panicked: {e}")))??;
    }

    let mut chunks = Vec::with_capacity(targets.len());
    for (range, path) in targets {
        let size_bytes = tokio::fs::metadata(&path)
            .await
            .map_err(|e| RelayError::ReadFailed {
                path: path.clone(),
                source: e,
            })?
            .len();
        let oversize = size_bytes > limits.size_limit_bytes;
        if oversize {
            warn!(
                "{}: {} B exceeds the size limit of {} B; the service may reject it",
                display_name(&path),
                size_bytes,
                limits.size_limit_bytes
            );
        }
        chunks.push(Chunk {
            name: display_name(&path),
            path,
            range,
            size_bytes,
            oversize,
        });
    }
    Ok(chunks)
}

async fn copy_whole(source: &Path, dest: &Path) -> Result<(), RelayError> {
    let tmp = dest.with_extension("pdf.tmp");
    tokio::fs::copy(source, &tmp)
        .await
        .map_err(|e| RelayError::OutputWriteFailed {
            path: dest.to_path_buf(),
            source: e,
        })?;
    tokio::fs::rename(&tmp, dest)
        .await
        .map_err(|e| RelayError::OutputWriteFailed {
            path: dest.to_path_buf(),
            source: e,
        })
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::plan::plan;
    use crate::pipeline::probe::DocumentInfo;
    use std::sync::Mutex;

    /// Writes `range.page_count() * page_weight` bytes per chunk, recording calls.
    struct FakeEngine {
        page_weight: u64,
        calls: Mutex<Vec<PageRange>>,
    }

    impl PdfEngine for FakeEngine {
        fn probe(&self, path: &Path) -> Result<DocumentInfo, RelayError> {
            Err(RelayError::FileNotFound {
                path: path.to_path_buf(),
            })
        }

        fn extract_pages(&self, _source: &Path, range: PageRange, dest: &Path) -> Result<(), RelayError> {
            self.calls.lock().unwrap().push(range);
            std::fs::write(dest, vec![b'x'; (range.page_count() as u64 * self.page_weight) as usize])
                .map_err(|e| RelayError::OutputWriteFailed {
                    path: dest.to_path_buf(),
                    source: e,
                })
        }
    }

    fn small_limits() -> Limits {
        Limits {
            size_limit_bytes: 100,
            size_target_bytes: 80,
            page_limit: 4,
            page_target: 4,
        }
    }

    #[tokio::test]
    async fn writes_every_range_and_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let limits = small_limits();
        let p = plan(50, 10, &limits).unwrap();
        assert_eq!(p.len(), 3);

        // Pretend a previous pass already wrote the middle chunk.
        std::fs::write(dir.path().join("doc_pages_5_8.pdf"), b"keep").unwrap();

        let engine = Arc::new(FakeEngine {
            page_weight: 1,
            calls: Mutex::new(Vec::new()),
        });
        let chunks = materialize(engine.clone(), Path::new("/src/doc.pdf"), "doc", &p, dir.path(), &limits)
            .await
            .unwrap();

        let names: Vec<&str> = chunks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["doc_pages_1_4.pdf", "doc_pages_5_8.pdf", "doc_pages_9_10.pdf"]);
        assert_eq!(
            *engine.calls.lock().unwrap(),
            vec![PageRange::new(1, 4), PageRange::new(9, 10)]
        );
        assert_eq!(std::fs::read(dir.path().join("doc_pages_5_8.pdf")).unwrap(), b"keep");
    }

    #[tokio::test]
    async fn trivial_plan_copies_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("small.pdf");
        std::fs::write(&src, b"%PDF-1.4 tiny").unwrap();
        let out = dir.path().join("out");
        let limits = small_limits();
        let p = plan(13, 3, &limits).unwrap();

        let engine = Arc::new(FakeEngine {
            page_weight: 1,
            calls: Mutex::new(Vec::new()),
        });
        let chunks = materialize(engine.clone(), &src, "small", &p, &out, &limits)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].name, "small_pages_1_3.pdf");
        assert_eq!(std::fs::read(&chunks[0].path).unwrap(), b"%PDF-1.4 tiny");
        assert!(engine.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversize_chunks_are_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let limits = small_limits();
        let p = plan(50, 10, &limits).unwrap();
        // 4 pages * 30 B = 120 B > 100 B limit; the 2-page tail is 60 B.
        let engine = Arc::new(FakeEngine {
            page_weight: 30,
            calls: Mutex::new(Vec::new()),
        });
        let chunks = materialize(engine, Path::new("/src/doc.pdf"), "doc", &p, dir.path(), &limits)
            .await
            .unwrap();
        let flags: Vec<bool> = chunks.iter().map(|c| c.oversize).collect();
        assert_eq!(flags, vec![true, true, false]);
    }
}
