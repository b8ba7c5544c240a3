//! The three folders the relay works in, and what is currently in them.
//!
//! Nothing about a document's progress is kept in memory between passes;
//! [`Workspace::scan_output`] rebuilds it from file names every time.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::naming::{self, ChunkName, CHUNK_EXT, OUTPUT_EXT};
use crate::pipeline::input::SourceDocument;
use crate::pipeline::plan::{covers, PageRange};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Input, output and archive folders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub archive_dir: PathBuf,
}

/// Everything in the output folder that belongs to one chunk base.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifacts {
    /// Chunk sub-documents, ordered by start page.
    pub chunks: Vec<ChunkName>,
    /// Chunks with a job marker.
    pub markers: BTreeSet<ChunkName>,
    /// Chunks with a Markdown output (stored with the chunk's `pdf` name).
    pub outputs: BTreeSet<ChunkName>,
    /// Total page count of an existing concatenated output.
    pub concat_total: Option<u32>,
}

impl Artifacts {
    pub fn has_marker(&self, chunk: &ChunkName) -> bool {
        self.markers.contains(&chunk.with_ext(CHUNK_EXT))
    }

    pub fn has_output(&self, chunk: &ChunkName) -> bool {
        self.outputs.contains(&chunk.with_ext(CHUNK_EXT))
    }

    /// Chunks that were never submitted, or whose submission was lost.
    pub fn unsubmitted(&self) -> Vec<&ChunkName> {
        self.chunks
            .iter()
            .filter(|c| !self.has_marker(c) && !self.has_output(c))
            .collect()
    }

    /// Every chunk has an output and none is still marked.
    pub fn all_retrieved(&self) -> bool {
        !self.chunks.is_empty()
            && self.markers.is_empty()
            && self.chunks.iter().all(|c| self.has_output(c))
    }

    /// The chunk files cover `[1, N]` exactly; returns `N`.
    pub fn covered_total(&self) -> Option<u32> {
        let ranges: Vec<PageRange> = self
            .chunks
            .iter()
            .map(|c| PageRange::new(c.start, c.end))
            .collect();
        let total = ranges.last()?.end;
        covers(&ranges, total).then_some(total)
    }
}

/// Per-base view of the output folder at one instant.
#[derive(Debug, Default)]
pub struct OutputIndex {
    by_base: HashMap<String, Artifacts>,
}

impl OutputIndex {
    /// Artifacts of `base`; empty if nothing exists yet.
    pub fn get(&self, base: &str) -> Artifacts {
        self.by_base.get(base).cloned().unwrap_or_default()
    }

    /// Every base with at least one artifact, in no particular order.
    pub fn bases(&self) -> impl Iterator<Item = (&str, &Artifacts)> {
        self.by_base.iter().map(|(b, a)| (b.as_str(), a))
    }
}

impl Workspace {
    pub fn new(
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            archive_dir: archive_dir.into(),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(&config.input_dir, &config.output_dir, &config.archive_dir)
    }

    /// Create all three folders if missing.
    pub async fn ensure_dirs(&self) -> Result<(), RelayError> {
        for dir in [&self.input_dir, &self.output_dir, &self.archive_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| RelayError::OutputWriteFailed {
                    path: dir.clone(),
                    source: e,
                })?;
        }
        Ok(())
    }

    pub fn chunk_path(&self, chunk: &ChunkName) -> PathBuf {
        self.output_dir.join(chunk.with_ext(CHUNK_EXT).file_name())
    }

    pub fn marker_path(&self, chunk: &ChunkName) -> PathBuf {
        self.output_dir.join(chunk.with_ext(CHUNK_EXT).marker_name())
    }

    pub fn output_path(&self, chunk: &ChunkName) -> PathBuf {
        self.output_dir.join(chunk.with_ext(OUTPUT_EXT).file_name())
    }

    pub fn concat_path(&self, base: &str, total_pages: u32) -> PathBuf {
        self.output_dir.join(naming::concat_file_name(base, total_pages))
    }

    /// PDF and DjVu files in the input folder, sorted by name.
    pub fn discover_sources(&self) -> Result<Vec<SourceDocument>, RelayError> {
        let mut sources: Vec<SourceDocument> = list_files(&self.input_dir)?
            .into_iter()
            .filter_map(SourceDocument::new)
            .collect();
        sources.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(sources)
    }

    /// Chunk bases of the source documents already moved to the archive.
    pub fn archived_bases(&self) -> Result<HashSet<String>, RelayError> {
        Ok(list_files(&self.archive_dir)?
            .into_iter()
            .filter_map(SourceDocument::new)
            .map(|s| s.chunk_base())
            .collect())
    }

    /// Group every recognisable artifact in the output folder by base.
    pub fn scan_output(&self) -> Result<OutputIndex, RelayError> {
        let mut index = OutputIndex::default();
        for path in list_files(&self.output_dir)? {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if let Some((base, total)) = naming::parse_concat(file_name) {
                index.by_base.entry(base).or_default().concat_total = Some(total);
            } else if let Some(chunk) = ChunkName::parse_marker(file_name) {
                index.by_base.entry(chunk.base.clone()).or_default().markers.insert(chunk);
            } else if let Some(chunk) = ChunkName::parse(file_name) {
                let entry = index.by_base.entry(chunk.base.clone()).or_default();
                match chunk.ext.as_str() {
                    CHUNK_EXT => entry.chunks.push(chunk),
                    OUTPUT_EXT => {
                        entry.outputs.insert(chunk.with_ext(CHUNK_EXT));
                    }
                    _ => {}
                }
            }
        }
        for artifacts in index.by_base.values_mut() {
            artifacts.chunks.sort_by_key(|c| (c.start, c.end));
        }
        debug!("Scanned {}: {} bases", self.output_dir.display(), index.by_base.len());
        Ok(index)
    }

    /// Move `path` into the archive folder, keeping its file name.
    pub async fn archive(&self, path: &Path) -> Result<PathBuf, RelayError> {
        let name = path
            .file_name()
            .ok_or_else(|| RelayError::Internal(format!("no file name: {}", path.display())))?;
        let dest = self.archive_dir.join(name);
        move_file(path, &dest).await?;
        Ok(dest)
    }
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>, RelayError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(RelayError::ReadFailed {
                path: dir.to_path_buf(),
                source: e,
            })
        }
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| RelayError::ReadFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            files.push(entry.path());
        }
    }
    Ok(files)
}

/// `rename`, falling back to copy + delete across filesystems.
async fn move_file(from: &Path, to: &Path) -> Result<(), RelayError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| RelayError::OutputWriteFailed {
            path: to.to_path_buf(),
            source: e,
        })?;
    tokio::fs::remove_file(from)
        .await
        .map_err(|e| RelayError::OutputWriteFailed {
            path: from.to_path_buf(),
            source: e,
        })
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

/// Write `contents` to `path` so readers only ever see the old file or the
/// complete new one: temp file, fsync, rename.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), RelayError> {
    let tmp = tmp_sibling(path);
    let err = |source| RelayError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    let mut file = tokio::fs::File::create(&tmp).await.map_err(err)?;
    file.write_all(contents).await.map_err(err)?;
    file.sync_all().await.map_err(err)?;
    drop(file);
    tokio::fs::rename(&tmp, path).await.map_err(err)?;
    Ok(())
}
