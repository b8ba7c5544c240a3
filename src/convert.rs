//! Per-document operations.
//!
//! [`Relay`] bundles the configuration with the two external collaborators
//! (a [`PdfEngine`] and a [`ConversionClient`]) and exposes one method per
//! thing a caller can do to a document: plan it, start it, retrieve it,
//! finalize it, archive it. The daemon strings these together per inferred
//! state; the CLI calls them directly for its one-shot modes.
//!
//! Methods that run inside a reconciliation pass never return `Err` for a
//! per-chunk problem. They record a [`ChunkError`] in the
//! [`DocumentReport`] and carry on, so one bad chunk or document cannot
//! stop the rest.

use crate::client::{ConversionClient, HttpConversionClient, RecordStatus};
use crate::config::RelayConfig;
use crate::error::{ChunkError, RelayError};
use crate::naming::{ChunkName, CHUNK_EXT};
use crate::output::{ChunkPlanReport, DocumentReport, DocumentState, PlannedChunk};
use crate::pipeline::input::{self, SourceDocument};
use crate::pipeline::plan::{self, ChunkPlan};
use crate::pipeline::probe::{DocumentInfo, LopdfEngine, PdfEngine};
use crate::pipeline::renumber::{self, ConcatReport, RenumberOutcome};
use crate::pipeline::split::{self, Chunk};
use crate::pipeline::tracker::{JobStateTracker, RetrieveOutcome};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::workspace::{Artifacts, Workspace};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration plus collaborators; the entry point for every operation.
pub struct Relay {
    config: RelayConfig,
    workspace: Workspace,
    engine: Arc<dyn PdfEngine>,
    client: Arc<dyn ConversionClient>,
    tracker: JobStateTracker,
    progress: ProgressCallback,
}

impl Relay {
    pub fn new(config: RelayConfig, engine: Arc<dyn PdfEngine>, client: Arc<dyn ConversionClient>) -> Self {
        let tracker = JobStateTracker::from_config(client.clone(), &config);
        let progress = config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback));
        Self {
            workspace: Workspace::from_config(&config),
            config,
            engine,
            client,
            tracker,
            progress,
        }
    }

    /// `lopdf` for splitting, the HTTP API for conversion.
    ///
    /// # Errors
    /// [`RelayError::InvalidConfig`] when no API key is configured.
    pub fn from_config(config: RelayConfig) -> Result<Self, RelayError> {
        let client = HttpConversionClient::from_config(&config)?;
        Ok(Self::new(config, Arc::new(LopdfEngine), Arc::new(client)))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn tracker(&self) -> &JobStateTracker {
        &self.tracker
    }

    // ── Planning ──────────────────────────────────────────────────────────

    async fn probe(&self, pdf: &Path) -> Result<DocumentInfo, RelayError> {
        let engine = self.engine.clone();
        let path = pdf.to_path_buf();
        tokio::task::spawn_blocking(move || engine.probe(&path))
            .await
            .map_err(|e| RelayError::Internal(format!("probe task panicked: {e}")))?
    }

    async fn resolve_and_plan(&self, source: &SourceDocument) -> Result<(PathBuf, DocumentInfo, ChunkPlan), RelayError> {
        let pdf = input::to_submittable(source, &self.workspace.output_dir).await?;
        let info = self.probe(&pdf).await?;
        let plan = plan::plan(info.size_bytes, info.page_count, &self.config.limits)?;
        info!(
            "{}: {:.2} MiB, {} pages → {} chunk(s) ({:?})",
            source.name(),
            info.size_bytes as f64 / (1024.0 * 1024.0),
            info.page_count,
            plan.len(),
            plan.strategy()
        );
        Ok((pdf, info, plan))
    }

    /// Compute the chunk plan of `source` without splitting or submitting.
    ///
    /// A DjVu source is still converted (and cached), since only the PDF
    /// can be probed.
    pub async fn plan_document(&self, source: &SourceDocument) -> Result<ChunkPlanReport, RelayError> {
        let (_, info, plan) = self.resolve_and_plan(source).await?;
        let base = source.chunk_base();
        Ok(ChunkPlanReport {
            document: source.name(),
            size_bytes: info.size_bytes,
            page_count: info.page_count,
            strategy: plan.strategy(),
            chunks: plan
                .ranges()
                .iter()
                .map(|r| PlannedChunk {
                    file_name: ChunkName::new(&base, r.start, r.end, CHUNK_EXT).file_name(),
                    range: *r,
                })
                .collect(),
        })
    }

    /// Resolve, probe, plan and materialise `source`. Existing chunk files
    /// are reused.
    pub async fn prepare(&self, source: &SourceDocument) -> Result<Vec<Chunk>, RelayError> {
        let (pdf, _, plan) = self.resolve_and_plan(source).await?;
        split::materialize(
            self.engine.clone(),
            &pdf,
            &source.chunk_base(),
            &plan,
            &self.workspace.output_dir,
            &self.config.limits,
        )
        .await
    }

    // ── Submission ────────────────────────────────────────────────────────

    /// Submit every chunk that has neither a marker nor an output.
    ///
    /// A rate-limited chunk ends the wave; the rest go out next pass.
    pub async fn submit_chunks(&self, chunks: &[Chunk], report: &mut DocumentReport) {
        self.progress.on_document_start(&report.document, chunks.len());
        for chunk in chunks {
            if self.tracker.has_pending(&chunk.name) || self.tracker.output_path(&chunk.name).exists() {
                debug!("{}: already submitted or retrieved", chunk.name);
                continue;
            }
            match self.tracker.submit(&chunk.path).await {
                Ok(_) => report.submitted.push(chunk.name.clone()),
                Err(e) => {
                    warn!("{} / {}: submission failed: {}", report.document, chunk.name, e);
                    let rate_limited = matches!(e, RelayError::RateLimited { .. });
                    report.errors.push(ChunkError::SubmitFailed {
                        chunk: chunk.name.clone(),
                        detail: e.to_string(),
                    });
                    if rate_limited {
                        break;
                    }
                }
            }
        }
    }

    /// Handle a document in state New: prepare it and submit what is not
    /// yet submitted.
    pub async fn start_document(&self, source: &SourceDocument) -> DocumentReport {
        let mut report = DocumentReport::new(source.name(), DocumentState::New);
        info!("{}: starting", source.name());

        let chunks = match self.prepare(source).await {
            Ok(c) => c,
            Err(e) => {
                warn!("{}: cannot prepare: {}", source.name(), e);
                report.errors.push(ChunkError::Unreadable {
                    document: source.name(),
                    detail: e.to_string(),
                });
                return report;
            }
        };
        report.oversize = chunks.iter().filter(|c| c.oversize).map(|c| c.name.clone()).collect();
        self.submit_chunks(&chunks, &mut report).await;
        report
    }

    // ── Retrieval ─────────────────────────────────────────────────────────

    /// Make one retrieval attempt for every marked chunk in `artifacts`.
    pub async fn retrieve_chunks(&self, artifacts: &Artifacts, report: &mut DocumentReport) {
        for chunk in &artifacts.markers {
            let name = chunk.file_name();
            match self.tracker.retrieve(&name).await {
                Ok(RetrieveOutcome::Retrieved { .. }) => report.retrieved.push(name),
                Ok(RetrieveOutcome::Pending { .. }) => report.pending.push(name),
                Ok(RetrieveOutcome::NotSubmitted) => {}
                Err(e) => {
                    warn!("{} / {}: {}", report.document, name, e);
                    report.errors.push(retrieval_error(&name, e));
                }
            }
        }
    }

    // ── Finalisation ──────────────────────────────────────────────────────

    /// Renumber every chunk output of `base` and concatenate them.
    ///
    /// `expected_total` is the page count the chunk files cover, when known.
    ///
    /// # Errors
    /// The first [`RelayError::RenumberConflict`] found, or
    /// [`RelayError::IncompleteSet`] from concatenation.
    pub async fn finalize_document(&self, base: &str, expected_total: Option<u32>) -> Result<ConcatReport, RelayError> {
        let results = renumber::renumber_document(&self.workspace.output_dir, base).await?;
        if let Some(err) = results.into_iter().find_map(|(_, r)| r.err()) {
            return Err(err);
        }
        let report = renumber::concatenate(&self.workspace.output_dir, base, expected_total).await?;
        self.progress.on_document_finalized(base, report.total_pages);
        Ok(report)
    }

    /// Move a finished document into the archive.
    ///
    /// Chunk files and outputs go first, then the source, then the
    /// concatenated output. Interrupted halfway, the next pass finds either
    /// the source with its concatenation (still Done) or an orphaned
    /// concatenation, and finishes the move.
    pub async fn archive_document(&self, source: Option<&SourceDocument>, base: &str) -> Result<Vec<PathBuf>, RelayError> {
        tokio::fs::create_dir_all(&self.workspace.archive_dir)
            .await
            .map_err(|e| RelayError::OutputWriteFailed {
                path: self.workspace.archive_dir.clone(),
                source: e,
            })?;

        let artifacts = self.workspace.scan_output()?.get(base);
        if !artifacts.markers.is_empty() {
            return Err(RelayError::Internal(format!(
                "{base}: refusing to archive with {} pending marker(s)",
                artifacts.markers.len()
            )));
        }

        let mut moved = Vec::new();
        let mut candidates: Vec<PathBuf> = Vec::new();
        for chunk in &artifacts.chunks {
            candidates.push(self.workspace.chunk_path(chunk));
        }
        for chunk in &artifacts.outputs {
            candidates.push(self.workspace.output_path(chunk));
        }
        match source {
            Some(source) => {
                candidates.extend(source.converted_pdf_path(&self.workspace.output_dir));
                candidates.push(source.path.clone());
            }
            None if base.ends_with("_converted") => {
                candidates.push(self.workspace.output_dir.join(format!("{base}.{CHUNK_EXT}")));
            }
            None => {}
        }
        if let Some(total) = artifacts.concat_total {
            candidates.push(self.workspace.concat_path(base, total));
        }

        for path in candidates {
            if !path.exists() {
                continue;
            }
            let dest = self.workspace.archive(&path).await?;
            debug!("Archived {}", dest.display());
            moved.push(dest);
        }
        info!("{}: archived {} file(s)", base, moved.len());
        Ok(moved)
    }

    // ── One-shot modes ────────────────────────────────────────────────────

    fn source_for(path: &Path) -> Result<SourceDocument, RelayError> {
        if !path.exists() {
            return Err(RelayError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        SourceDocument::new(path).ok_or_else(|| {
            RelayError::InvalidInput(format!("'{}' is neither a PDF nor a DjVu file", path.display()))
        })
    }

    /// Plan a single file for `--dry-run`.
    pub async fn dry_run(&self, path: &Path) -> Result<ChunkPlanReport, RelayError> {
        let source = Self::source_for(path)?;
        self.plan_document(&source).await
    }

    /// Split, submit, and make one retrieval attempt for a single file.
    ///
    /// With `retrieve_only`, nothing new is submitted. Finalisation is left to
    /// [`Self::concatenate`] or the daemon.
    pub async fn convert(&self, path: &Path, retrieve_only: bool) -> Result<DocumentReport, RelayError> {
        let source = Self::source_for(path)?;
        self.workspace.ensure_dirs().await?;
        let chunks = self.prepare(&source).await?;

        let mut report = DocumentReport::new(source.name(), DocumentState::New);
        report.oversize = chunks.iter().filter(|c| c.oversize).map(|c| c.name.clone()).collect();
        if retrieve_only {
            info!("{}: upload phase skipped", source.name());
        } else {
            self.submit_chunks(&chunks, &mut report).await;
        }

        let artifacts = self.workspace.scan_output()?.get(&source.chunk_base());
        self.retrieve_chunks(&artifacts, &mut report).await;
        Ok(report)
    }

    /// Submit `path` as-is, without planning, then try once to retrieve it.
    pub async fn convert_only(&self, path: &Path) -> Result<DocumentReport, RelayError> {
        input::validate_pdf(path)?;
        self.workspace.ensure_dirs().await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut report = DocumentReport::new(name.clone(), DocumentState::New);

        if self.tracker.is_retrieved(&name) {
            info!("{}: output already exists, skipping upload", name);
            return Ok(report);
        }
        if !self.tracker.has_pending(&name) {
            self.tracker.submit(path).await?;
            report.submitted.push(name.clone());
        }
        match self.tracker.retrieve(&name).await {
            Ok(RetrieveOutcome::Retrieved { .. }) => report.retrieved.push(name),
            Ok(RetrieveOutcome::Pending { .. }) => report.pending.push(name),
            Ok(RetrieveOutcome::NotSubmitted) => {}
            Err(e) => report.errors.push(retrieval_error(&name, e)),
        }
        Ok(report)
    }

    /// Renumber every chunk output of the document at `path`.
    pub async fn renumber(&self, path: &Path) -> Result<Vec<(String, Result<RenumberOutcome, RelayError>)>, RelayError> {
        let base = Self::base_for(path)?;
        renumber::renumber_document(&self.workspace.output_dir, &base).await
    }

    /// Renumber and concatenate the document at `path` from whatever
    /// outputs are in the output folder.
    pub async fn concatenate(&self, path: &Path) -> Result<ConcatReport, RelayError> {
        let base = Self::base_for(path)?;
        let expected = self.workspace.scan_output()?.get(&base).covered_total();
        self.finalize_document(&base, expected).await
    }

    fn base_for(path: &Path) -> Result<String, RelayError> {
        SourceDocument::new(path)
            .map(|s| s.chunk_base())
            .ok_or_else(|| RelayError::InvalidInput(format!("'{}' is neither a PDF nor a DjVu file", path.display())))
    }

    /// Raw status of each record id. Touches no local state.
    pub async fn file_status(&self, record_ids: &[String]) -> Vec<(String, Result<RecordStatus, RelayError>)> {
        let mut out = Vec::with_capacity(record_ids.len());
        for id in record_ids {
            out.push((id.clone(), self.client.status(id).await));
        }
        out
    }
}

fn retrieval_error(chunk: &str, e: RelayError) -> ChunkError {
    match e {
        RelayError::PermanentFailure {
            chunk,
            record_id,
            detail,
        } => ChunkError::RemoteFailed {
            chunk,
            record_id,
            detail,
        },
        RelayError::Fetch { record_id, reason } => ChunkError::FetchFailed {
            chunk: chunk.to_string(),
            record_id,
            detail: reason,
        },
        other => ChunkError::FetchFailed {
            chunk: chunk.to_string(),
            record_id: String::new(),
            detail: other.to_string(),
        },
    }
}
