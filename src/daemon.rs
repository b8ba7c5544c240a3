//! Reconciliation passes over the input and output folders.
//!
//! A pass is meant to be started from outside (cron, a systemd timer) and
//! keeps nothing in memory between runs. Every pass re-derives each
//! document's [`DocumentState`] from the files present and moves it one
//! step forward:
//!
//! 1. retrieve every marked chunk of every document
//! 2. rescan; finalize and archive documents that are now complete
//! 3. prepare and submit documents that are New
//! 4. archive concat files left behind by an interrupted archive
//!
//! An [`InstanceLock`] keeps overlapping passes apart. A pass that cannot
//! take it returns immediately without touching anything. The lock is an OS
//! advisory lock, so a killed pass releases it on exit.

use crate::convert::Relay;
use crate::error::{ChunkError, RelayError};
use crate::output::{DocumentReport, DocumentState, PassReport};
use crate::pipeline::input::SourceDocument;
use crate::workspace::Artifacts;
use std::collections::HashSet;
use std::fs::{File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

// ── Instance lock ────────────────────────────────────────────────────────────

/// Exclusive OS advisory lock on a file, held for the duration of a pass.
///
/// Taking it is a single `try_lock` on the open file, so two contenders can
/// never both succeed. The OS drops the lock when its holder exits, crashed
/// or not; a lock file left behind by a killed pass is therefore free for
/// the next one and needs no reclaiming. The file records the holder's pid
/// and start time and is touched between documents, so a holder that has
/// not touched it within the stale timeout is reported as possibly hung.
///
/// The file itself is never deleted: unlinking a locked path would let a
/// later pass lock a fresh inode while an older one still holds the first.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: File,
}

impl InstanceLock {
    /// Try to take the lock. `Ok(None)` means another pass holds it.
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<Option<Self>, RelayError> {
        let write_err = |e: std::io::Error| RelayError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RelayError::OutputWriteFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        // No truncation before the lock is ours: the holder's pid stays readable.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(write_err)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                if is_stale(path, stale_after) {
                    warn!(
                        "Instance lock {} (holder: {}) not refreshed for over {}s; that pass may be hung",
                        path.display(),
                        std::fs::read_to_string(path).unwrap_or_default().trim(),
                        stale_after.as_secs()
                    );
                }
                return Ok(None);
            }
            Err(TryLockError::Error(e)) => return Err(write_err(e)),
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        file.set_len(0).map_err(write_err)?;
        writeln!(file, "{} {}", std::process::id(), now).map_err(write_err)?;
        debug!("Acquired instance lock {}", path.display());
        Ok(Some(Self {
            path: path.to_path_buf(),
            file,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Refresh the lock's mtime to show the pass is alive.
    pub fn touch(&self) {
        if let Err(e) = self.file.set_modified(SystemTime::now()) {
            warn!("Could not refresh instance lock {}: {}", self.path.display(), e);
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Could not release instance lock {}: {}", self.path.display(), e);
        }
        debug!("Released instance lock {}", self.path.display());
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

// ── State inference ──────────────────────────────────────────────────────────

/// Infer where a document is from its artifacts.
///
/// Chunks that are all retrieved but do not cover a contiguous range mean
/// the split was interrupted; that is New again so the gap gets written.
pub fn infer_state(artifacts: &Artifacts) -> DocumentState {
    if !artifacts.markers.is_empty() {
        DocumentState::AwaitingRetrieval
    } else if artifacts.concat_total.is_some() {
        DocumentState::Done
    } else if artifacts.all_retrieved() && artifacts.covered_total().is_some() {
        DocumentState::ReadyToFinalize
    } else {
        DocumentState::New
    }
}

// ── Reconciliation loop ──────────────────────────────────────────────────────

/// Drives every document in the input folder one step per pass.
pub struct ReconciliationLoop {
    relay: Relay,
}

impl ReconciliationLoop {
    pub fn new(relay: Relay) -> Self {
        Self { relay }
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Run one pass.
    ///
    /// Per-document failures are recorded in the report and logged; `Err`
    /// is only returned when the folders themselves cannot be read or the
    /// lock cannot be created.
    pub async fn run_pass(&self) -> Result<PassReport, RelayError> {
        let config = self.relay.config();
        let Some(lock) = InstanceLock::acquire(&config.lock_path, config.stale_lock_after)? else {
            info!(
                "Another pass holds {}; exiting without changes",
                config.lock_path.display()
            );
            return Ok(PassReport::skipped());
        };

        let workspace = self.relay.workspace();
        workspace.ensure_dirs().await?;
        let sources = workspace.discover_sources()?;
        info!("Pass started: {} document(s) in {}", sources.len(), workspace.input_dir.display());

        // ── 1. Retrieve pending chunks of every document ─────────────────
        let index = workspace.scan_output()?;
        let mut reports: Vec<DocumentReport> = Vec::with_capacity(sources.len());
        for source in &sources {
            let artifacts = index.get(&source.chunk_base());
            let state = infer_state(&artifacts);
            let mut report = DocumentReport::new(source.name(), state);
            if state == DocumentState::AwaitingRetrieval {
                info!("{}: {} chunk(s) awaiting retrieval", source.name(), artifacts.markers.len());
                self.relay.retrieve_chunks(&artifacts, &mut report).await;
                lock.touch();
            }
            reports.push(report);
        }

        // ── 2. Finalize and archive what is complete ─────────────────────
        let index = workspace.scan_output()?;
        let mut new_documents = Vec::new();
        for (source, report) in sources.iter().zip(reports.iter_mut()) {
            let artifacts = index.get(&source.chunk_base());
            match infer_state(&artifacts) {
                DocumentState::ReadyToFinalize => {
                    self.finalize_and_archive(source, &artifacts, report).await;
                    lock.touch();
                }
                DocumentState::Done => self.archive(Some(source), &source.chunk_base(), report).await,
                DocumentState::New if report.state == DocumentState::New => new_documents.push(source),
                _ => {}
            }
        }

        // ── 3. Start new documents ───────────────────────────────────────
        for source in new_documents {
            let started = self.relay.start_document(source).await;
            lock.touch();
            if let Some(report) = reports.iter_mut().find(|r| r.document == started.document) {
                report.submitted = started.submitted;
                report.oversize = started.oversize;
                report.errors.extend(started.errors);
            }
        }

        // ── 4. Finish archives interrupted after the source was moved ────
        // Only bases whose source already sits in the archive: a concat
        // written by a one-shot run into the same folder is left alone.
        let owned: HashSet<String> = sources.iter().map(|s| s.chunk_base()).collect();
        let archived = workspace.archived_bases()?;
        let orphans: Vec<String> = index
            .bases()
            .filter(|(base, a)| {
                !owned.contains(*base)
                    && archived.contains(*base)
                    && a.concat_total.is_some()
                    && a.markers.is_empty()
            })
            .map(|(base, _)| base.to_string())
            .collect();
        for base in orphans {
            let mut report = DocumentReport::new(base.clone(), DocumentState::Done);
            self.archive(None, &base, &mut report).await;
            reports.push(report);
        }

        let pass = PassReport {
            lock_acquired: true,
            documents: reports,
        };
        info!(
            "Pass finished: {} document(s), {} archived, {} error(s)",
            pass.documents.len(),
            pass.archived_count(),
            pass.error_count()
        );
        Ok(pass)
    }

    async fn finalize_and_archive(&self, source: &SourceDocument, artifacts: &Artifacts, report: &mut DocumentReport) {
        let base = source.chunk_base();
        info!("{}: all chunks retrieved, finalizing", source.name());
        match self.relay.finalize_document(&base, artifacts.covered_total()).await {
            Ok(concat) => {
                report.concatenated = Some(concat.path);
                self.archive(Some(source), &base, report).await;
            }
            Err(RelayError::IncompleteSet { detail, .. }) => {
                info!("{}: not ready to finalize: {}", source.name(), detail);
            }
            Err(e) => {
                warn!("{}: finalization failed: {}", source.name(), e);
                report.errors.push(ChunkError::FinalizeFailed {
                    document: source.name(),
                    detail: e.to_string(),
                });
            }
        }
    }

    async fn archive(&self, source: Option<&SourceDocument>, base: &str, report: &mut DocumentReport) {
        match self.relay.archive_document(source, base).await {
            Ok(_) => report.archived = true,
            Err(e) => {
                warn!("{}: archiving failed: {}", report.document, e);
                report.errors.push(ChunkError::ArchiveFailed {
                    document: report.document.clone(),
                    detail: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::ChunkName;

    fn chunk(s: u32, e: u32) -> ChunkName {
        ChunkName::new("b", s, e, "pdf")
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.lock");
        let stale = Duration::from_secs(3600);

        let first = InstanceLock::acquire(&path, stale).unwrap();
        assert!(first.is_some());
        assert!(InstanceLock::acquire(&path, stale).unwrap().is_none());

        drop(first);
        assert!(InstanceLock::acquire(&path, stale).unwrap().is_some());
    }

    #[test]
    fn failed_attempt_leaves_holder_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.lock");
        let stale = Duration::from_secs(3600);

        let holder = InstanceLock::acquire(&path, stale).unwrap().unwrap();
        let recorded = std::fs::read_to_string(&path).unwrap();
        for _ in 0..3 {
            assert!(InstanceLock::acquire(&path, stale).unwrap().is_none());
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), recorded);
        assert_eq!(holder.path(), path.as_path());
    }

    #[test]
    fn lock_file_left_by_dead_pass_is_taken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.lock");
        std::fs::write(&path, "12345 0\n").unwrap();
        let old = SystemTime::now() - Duration::from_secs(3 * 3600);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let lock = InstanceLock::acquire(&path, Duration::from_secs(2 * 3600)).unwrap();
        assert!(lock.is_some());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with(&std::process::id().to_string()));
        assert!(!contents.contains("12345"));
    }

    #[test]
    fn stale_mtime_never_steals_a_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.lock");
        let holder = InstanceLock::acquire(&path, Duration::from_secs(3600)).unwrap().unwrap();
        holder
            .file
            .set_modified(SystemTime::now() - Duration::from_secs(3 * 3600))
            .unwrap();

        assert!(InstanceLock::acquire(&path, Duration::from_secs(60)).unwrap().is_none());

        holder.touch();
        let age = std::fs::metadata(&path).unwrap().modified().unwrap().elapsed().unwrap();
        assert!(age < Duration::from_secs(60));
    }

    #[test]
    fn concurrent_contenders_get_one_holder() {
        use std::sync::{Arc, Barrier};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.lock");
        // A dead pass's file with an old mtime: every contender sees it stale.
        std::fs::write(&path, "12345 0\n").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3 * 3600))
            .unwrap();

        for _ in 0..20 {
            let start = Arc::new(Barrier::new(8));
            let done = Arc::new(Barrier::new(8));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let (path, start, done) = (path.clone(), start.clone(), done.clone());
                    std::thread::spawn(move || {
                        start.wait();
                        let lock = InstanceLock::acquire(&path, Duration::from_secs(60)).unwrap();
                        let held = lock.is_some();
                        // Everyone keeps what they got until all have tried.
                        done.wait();
                        drop(lock);
                        held
                    })
                })
                .collect();
            let holders = handles.into_iter().map(|h| h.join().unwrap()).filter(|held| *held).count();
            assert_eq!(holders, 1);
        }
    }

    #[test]
    fn state_inference() {
        let mut a = Artifacts::default();
        assert_eq!(infer_state(&a), DocumentState::New);

        a.chunks = vec![chunk(1, 5), chunk(6, 9)];
        assert_eq!(infer_state(&a), DocumentState::New);

        a.markers.insert(chunk(1, 5));
        a.outputs.insert(chunk(6, 9));
        assert_eq!(infer_state(&a), DocumentState::AwaitingRetrieval);

        a.markers.clear();
        a.outputs.insert(chunk(1, 5));
        assert_eq!(infer_state(&a), DocumentState::ReadyToFinalize);

        a.concat_total = Some(9);
        assert_eq!(infer_state(&a), DocumentState::Done);
    }

    #[test]
    fn gap_in_chunks_is_new() {
        let mut a = Artifacts::default();
        a.chunks = vec![chunk(1, 5), chunk(11, 15)];
        a.outputs.insert(chunk(1, 5));
        a.outputs.insert(chunk(11, 15));
        assert_eq!(infer_state(&a), DocumentState::New);
    }
}
