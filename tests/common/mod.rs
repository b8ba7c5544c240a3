//! Shared fixtures for the integration tests: real PDFs built with lopdf and
//! a deterministic in-memory conversion service.

#![allow(dead_code)]

use async_trait::async_trait;
use lopdf::{dictionary, Document, Object, Stream};
use pdf2md_relay::{
    ChunkName, ConversionClient, FetchOutcome, Limits, LopdfEngine, RecordStatus, Relay, RelayConfig, RelayError,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// ── PDF fixtures ─────────────────────────────────────────────────────────────

/// Write a PDF with `pages` blank pages.
///
/// Each page's content stream carries a `% source page N` comment so a
/// chunk's pages can be traced back to the source. `padding(n)` adds that
/// many bytes to page `n`, for skewed page weights.
pub fn write_pdf(path: &Path, pages: u32, padding: impl Fn(u32) -> usize) {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let mut kids: Vec<Object> = Vec::with_capacity(pages as usize);
    for n in 1..=pages {
        let mut content = format!("% source page {n}\n").into_bytes();
        let pad = padding(n);
        if pad > 0 {
            content.extend_from_slice(b"% ");
            content.extend(std::iter::repeat_n(b'x', pad));
            content.push(b'\n');
        }
        let content_id = doc.add_object(Stream::new(dictionary! {}, content));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        });
        kids.push(page_id.into());
    }

    let pages_dict = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => pages as i64,
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages_dict));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.save(path).unwrap();
}

/// Source page numbers found in `pdf`, in page order.
pub fn source_pages(pdf: &Path) -> Vec<u32> {
    let doc = Document::load(pdf).unwrap();
    doc.get_pages()
        .values()
        .map(|id| {
            let content = doc.get_page_content(*id).unwrap();
            let text = String::from_utf8_lossy(&content);
            text.lines()
                .find_map(|l| l.strip_prefix("% source page "))
                .and_then(|n| n.trim().parse().ok())
                .unwrap()
        })
        .collect()
}

// ── Fake conversion service ──────────────────────────────────────────────────

/// Markdown the fake service returns for a chunk covering `start..=end`.
///
/// Page markers restart at 1, as the real service numbers pages per upload.
pub fn fake_markdown(start: u32, end: u32) -> String {
    (start..=end)
        .enumerate()
        .map(|(i, p)| format!("## Page {}\n\nText from source page {p}.\n\n", i + 1))
        .collect()
}

/// In-memory stand-in for the conversion service.
///
/// Records become ready after `ready_after` pending fetches. Chunks named in
/// `fail` are reported as failed; `rate_limit_every` rejects every n-th
/// upload with HTTP 429.
#[derive(Default)]
pub struct FakeService {
    pub ready_after: u32,
    pub fail: HashSet<String>,
    pub rate_limit_every: Option<u32>,
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    records: HashMap<String, String>,
    fetches: HashMap<String, u32>,
    submit_calls: u32,
    next_id: u32,
}

impl FakeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready_after(mut self, fetches: u32) -> Self {
        self.ready_after = fetches;
        self
    }

    pub fn failing(mut self, chunk: &str) -> Self {
        self.fail.insert(chunk.to_string());
        self
    }

    pub fn rate_limit_every(mut self, n: u32) -> Self {
        self.rate_limit_every = Some(n);
        self
    }

    /// Accepted uploads, one per remote job.
    pub fn submissions(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    /// Chunk names that were uploaded, sorted.
    pub fn submitted_chunks(&self) -> Vec<String> {
        let mut v: Vec<String> = self.state.lock().unwrap().records.values().cloned().collect();
        v.sort();
        v
    }
}

#[async_trait]
impl ConversionClient for FakeService {
    async fn submit(&self, chunk: &Path) -> Result<String, RelayError> {
        let name = chunk.file_name().unwrap().to_string_lossy().into_owned();
        let mut state = self.state.lock().unwrap();
        state.submit_calls += 1;
        if let Some(n) = self.rate_limit_every {
            if state.submit_calls % n == 0 {
                return Err(RelayError::RateLimited {
                    chunk: name,
                    retry_after_secs: None,
                });
            }
        }
        state.next_id += 1;
        let id = format!("rec-{:04}", state.next_id);
        state.records.insert(id.clone(), name);
        Ok(id)
    }

    async fn fetch(&self, record_id: &str) -> Result<FetchOutcome, RelayError> {
        let mut state = self.state.lock().unwrap();
        let Some(name) = state.records.get(record_id).cloned() else {
            return Err(RelayError::Fetch {
                record_id: record_id.to_string(),
                reason: "unknown record".into(),
            });
        };
        if self.fail.contains(&name) {
            return Ok(FetchOutcome::Failed("conversion error".into()));
        }
        let seen = state.fetches.entry(record_id.to_string()).or_insert(0);
        if *seen < self.ready_after {
            *seen += 1;
            return Ok(FetchOutcome::Pending {
                pages_processed: Some(*seen),
            });
        }
        let chunk = ChunkName::parse(&name).unwrap();
        Ok(FetchOutcome::Ready(fake_markdown(chunk.start, chunk.end)))
    }

    async fn status(&self, record_id: &str) -> Result<RecordStatus, RelayError> {
        let state = self.state.lock().unwrap();
        Ok(match state.records.get(record_id) {
            Some(name) => RecordStatus {
                record_id: record_id.to_string(),
                success: true,
                status: Some("processing".into()),
                filename: Some(name.clone()),
                ..Default::default()
            },
            None => RecordStatus {
                record_id: record_id.to_string(),
                detail: Some("not found".into()),
                ..Default::default()
            },
        })
    }
}

// ── Test environment ─────────────────────────────────────────────────────────

/// Input, output and lock paths inside one temporary directory.
pub struct Env {
    pub dir: tempfile::TempDir,
    pub input: PathBuf,
    pub output: PathBuf,
    pub archive: PathBuf,
    pub lock: PathBuf,
}

impl Env {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("output");
        std::fs::create_dir_all(&input).unwrap();
        Self {
            archive: output.join("done"),
            lock: dir.path().join("relay.lock"),
            input,
            output,
            dir,
        }
    }

    /// Page-driven limits small enough for tiny fixtures: at most 4 pages
    /// per upload, chunks of 3.
    pub fn page_limits() -> Limits {
        Limits {
            size_limit_bytes: 50 * 1024 * 1024,
            size_target_bytes: 40 * 1024 * 1024,
            page_limit: 4,
            page_target: 3,
        }
    }

    pub fn config(&self, limits: Limits) -> RelayConfig {
        RelayConfig::builder()
            .limits(limits)
            .input_dir(&self.input)
            .output_dir(&self.output)
            .lock_path(&self.lock)
            .max_retries(0)
            .retry_backoff_ms(1)
            .build()
            .unwrap()
    }

    pub fn relay(&self, limits: Limits, service: Arc<FakeService>) -> Relay {
        Relay::new(self.config(limits), Arc::new(LopdfEngine), service)
    }

    /// Drop a PDF of `pages` pages into the input folder.
    pub fn add_pdf(&self, name: &str, pages: u32) -> PathBuf {
        let path = self.input.join(name);
        write_pdf(&path, pages, |_| 0);
        path
    }

    /// Sorted file names directly inside `dir`; empty if it does not exist.
    pub fn files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = match std::fs::read_dir(dir) {
            Ok(rd) => rd
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}
