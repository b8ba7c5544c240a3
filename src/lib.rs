//! # pdf2md-relay
//!
//! Convert arbitrarily large PDF (and DjVu) documents to Markdown through a
//! remote conversion service that rejects uploads above a size or page
//! limit.
//!
//! The relay cuts each document into chunks the service accepts, submits
//! them, collects the results across as many runs as it takes, shifts each
//! chunk's page numbers to their place in the whole document, and joins
//! them into one Markdown file.
//!
//! ## Pipeline Overview
//!
//! ```text
//! source (input/)
//!  │
//!  ├─ 1. Input     DjVu → PDF via ddjvu (cached)
//!  ├─ 2. Probe     size + page count (lopdf, spawn_blocking)
//!  ├─ 3. Plan      page ranges within the service limits
//!  ├─ 4. Split     <base>_pages_S_E.pdf per range
//!  ├─ 5. Submit    upload, write <chunk>.pdf.lock with the record id
//!  ├─ 6. Retrieve  fetch once per pass, write <chunk>.md, drop the marker
//!  ├─ 7. Finalize  renumber "## Page n", join → <base>_concat_pages_1_N.md
//!  └─ 8. Archive   move everything to output/done/
//! ```
//!
//! All progress lives in the output folder. Any step can be interrupted and
//! the next [`ReconciliationLoop::run_pass`] picks up where it stopped.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf2md_relay::{Relay, RelayConfig, ReconciliationLoop};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig::builder()
//!         .input_dir("input")
//!         .output_dir("output")
//!         .api_key(std::env::var("PDF2MD_RELAY_API_KEY")?)
//!         .build()?;
//!     let pass = ReconciliationLoop::new(Relay::from_config(config)?).run_pass().await?;
//!     eprintln!("{} archived, {} errors", pass.archived_count(), pass.error_count());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2md-relay` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod client;
pub mod config;
pub mod convert;
pub mod daemon;
pub mod error;
pub mod naming;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod workspace;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use client::{ConversionClient, FetchOutcome, HttpConversionClient, RecordStatus};
pub use config::{Limits, RelayConfig, RelayConfigBuilder};
pub use convert::Relay;
pub use daemon::{infer_state, InstanceLock, ReconciliationLoop};
pub use error::{ChunkError, RelayError};
pub use naming::ChunkName;
pub use output::{ChunkPlanReport, DocumentReport, DocumentState, PassReport, RetrievalSummary};
pub use pipeline::plan::{plan, ChunkPlan, PageRange, SplitStrategy};
pub use pipeline::probe::{DocumentInfo, LopdfEngine, PdfEngine};
pub use pipeline::renumber::{ConcatReport, RenumberOutcome};
pub use pipeline::tracker::{JobMarker, JobStateTracker, RetrieveOutcome};
pub use progress::{NoopProgressCallback, ProgressCallback, RelayProgressCallback};
pub use workspace::Workspace;
