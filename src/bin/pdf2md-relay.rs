//! CLI binary for pdf2md-relay.
//!
//! A thin shim over the library crate that maps CLI flags to `RelayConfig`,
//! picks one mode, and prints the resulting report.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pdf2md_relay::{
    ChunkPlanReport, DocumentReport, Limits, PassReport, ProgressCallback, ReconciliationLoop, Relay,
    RelayConfig, RelayProgressCallback, RenumberOutcome, RetrievalSummary, SplitStrategy,
};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner plus one log line per chunk event.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
        );
        bar.set_prefix("Preparing");
        bar.set_message("probing and splitting…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl RelayProgressCallback for CliProgressCallback {
    fn on_document_start(&self, document: &str, chunk_count: usize) {
        self.bar.set_prefix("Uploading");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{document}: {chunk_count} chunk(s)"))
        ));
    }

    fn on_chunk_submitted(&self, chunk: &str, record_id: &str) {
        self.bar.set_message(chunk.to_string());
        self.bar.println(format!("  {} {}  {}", green("↑"), chunk, dim(&format!("record {record_id}"))));
    }

    fn on_chunk_retrieved(&self, chunk: &str, markdown_len: usize) {
        self.bar.set_prefix("Retrieving");
        self.bar.println(format!(
            "  {} {}  {}",
            green("✓"),
            chunk,
            dim(&format!("{markdown_len} bytes"))
        ));
    }

    fn on_chunk_pending(&self, chunk: &str, pages_processed: Option<u32>) {
        self.bar.set_prefix("Retrieving");
        let progress = pages_processed
            .map(|p| format!("{p} page(s) done"))
            .unwrap_or_else(|| "processing".to_string());
        self.bar.println(format!("  {} {}  {}", yellow("…"), chunk, dim(&progress)));
    }

    fn on_chunk_error(&self, chunk: &str, error: &str) {
        let msg: String = if error.chars().count() > 100 {
            format!("{}\u{2026}", error.chars().take(99).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!("  {} {}  {}", red("✗"), chunk, red(&msg)));
    }

    fn on_document_finalized(&self, document: &str, total_pages: u32) {
        self.bar.println(format!(
            "{} {}",
            green("✔"),
            bold(&format!("{document}: {total_pages} pages concatenated"))
        ));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Show how a document would be split
  pdf2md-relay --dry-run book.pdf

  # Split, upload, and try one retrieval
  pdf2md-relay book.pdf --output-dir output

  # Later: collect whatever has finished
  pdf2md-relay --retrieve-only book.pdf

  # Shift page numbers and join the chunk outputs
  pdf2md-relay --concat-mds book.pdf

  # One reconciliation pass over input/ (run from cron every few minutes)
  pdf2md-relay --daemon --input-dir input --output-dir output --log-file relay.log

  # Ask the service about specific records
  pdf2md-relay --file-status 1a2b3c,4d5e6f

FILES (in --output-dir):
  <base>_pages_S_E.pdf        chunk uploaded to the service
  <base>_pages_S_E.pdf.lock   submitted, result not yet retrieved
  <base>_pages_S_E.md         retrieved (and later renumbered) chunk output
  <base>_concat_pages_1_N.md  final document
  done/                       archive of finished documents

ENVIRONMENT VARIABLES:
  PDF2MD_RELAY_API_KEY   Conversion service API key (required except for
                         --dry-run, --page-renumber, --concat-mds)
  PDF2MD_RELAY_API_URL   Service base URL
  RUST_LOG               Overrides --verbose / --quiet log filtering
"#;

/// Convert oversized PDF/DjVu documents to Markdown through a size-limited service.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2md-relay",
    version,
    about = "Split, submit, retrieve, and reassemble large documents as Markdown",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF or DjVu file (not needed with --daemon or --file-status).
    input: Option<PathBuf>,

    /// Folder for chunks, markers and outputs.
    #[arg(long, env = "PDF2MD_RELAY_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// Print the chunk plan without splitting or uploading.
    #[arg(long)]
    dry_run: bool,

    /// Upload the file as-is, without planning or splitting.
    #[arg(long, conflicts_with_all = ["dry_run", "retrieve_only"])]
    convert_only: bool,

    /// Skip uploads; only retrieve chunks that already have markers.
    #[arg(long)]
    retrieve_only: bool,

    /// Comma-separated record ids to query.
    #[arg(long, value_delimiter = ',')]
    file_status: Option<Vec<String>>,

    /// Renumber "## Page N" markers of the file's chunk outputs.
    #[arg(long)]
    page_renumber: bool,

    /// Renumber, then concatenate the file's chunk outputs.
    #[arg(long)]
    concat_mds: bool,

    /// Run one reconciliation pass over --input-dir and exit.
    #[arg(long)]
    daemon: bool,

    /// Folder the daemon takes documents from.
    #[arg(long, env = "PDF2MD_RELAY_INPUT_DIR", default_value = "input")]
    input_dir: PathBuf,

    /// Archive for finished documents. Default: <output-dir>/done.
    #[arg(long, env = "PDF2MD_RELAY_ARCHIVE_DIR")]
    archive_dir: Option<PathBuf>,

    /// Instance lock for daemon passes. Default: <tmp>/pdf2md-relay.lock.
    #[arg(long, env = "PDF2MD_RELAY_LOCK_FILE")]
    lock_file: Option<PathBuf>,

    /// Minutes without a refresh after which a held lock is reported as hung.
    #[arg(long, env = "PDF2MD_RELAY_STALE_LOCK_MINS", default_value_t = 120)]
    stale_lock_mins: u64,

    /// Append logs to this file (no colours) instead of stderr.
    #[arg(long, env = "PDF2MD_RELAY_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Service upload size limit in MiB.
    #[arg(long, env = "PDF2MD_RELAY_SIZE_LIMIT_MB", default_value_t = 50)]
    size_limit_mb: u64,

    /// Chunk size to aim for when splitting by size, in MiB.
    #[arg(long, env = "PDF2MD_RELAY_SIZE_TARGET_MB", default_value_t = 40)]
    size_target_mb: u64,

    /// Service page limit.
    #[arg(long, env = "PDF2MD_RELAY_PAGE_LIMIT", default_value_t = 200)]
    page_limit: u32,

    /// Chunk width when splitting by page count.
    #[arg(long, env = "PDF2MD_RELAY_PAGE_TARGET", default_value_t = 190)]
    page_target: u32,

    /// Conversion service API key.
    #[arg(long, env = "PDF2MD_RELAY_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Conversion service base URL.
    #[arg(long, env = "PDF2MD_RELAY_API_URL")]
    api_url: Option<String>,

    /// Per-request HTTP timeout in seconds.
    #[arg(long, env = "PDF2MD_RELAY_HTTP_TIMEOUT", default_value_t = 300)]
    http_timeout: u64,

    /// In-pass retries of a failed upload.
    #[arg(long, env = "PDF2MD_RELAY_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Print reports as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Disable the progress display.
    #[arg(long, env = "PDF2MD_RELAY_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2MD_RELAY_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2MD_RELAY_QUIET")]
    quiet: bool,
}

impl Cli {
    fn require_input(&self, mode: &str) -> Result<&Path> {
        match self.input.as_deref() {
            Some(p) => Ok(p),
            None => bail!("an input file is required with {mode}"),
        }
    }

    /// Modes that print live per-chunk lines.
    fn wants_progress(&self) -> bool {
        !self.quiet
            && !self.no_progress
            && !self.json
            && !self.daemon
            && !self.dry_run
            && self.file_status.is_none()
            && !self.page_renumber
            && !self.concat_mds
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let show_progress = cli.wants_progress();
    init_logging(&cli, show_progress)?;

    let progress = show_progress.then(CliProgressCallback::new);
    let config = build_config(&cli, progress.clone().map(|p| p as ProgressCallback))?;

    let result = run(&cli, config).await;
    if let Some(p) = progress {
        p.finish();
    }
    result
}

fn init_logging(cli: &Cli, show_progress: bool) -> Result<()> {
    // The progress lines already say what INFO logs would.
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Cannot open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Map CLI args to `RelayConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<RelayConfig> {
    let limits = Limits::from_mib(cli.size_limit_mb, cli.size_target_mb, cli.page_limit, cli.page_target)
        .context("Invalid size limits")?;
    let mut builder = RelayConfig::builder()
        .limits(limits)
        .input_dir(&cli.input_dir)
        .output_dir(&cli.output_dir)
        .stale_lock_after(Duration::from_secs(cli.stale_lock_mins.saturating_mul(60)))
        .http_timeout_secs(cli.http_timeout)
        .max_retries(cli.max_retries);

    if let Some(dir) = &cli.archive_dir {
        builder = builder.archive_dir(dir);
    }
    if let Some(path) = &cli.lock_file {
        builder = builder.lock_path(path);
    }
    if let Some(key) = &cli.api_key {
        builder = builder.api_key(key);
    }
    if let Some(url) = &cli.api_url {
        builder = builder.api_base_url(url);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

async fn run(cli: &Cli, config: RelayConfig) -> Result<()> {
    // ── Modes that need no service access ────────────────────────────────
    if cli.dry_run || cli.page_renumber || cli.concat_mds {
        // Dummy key: these modes never reach the client.
        let config = RelayConfig {
            api_key: Some(config.api_key.clone().unwrap_or_else(|| "unused".into())),
            ..config
        };
        let relay = Relay::from_config(config)?;
        let input = cli.require_input(if cli.dry_run {
            "--dry-run"
        } else if cli.page_renumber {
            "--page-renumber"
        } else {
            "--concat-mds"
        })?;

        if cli.dry_run {
            let plan = relay.dry_run(input).await.context("Planning failed")?;
            return print_json_or(cli, &plan, || print_plan(&plan, relay.config()));
        }
        if cli.page_renumber {
            let results = relay.renumber(input).await.context("Renumbering failed")?;
            print_renumber(&results);
            return Ok(());
        }
        let report = relay.concatenate(input).await.context("Concatenation failed")?;
        return print_json_or(cli, &report, || {
            eprintln!(
                "{} {} chunk(s), pages 1-{} → {}",
                green("✔"),
                report.chunks,
                report.total_pages,
                bold(&report.path.display().to_string())
            )
        });
    }

    let relay = Relay::from_config(config).context("Cannot create service client")?;

    // ── Status query ─────────────────────────────────────────────────────
    if let Some(ids) = &cli.file_status {
        let statuses = relay.file_status(ids).await;
        if cli.json {
            let out: Vec<serde_json::Value> = statuses
                .iter()
                .map(|(id, r)| match r {
                    Ok(s) => serde_json::to_value(s).unwrap_or_default(),
                    Err(e) => serde_json::json!({ "record_id": id, "error": e.to_string() }),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
        } else {
            for (id, status) in statuses {
                println!("{}", bold(&format!("Record {id}")));
                match status {
                    Ok(s) if s.success => {
                        let na = || "N/A".to_string();
                        println!("  Status:          {}", s.status.unwrap_or_else(na));
                        println!("  Filename:        {}", s.filename.unwrap_or_else(na));
                        println!(
                            "  Pages processed: {}",
                            s.pages_processed.map(|p| p.to_string()).unwrap_or_else(na)
                        );
                        println!(
                            "  Processing time: {}",
                            s.processing_time.map(|t| format!("{t:.2}s")).unwrap_or_else(na)
                        );
                    }
                    Ok(s) => println!(
                        "  {} {}",
                        red("Error:"),
                        s.detail.unwrap_or_else(|| "file not found or invalid id".into())
                    ),
                    Err(e) => println!("  {} {}", red("Error:"), e),
                }
            }
        }
        return Ok(());
    }

    // ── Daemon pass ──────────────────────────────────────────────────────
    if cli.daemon {
        let pass = ReconciliationLoop::new(relay)
            .run_pass()
            .await
            .context("Reconciliation pass failed")?;
        return print_json_or(cli, &pass, || print_pass(&pass));
    }

    // ── Single document ──────────────────────────────────────────────────
    let input = cli.require_input("this mode")?;
    let report = if cli.convert_only {
        relay.convert_only(input).await.context("Conversion failed")?
    } else {
        relay
            .convert(input, cli.retrieve_only)
            .await
            .context("Conversion failed")?
    };
    print_json_or(cli, &report, || print_summary(&report, cli.quiet))
}

fn print_json_or<T: serde::Serialize>(cli: &Cli, value: &T, human: impl FnOnce()) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(value).context("Failed to serialise report")?);
    } else if !cli.quiet {
        human();
    }
    Ok(())
}

fn print_plan(plan: &ChunkPlanReport, config: &RelayConfig) {
    println!("{}", bold(&format!("Dry run: {}", plan.document)));
    println!(
        "  Size:   {:.2} MiB (limit {} MiB)",
        plan.size_bytes as f64 / (1024.0 * 1024.0),
        config.limits.size_limit_bytes / (1024 * 1024)
    );
    println!("  Pages:  {} (limit {})", plan.page_count, config.limits.page_limit);
    match plan.strategy {
        SplitStrategy::Whole => println!("  Within limits, no splitting required."),
        SplitStrategy::BySize { pages_per_chunk } => {
            println!("  Over the size limit: {pages_per_chunk} pages per chunk")
        }
        SplitStrategy::ByPages { pages_per_chunk } => {
            println!("  Over the page limit: {pages_per_chunk} pages per chunk")
        }
    }
    for (i, chunk) in plan.chunks.iter().enumerate() {
        println!(
            "  Chunk {:>3}: pages {:>5}-{:<5} → {}",
            i + 1,
            chunk.range.start,
            chunk.range.end,
            chunk.file_name
        );
    }
}

fn print_renumber(results: &[(String, Result<RenumberOutcome, pdf2md_relay::RelayError>)]) {
    if results.is_empty() {
        eprintln!("{} no chunk outputs found", yellow("⚠"));
    }
    for (name, result) in results {
        match result {
            Ok(RenumberOutcome::Renumbered { markers }) => {
                eprintln!("  {} {}  {}", green("✓"), name, dim(&format!("{markers} markers shifted")))
            }
            Ok(RenumberOutcome::AlreadyRenumbered) => {
                eprintln!("  {} {}  {}", green("✓"), name, dim("already correct"))
            }
            Ok(RenumberOutcome::NoMarkers) => eprintln!("  {} {}  {}", dim("-"), name, dim("no page markers")),
            Err(e) => eprintln!("  {} {}  {}", red("✗"), name, red(&e.to_string())),
        }
    }
}

fn print_summary(report: &DocumentReport, quiet: bool) {
    if quiet {
        return;
    }
    let s = RetrievalSummary::from(report);
    eprintln!("{}", "=".repeat(60));
    eprintln!("{}", bold(&format!("{}: retrieval complete", report.document)));
    eprintln!("  Retrieved:        {}/{}", green(&s.retrieved.to_string()), s.total);
    eprintln!("  Still processing: {}/{}", yellow(&s.pending.to_string()), s.total);
    if s.failed > 0 {
        eprintln!("  Failed:           {}/{}", red(&s.failed.to_string()), s.total);
    }
    for chunk in &report.oversize {
        eprintln!("  {} {} is over the size limit; the service may reject it", yellow("⚠"), chunk);
    }
    eprintln!("{}", "=".repeat(60));
    if s.pending > 0 {
        eprintln!(
            "{} chunk(s) still processing. Run again with --retrieve-only to collect them.",
            s.pending
        );
    } else if s.failed == 0 && s.retrieved > 0 {
        eprintln!("All chunks retrieved. Run with --concat-mds to build the final document.");
    }
}

fn print_pass(pass: &PassReport) {
    if !pass.lock_acquired {
        eprintln!("{} another pass is running; nothing done", yellow("⚠"));
        return;
    }
    for doc in &pass.documents {
        let mark = if doc.has_errors() { red("✗") } else { green("✓") };
        eprintln!(
            "{} {}  {}",
            mark,
            doc.document,
            dim(&format!(
                "{:?}: {} submitted, {} retrieved, {} pending{}",
                doc.state,
                doc.submitted.len(),
                doc.retrieved.len(),
                doc.pending.len(),
                if doc.archived { ", archived" } else { "" }
            ))
        );
        for err in &doc.errors {
            eprintln!("    {}", red(&err.to_string()));
        }
    }
    eprintln!(
        "{} {} document(s), {} archived, {} error(s)",
        cyan("◆"),
        pass.documents.len(),
        pass.archived_count(),
        pass.error_count()
    );
}
