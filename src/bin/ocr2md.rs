//! CLI binary for ocr2md.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ConvertConfig`, renders batch progress, and prints results.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use ocr2md::{
    BatchDriver, BatchProgressCallback, ClientTimeouts, ConvertConfig, Credentials,
    DocumentOutcome, DocumentService, ErrorKind, ListQuery, NamingPolicy, OutputFormat,
    ProgressCallback, RemoteClient, SubmitOptions,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
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

/// Terminal progress callback: one bar for the whole batch plus per-document
/// log lines. Designed to stay coherent when documents complete out of order.
struct CliBatchProgress {
    bar: ProgressBar,
    start_times: Mutex<HashMap<PathBuf, Instant>>,
    errors: AtomicUsize,
}

impl CliBatchProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0); // length set in on_batch_start

        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }
}

impl BatchProgressCallback for CliBatchProgress {
    fn on_batch_start(&self, total_inputs: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} documents  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total_inputs as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Converting");
    }

    fn on_item_start(&self, input: &Path) {
        self.start_times
            .lock()
            .unwrap()
            .insert(input.to_path_buf(), Instant::now());
    }

    fn on_item_pages(&self, input: &Path, received: usize, expected: Option<usize>) {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match expected {
            Some(total) => self.bar.set_message(format!("{name}: page {received}/{total}")),
            None => self.bar.set_message(format!("{name}: page {received}")),
        }
    }

    fn on_item_complete(&self, input: &Path, outcome: &DocumentOutcome) {
        let elapsed = self
            .start_times
            .lock()
            .unwrap()
            .remove(input)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let pages = match outcome.expected_pages {
            Some(total) => format!("{}/{} pages", outcome.pages_received, total),
            None if outcome.skipped => "already converted".to_string(),
            None => format!("{} pages", outcome.pages_received),
        };
        let mut notes = String::new();
        if !outcome.missing_pages.is_empty() {
            notes.push_str(&format!("  {} page(s) missing", outcome.missing_pages.len()));
        }
        if !outcome.asset_failures.is_empty() {
            notes.push_str(&format!("  {} asset(s) failed", outcome.asset_failures.len()));
        }

        self.bar.println(format!(
            "  {} {}  {}  {}{}",
            green("✓"),
            input.file_name().unwrap_or_default().to_string_lossy(),
            dim(&pages),
            dim(&format!("{elapsed:.1}s")),
            red(&notes),
        ));
        self.bar.inc(1);
    }

    fn on_item_error(&self, input: &Path, kind: ErrorKind, detail: &str) {
        let elapsed = self
            .start_times
            .lock()
            .unwrap()
            .remove(input)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        self.errors.fetch_add(1, Ordering::SeqCst);

        // Truncate very long error messages to keep output tidy.
        let msg = if detail.len() > 80 {
            format!("{}\u{2026}", &detail[..79])
        } else {
            detail.to_string()
        };

        self.bar.println(format!(
            "  {} {}  [{kind}] {}  {}",
            red("✗"),
            input.file_name().unwrap_or_default().to_string_lossy(),
            red(&msg),
            dim(&format!("{elapsed:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, succeeded: usize, failed: usize) {
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} document(s) converted successfully",
                green("✔"),
                bold(&succeeded.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} documents converted  ({} failed)",
                if succeeded == 0 { red("✘") } else { cyan("⚠") },
                bold(&succeeded.to_string()),
                succeeded + failed,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one document (outputs land next to it)
  ocr2md paper.pdf

  # Convert a folder with 2 documents in flight
  ocr2md ./papers -o ./converted -c 2

  # Also download Word and structured-JSON outputs
  ocr2md paper.pdf --formats docx,lines.json

  # Keep remote image links (skip localization)
  ocr2md paper.pdf --no-images

  # Trust the stream; skip the final status double-check
  ocr2md paper.pdf --skip-status-check

  # Polling only (no stream)
  ocr2md paper.pdf --no-streaming

  # List documents stored on the server
  ocr2md --list-documents --per-page 20

  # JSON result summary for scripting
  ocr2md ./papers --json > results.json

OUTPUT LAYOUT:
  <out-dir>/<stem>-<id>/<stem>.mmd        primary Markdown text
  <out-dir>/<stem>-<id>/<stem>.docx       extra formats, if requested
  <out-dir>/<stem>-<id>/images/…          localized assets

  With --naming stable (default), <id> is a content digest: resubmitting an
  unchanged file is detected and skipped. Use --force to redo it.

ENVIRONMENT VARIABLES:
  MATHPIX_APP_ID    API application id
  MATHPIX_APP_KEY   API application key

EXIT STATUS:
  0 if every input converted; 1 if any input failed. A failing input never
  aborts the rest of the batch.
"#;

/// Convert documents to Markdown through a remote OCR service.
#[derive(Parser, Debug)]
#[command(
    name = "ocr2md",
    version,
    about = "Convert documents to Markdown through a remote OCR service",
    long_about = "Batch-convert documents to Markdown through a remote OCR service. \
Results are acquired over a live page-event stream with automatic fallback to status \
polling, and remotely-hosted images are downloaded and rewritten to local paths so the \
output is self-contained.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Document file or directory of documents (.pdf).
    input: Option<PathBuf>,

    /// Directory for output subtrees (default: alongside the input).
    #[arg(short, long, env = "OCR2MD_OUT_DIR")]
    out_dir: Option<PathBuf>,

    /// API application id.
    #[arg(long, env = "MATHPIX_APP_ID", hide_env_values = true)]
    app_id: Option<String>,

    /// API application key.
    #[arg(long, env = "MATHPIX_APP_KEY", hide_env_values = true)]
    app_key: Option<String>,

    /// API base URL override (testing / self-hosted gateways).
    #[arg(long, env = "OCR2MD_BASE_URL")]
    base_url: Option<String>,

    /// Number of documents processed simultaneously.
    #[arg(short, long, env = "OCR2MD_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Disable the page-event stream; poll and download instead.
    #[arg(long)]
    no_streaming: bool,

    /// Skip the status double-check when the stream ends early
    /// (faster, but truncated output is only detected, not repaired).
    #[arg(long)]
    skip_status_check: bool,

    /// Extra output formats: md, docx, lines.json (comma-separated).
    #[arg(long, value_delimiter = ',')]
    formats: Vec<String>,

    /// Keep remote image links instead of localizing them.
    #[arg(long)]
    no_images: bool,

    /// Re-convert inputs whose output already exists; re-fetch assets.
    #[arg(long)]
    force: bool,

    /// Delete the server-side result after a successful conversion.
    #[arg(long)]
    delete_remote: bool,

    /// Output subtree naming: stable (content digest) or random.
    #[arg(long, value_enum, default_value = "stable")]
    naming: NamingArg,

    /// Maximum seconds to wait in the polling fallback.
    #[arg(long, default_value_t = 300)]
    max_wait: u64,

    /// Seconds between status polls.
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,

    /// Page range forwarded to the service (e.g. "1-5").
    #[arg(long)]
    page_ranges: Option<String>,

    /// Print the batch summary as JSON instead of text.
    #[arg(long)]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "OCR2MD_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "OCR2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "OCR2MD_QUIET")]
    quiet: bool,

    /// List documents stored on the server, then exit.
    #[arg(long)]
    list_documents: bool,

    /// Page number for --list-documents.
    #[arg(long, default_value_t = 1)]
    page: u32,

    /// Results per page for --list-documents.
    #[arg(long, default_value_t = 50)]
    per_page: u32,

    /// Filter --list-documents from this date (YYYY-MM-DD).
    #[arg(long)]
    from_date: Option<String>,

    /// Filter --list-documents to this date (YYYY-MM-DD).
    #[arg(long)]
    to_date: Option<String>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum NamingArg {
    Stable,
    Random,
}

impl From<NamingArg> for NamingPolicy {
    fn from(v: NamingArg) -> Self {
        match v {
            NamingArg::Stable => NamingPolicy::Stable,
            NamingArg::Random => NamingPolicy::Random,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Config and client ────────────────────────────────────────────────
    let config = build_config(&cli)?;

    let credentials = match (cli.app_id.clone(), cli.app_key.clone()) {
        (Some(app_id), Some(app_key)) if !app_id.is_empty() && !app_key.is_empty() => {
            Credentials { app_id, app_key }
        }
        _ => Credentials::from_env()
            .context("No API credentials (set MATHPIX_APP_ID and MATHPIX_APP_KEY)")?,
    };

    let client = match cli.base_url.as_deref() {
        Some(base) => RemoteClient::with_base_url(credentials, base),
        None => RemoteClient::new(credentials),
    }
    .context("Failed to construct API client")?
    .timeouts(ClientTimeouts {
        submit: Duration::from_secs(config.submit_timeout_secs),
        status: Duration::from_secs(config.status_timeout_secs),
        stream: Duration::from_secs(config.stream_timeout_secs),
        download: Duration::from_secs(config.download_timeout_secs),
        asset: Duration::from_secs(config.asset_timeout_secs),
    });
    let service: Arc<dyn DocumentService> = Arc::new(client);

    // ── List-documents mode ──────────────────────────────────────────────
    if cli.list_documents {
        return list_documents(&cli, service.as_ref()).await;
    }

    // ── Gather inputs ────────────────────────────────────────────────────
    let input = cli
        .input
        .clone()
        .context("An input file or directory is required (or use --list-documents)")?;
    let inputs = gather_documents(&input)?;
    if !cli.quiet && !cli.json {
        eprintln!("Found {} document(s) to process", inputs.len());
    }

    let out_dir = match cli.out_dir.clone() {
        Some(dir) => dir,
        None => inputs[0]
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    // ── Build the driver ─────────────────────────────────────────────────
    let mut driver = BatchDriver::new(service, config);
    if show_progress {
        let cb = CliBatchProgress::new();
        driver = driver.with_progress(cb as ProgressCallback);
    }

    // Ctrl-C cancels in-flight work; finished documents keep their outputs.
    let cancel = driver.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted — cancelling in-flight documents…");
            cancel.cancel();
        }
    });

    // ── Run ──────────────────────────────────────────────────────────────
    let summary = driver.run(&inputs, &out_dir).await;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
        );
    } else if !cli.quiet && summary.results.len() > 1 {
        eprintln!("\nConversion summary:");
        for item in &summary.results {
            let name = item.input.file_name().unwrap_or_default().to_string_lossy();
            match &item.outcome {
                ocr2md::ItemOutcome::Success(outcome) => {
                    let pages = match outcome.expected_pages {
                        Some(total) => format!("{}/{} pages", outcome.pages_received, total),
                        None if outcome.skipped => "skipped (already converted)".to_string(),
                        None => format!("{} pages", outcome.pages_received),
                    };
                    eprintln!("{} {name}: {pages}", green("✓"));
                }
                ocr2md::ItemOutcome::Failure { kind, detail } => {
                    eprintln!("{} {name}: [{kind}] {detail}", red("✗"));
                }
            }
        }
    }

    std::process::exit(summary.exit_code());
}

/// Map CLI args to `ConvertConfig`.
fn build_config(cli: &Cli) -> Result<ConvertConfig> {
    let mut formats = Vec::new();
    for name in &cli.formats {
        let format = OutputFormat::parse(name)
            .with_context(|| format!("Unknown output format '{name}' (md, docx, lines.json)"))?;
        formats.push(format);
    }

    let submit = SubmitOptions {
        page_ranges: cli.page_ranges.clone(),
        ..SubmitOptions::default()
    };

    ConvertConfig::builder()
        .streaming(!cli.no_streaming)
        .skip_status_check(cli.skip_status_check)
        .concurrency(cli.concurrency)
        .extra_formats(formats)
        .localize_images(!cli.no_images)
        .force(cli.force)
        .delete_remote(cli.delete_remote)
        .naming(cli.naming.into())
        .max_poll_secs(cli.max_wait)
        .poll_interval_secs(cli.poll_interval)
        .submit_options(submit)
        .build()
        .context("Invalid configuration")
}

/// Expand the input argument into a list of documents.
fn gather_documents(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_dir() {
        let mut docs: Vec<PathBuf> = std::fs::read_dir(input)
            .with_context(|| format!("Failed to read directory {}", input.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
            })
            .collect();
        docs.sort();
        anyhow::ensure!(!docs.is_empty(), "No PDF documents in {}", input.display());
        Ok(docs)
    } else if input.is_file() {
        Ok(vec![input.to_path_buf()])
    } else {
        anyhow::bail!("No document(s) found at {}", input.display())
    }
}

/// Print the server-side document list as a table (or JSON).
async fn list_documents(cli: &Cli, service: &dyn DocumentService) -> Result<()> {
    let query = ListQuery {
        page: cli.page,
        per_page: cli.per_page,
        from_date: cli
            .from_date
            .as_deref()
            .map(|d| parse_day(d, false))
            .transpose()?,
        to_date: cli
            .to_date
            .as_deref()
            .map(|d| parse_day(d, true))
            .transpose()?,
    };

    let list = service
        .list_documents(&query)
        .await
        .context("Failed to retrieve document list")?;

    if list.pdfs.is_empty() {
        println!("No documents found.");
        return Ok(());
    }

    println!(
        "{:<36} {:<30} {:<12} {:<24} {:<10}",
        "ID", "File", "Status", "Created", "Pages"
    );
    println!("{}", "-".repeat(110));
    for doc in &list.pdfs {
        let status: String = doc
            .status
            .clone()
            .map(Into::into)
            .unwrap_or_else(|| "unknown".to_string());
        let file = Path::new(&doc.input_file)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| doc.input_file.clone());
        println!(
            "{:<36} {:<30} {:<12} {:<24} {:<10}",
            doc.id,
            file,
            status,
            doc.created_at,
            format!("{}/{}", doc.num_pages_completed, doc.num_pages),
        );
    }

    if list.pdfs.len() as u32 == cli.per_page {
        println!(
            "\nShowing page {}. For more results, use --page {}",
            cli.page,
            cli.page + 1
        );
    }
    Ok(())
}

/// Parse a `YYYY-MM-DD` day into the start (or end) of that day, UTC.
fn parse_day(s: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{s}' (expected YYYY-MM-DD)"))?;
    let time = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    }
    .context("Invalid time of day")?;
    Ok(Utc.from_utc_datetime(&time))
}
