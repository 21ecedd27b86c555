//! CLI binary for pdfscan.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, runs a batch and prints the summary.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pdfscan::{
    BatchOutcome, BatchSummary, ComponentType, FixedTarget, PerPageBaseline, Pipeline, PipelineConfig,
    PipelineProgressCallback, ProgressCallback,
};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
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

/// One bar over every page of the batch. Its length grows as documents are
/// opened, since page counts are unknown until then.
struct CliProgressCallback {
    bar: ProgressBar,
    page_errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>4}/{len} pages  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        let bar = ProgressBar::new(0);
        bar.set_style(style);
        bar.set_prefix("Scanning");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            page_errors: AtomicUsize::new(0),
        })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_documents: usize) {
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {total_documents} documents…"))
        ));
    }

    fn on_document_start(&self, filename: &str, total_pages: usize) {
        self.bar.inc_length(total_pages as u64);
        self.bar.set_message(filename.to_string());
    }

    fn on_page_complete(&self, _filename: &str, _page_number: usize, _component_count: usize) {
        self.bar.inc(1);
    }

    fn on_page_error(&self, filename: &str, page_number: usize, error: &str) {
        self.page_errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            let head: String = error.chars().take(79).collect();
            format!("{head}\u{2026}")
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {} page {:>3}  {}",
            red("✗"),
            filename,
            page_number,
            red(&msg)
        ));
        self.bar.inc(1);
    }

    fn on_document_complete(&self, filename: &str, total_components: usize, completeness: f64) {
        self.bar.println(format!(
            "  {} {:<40}  {}  {}",
            green("✓"),
            filename,
            dim(&format!("{total_components:>5} components")),
            dim(&format!("completeness {completeness:.2}")),
        ));
    }

    fn on_document_error(&self, filename: &str, error: &str) {
        self.bar
            .println(format!("  {} {:<40}  {}", red("✘"), filename, red(error)));
    }

    fn on_batch_complete(&self, _succeeded: usize, _failed: usize) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Every PDF in ./pdfs → ./processed_json/<name>.json
  pdfscan --input-dir pdfs

  # One file, a specific model
  pdfscan --file tender.pdf --provider openai --model gpt-4.1

  # A remote document
  pdfscan --file https://example.com/annual-report.pdf

  # First 10 files, 8 pages in flight, print the batch summary as JSON
  pdfscan --input-dir pdfs --limit 10 --concurrency 8 --json

OUTPUT:
  One JSON report per document, named after the source file stem, holding
  every page's components (text, table, image, header, footer) with content,
  confidence and a pixel bounding box at the rendering DPI, plus per-type
  statistics, average confidence and completeness.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium (otherwise ./ then the system path)
"#;

/// Extract structured page components from PDF documents using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pdfscan",
    version,
    about = "Extract structured page components from PDFs using Vision LLMs",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Directory scanned for input documents.
    #[arg(long, env = "PDFSCAN_INPUT_DIR", default_value = "pdfs")]
    input_dir: PathBuf,

    /// Directory receiving one JSON report per document.
    #[arg(short, long, env = "PDFSCAN_OUTPUT_DIR", default_value = "processed_json")]
    output_dir: PathBuf,

    /// Process a single file or HTTP/HTTPS URL instead of a directory.
    #[arg(short, long, env = "PDFSCAN_FILE")]
    file: Option<String>,

    /// Glob pattern applied inside the input directory.
    #[arg(long, env = "PDFSCAN_PATTERN", default_value = "*.pdf")]
    pattern: String,

    /// Process at most this many documents.
    #[arg(long, env = "PDFSCAN_LIMIT")]
    limit: Option<usize>,

    /// LLM model ID (e.g. gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Rendering DPI (72–600). Bounding boxes are in pixels at this DPI.
    #[arg(long, env = "PDFSCAN_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Pages in flight at once across all documents.
    #[arg(short, long, env = "PDFSCAN_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Documents processed at once.
    #[arg(long, env = "PDFSCAN_BATCH_SIZE", default_value_t = 2)]
    batch_size: usize,

    /// Total attempts per page for transient service failures.
    #[arg(long, env = "PDFSCAN_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Base backoff delay between attempts, in milliseconds.
    #[arg(long, env = "PDFSCAN_RETRY_DELAY_MS", default_value_t = 2000)]
    retry_delay_ms: u64,

    /// Regenerations allowed when a reply fails schema validation.
    #[arg(long, env = "PDFSCAN_VALIDATION_RETRIES", default_value_t = 1)]
    validation_retries: u32,

    /// Per-call timeout for the remote service, in seconds.
    #[arg(long, env = "PDFSCAN_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// HTTP download timeout for URL inputs, in seconds.
    #[arg(long, env = "PDFSCAN_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Max LLM output tokens per page.
    #[arg(long, env = "PDFSCAN_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PDFSCAN_TEMPERATURE", default_value_t = 0.5)]
    temperature: f32,

    /// Expected components per page, used for completeness.
    #[arg(long, env = "PDFSCAN_EXPECTED_PER_PAGE", default_value_t = 8)]
    expected_per_page: usize,

    /// Fixed expected component count per document; overrides the per-page baseline.
    #[arg(long, env = "PDFSCAN_EXPECTED_TOTAL")]
    expected_total: Option<usize>,

    /// Root directory for temporary page images.
    #[arg(long, env = "PDFSCAN_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDFSCAN_PASSWORD")]
    password: Option<String>,

    /// Path to a text file replacing the built-in extraction instruction.
    #[arg(long, env = "PDFSCAN_INSTRUCTION")]
    instruction: Option<PathBuf>,

    /// Print the batch summary as JSON on stdout.
    #[arg(long, env = "PDFSCAN_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDFSCAN_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDFSCAN_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDFSCAN_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless --verbose is given.
    let show_progress = !cli.quiet && !cli.no_progress;
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

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb).await?;
    let pipeline = Pipeline::from_config(config).context("Failed to initialise pipeline")?;

    // Ctrl-C stops new work; running documents still write their reports.
    let cancel = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} Cancelling: finishing documents already in progress…", cyan("⚠"));
            cancel.cancel();
        }
    });

    let outcome = match cli.file {
        Some(ref file) => pipeline.process_batch([file]).await,
        None => pipeline
            .process_directory(&cli.input_dir, &cli.pattern, cli.limit)
            .await
            .context("Failed to list input documents")?,
    };

    let summary = outcome.summary();
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
        );
    } else if !cli.quiet {
        print_summary(&outcome, &summary, &cli.output_dir);
    }

    if outcome.run_failed() {
        match outcome.failures.iter().find(|f| f.error.is_fatal_to_run()) {
            Some(fatal) => bail!("Run aborted on {}: {}", fatal.source, fatal.error),
            None => bail!("All {} documents failed", outcome.failures.len()),
        }
    }
    Ok(())
}

fn print_summary(outcome: &BatchOutcome, summary: &BatchSummary, output_dir: &std::path::Path) {
    let failed_pages: usize = outcome.documents.iter().map(|d| d.page_errors.len()).sum();
    let mark = if outcome.is_complete_success() {
        green("✔")
    } else {
        cyan("⚠")
    };

    eprintln!(
        "{} {} documents  {} pages  {} components  →  {}",
        mark,
        bold(&summary.total_documents.to_string()),
        summary.total_pages,
        summary.total_components,
        bold(&output_dir.display().to_string()),
    );
    eprintln!(
        "   average confidence {:.2}  /  average completeness {:.2}",
        summary.average_confidence, summary.average_completeness
    );

    let breakdown: Vec<String> = ComponentType::ALL
        .iter()
        .map(|k| format!("{k} {}", summary.component_breakdown.get(*k)))
        .collect();
    eprintln!("   {}", dim(&breakdown.join("  ")));

    if failed_pages > 0 {
        eprintln!("   {} pages failed and were recorded empty", red(&failed_pages.to_string()));
    }
    for failure in &outcome.failures {
        eprintln!("   {} {}: {}", red("✘"), failure.source, failure.error);
    }
    if !outcome.cancelled.is_empty() {
        eprintln!("   {} documents not started (cancelled)", outcome.cancelled.len());
    }
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .dpi(cli.dpi)
        .concurrency(cli.concurrency)
        .batch_size(cli.batch_size)
        .max_retries(cli.max_retries)
        .retry_base_delay_ms(cli.retry_delay_ms)
        .max_validation_retries(cli.validation_retries)
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .output_dir(&cli.output_dir);

    builder = match cli.expected_total {
        Some(total) => builder.expectation(Arc::new(FixedTarget(total))),
        None => builder.expectation(Arc::new(PerPageBaseline {
            per_page: cli.expected_per_page,
        })),
    };

    if let Some(ref path) = cli.instruction {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read instruction from {:?}", path))?;
        builder = builder.instruction(text);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref dir) = cli.scratch_dir {
        builder = builder.scratch_dir(dir);
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
