//! CLI binary for pdf2json.
//!
//! A thin shim over the library crate: `serve` starts the HTTP API,
//! `process` runs all three stages on one file, `inspect` prints the spatial
//! layout without calling a model, and `usage` prints the cost summary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pdf2json::pipeline::content::{ContentExtractor, ExtractRequest};
use pdf2json::pipeline::input::resolve_input;
use pdf2json::pipeline::spatial;
use pdf2json::{
    ExtractionMode, FileStore, LayoutAnalysis, PageSelection, PdfiumExtractor, Pipeline, PipelineConfig,
    PipelineProgressCallback, Stage, StageOptions, UsageLog, UsageSummary,
};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
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

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner with one log line per finished stage.
struct CliProgressCallback {
    bar: ProgressBar,
    retries: AtomicU32,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            retries: AtomicU32::new(0),
        })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, _doc: &str, stage: Stage) {
        self.bar.set_prefix(format!("Stage {}/3", stage.number()));
        self.bar.set_message(stage.to_string());
    }

    fn on_attempt_failed(&self, _doc: &str, stage: Stage, attempt: u32, error: &str) {
        self.retries.fetch_add(1, Ordering::SeqCst);
        let msg: String = error.chars().take(80).collect();
        self.bar
            .println(format!("  {} {} attempt {}: {}", red("↻"), stage, attempt, dim(&msg)));
    }

    fn on_stage_complete(&self, _doc: &str, stage: Stage, attempts: u32) {
        self.bar.println(format!(
            "  {} {:<22} {}",
            green("✓"),
            stage.to_string(),
            dim(&format!("{attempts} request(s)"))
        ));
    }

    fn on_stage_error(&self, _doc: &str, stage: Stage, error: &str) {
        self.bar.println(format!("  {} {:<22} {}", red("✗"), stage.to_string(), red(error)));
    }

    fn on_page_complete(&self, _doc: &str, page: usize, total: usize) {
        self.bar.set_message(format!("extraction, page {page} of {total}"));
    }

    fn on_page_error(&self, _doc: &str, page: usize, _total: usize, error: &str) {
        let msg: String = error.chars().take(80).collect();
        self.bar.println(format!("  {} page {}: {}", red("✗"), page, dim(&msg)));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Start the HTTP API on port 8080
  pdf2json serve --port 8080

  # Run all three stages on a form, spatial layout for stages 2 and 3
  pdf2json process form.pdf --mode spatial -o form.json

  # Process a PDF from a URL, every page
  pdf2json process https://example.com/invoice.pdf --pages all

  # Long table: extract page by page and merge the rows
  pdf2json process rates.pdf --pages all --per-page

  # Show the word clusters the spatial mode sees (no API key needed)
  pdf2json inspect form.pdf

  # Cost of the last 30 days
  pdf2json usage --days 30

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY               OpenAI API key
  PDF2JSON_PROVIDER            LLM provider (default: openai)
  PDF2JSON_DATA_DIR            Document store root (default: ./data)
  CLASSIFICATION_MODEL         Stage 1 model (default: gpt-3.5-turbo)
  FIELD_IDENTIFICATION_MODEL   Stage 2 model (default: gpt-4o-mini)
  DATA_EXTRACTION_MODEL        Stage 3 model (default: gpt-4o)
  *_TEMPERATURE, *_MAX_TOKENS  Per-stage overrides, same prefixes
  GPT_TIMEOUT, GPT_MAX_RETRIES Shared request timeout and retry budget
  ENABLE_COST_TRACKING         Write usage.jsonl (default: true)
  PAGE_CONCURRENCY             Pages extracted at once with --per-page (default: 4)
  PDFIUM_LIB_PATH              Path to an existing libpdfium, skips auto-download
"#;

/// Extract structured JSON from PDF forms and tables with a three-stage LLM pipeline.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2json",
    version,
    about = "Extract structured JSON from PDF forms and tables",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Document store root.
    #[arg(long, global = true, env = "PDF2JSON_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "PDF2JSON_PROVIDER")]
    provider: Option<String>,

    /// PDF user password for encrypted documents.
    #[arg(long, global = true, env = "PDF2JSON_PASSWORD")]
    password: Option<String>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDF2JSON_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDF2JSON_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP API.
    Serve {
        #[arg(long, env = "PDF2JSON_HOST", default_value = "127.0.0.1")]
        host: String,
        #[arg(long, env = "PDF2JSON_PORT", default_value_t = 5000)]
        port: u16,
    },
    /// Run classification, field identification and extraction on one PDF.
    Process {
        /// Local PDF file path or HTTP/HTTPS URL.
        input: String,
        /// Input mode for stages 2 and 3.
        #[arg(long, value_enum, default_value = "text")]
        mode: ModeArg,
        /// Page selection: all, 5, 3-15, or 1,3,5,7.
        #[arg(long, default_value = "1")]
        pages: String,
        /// Extract each selected page separately and merge the answers.
        #[arg(long)]
        per_page: bool,
        /// Write the JSON result to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print word clusters and table regions. No API key needed.
    Inspect {
        /// Local PDF file path or HTTP/HTTPS URL.
        input: String,
        #[arg(long, default_value = "1")]
        pages: String,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Print the cost summary from the usage log.
    Usage {
        #[arg(long, default_value_t = 7)]
        days: u32,
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Text,
    Spatial,
    Vision,
    Hybrid,
}

impl From<ModeArg> for ExtractionMode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::Text => ExtractionMode::Text,
            ModeArg::Spatial => ExtractionMode::Spatial,
            ModeArg::Vision => ExtractionMode::Vision,
            ModeArg::Hybrid => ExtractionMode::Hybrid,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner carries progress for `process`; library INFO logs would
    // tear through it, so they are only shown for the server or with -v.
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || matches!(cli.command, Command::Process { .. }) {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;

    match &cli.command {
        Command::Serve { host, port } => {
            ensure_pdfium(cli.quiet)?;
            let pipeline = Pipeline::from_config(config)
                .await
                .context("Failed to initialise pipeline")?;
            pdf2json::server::serve(Arc::new(pipeline), host, *port)
                .await
                .context("Server failed")?;
        }
        Command::Process {
            input,
            mode,
            pages,
            per_page,
            output,
        } => {
            ensure_pdfium(cli.quiet)?;
            let options = StageOptions {
                mode: (*mode).into(),
                pages: pages.parse::<PageSelection>()?,
                per_page: *per_page,
            };
            process(&cli, config, input, &options, output.as_ref()).await?;
        }
        Command::Inspect { input, pages, json } => {
            ensure_pdfium(cli.quiet)?;
            inspect(&config, input, pages.parse()?, *json).await?;
        }
        Command::Usage { days, json } => {
            let store = FileStore::open(&config.data_dir).await?;
            let records = store.usage_records().await?;
            let summary = UsageSummary::from_records(&records, *days, chrono::Utc::now());
            print_usage(&summary, *json)?;
        }
    }
    Ok(())
}

/// Environment first, then CLI flags on top.
fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env().context("Invalid configuration in environment")?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(provider) = &cli.provider {
        config.provider_name = provider.clone();
    }
    if cli.password.is_some() {
        config.password = cli.password.clone();
    }
    Ok(config)
}

// ── Ensure PDFium engine is available ───────────────────────────────────────
// With `bundled` the library bytes ship inside the binary and resolving the
// path only unpacks them. Without it the first run downloads the library
// (~30 MB) into the cache; later runs only check the cache path.
fn ensure_pdfium(quiet: bool) -> Result<()> {
    if quiet || cfg!(feature = "bundled") || pdfium_auto::is_pdfium_cached() {
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
            .context("Failed to prepare PDFium engine")?;
        return Ok(());
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    dl_bar.set_prefix("PDF engine");
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    tokio::task::block_in_place(|| {
        pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
            if let Some(t) = total {
                if bar.length().unwrap_or(0) != t {
                    bar.set_length(t);
                }
            }
            bar.set_position(downloaded);
        }))
    })
    .context("Failed to download PDFium engine")?;
    dl_bar.finish_with_message("ready ✓");
    Ok(())
}

async fn process(
    cli: &Cli,
    config: PipelineConfig,
    input: &str,
    options: &StageOptions,
    output: Option<&PathBuf>,
) -> Result<()> {
    let resolved = resolve_input(input, config.download_timeout_secs)
        .await
        .with_context(|| format!("Failed to open {input}"))?;
    let bytes = tokio::fs::read(resolved.path())
        .await
        .with_context(|| format!("Failed to read {}", resolved.path().display()))?;

    let mut pipeline = Pipeline::from_config(config)
        .await
        .context("Failed to initialise pipeline")?;
    let progress = (!cli.quiet).then(CliProgressCallback::new);
    if let Some(cb) = &progress {
        pipeline = pipeline.with_progress(cb.clone());
    }

    let document = pipeline.upload(&resolved.filename(), &bytes).await?;
    for stage in Stage::ALL {
        pipeline
            .run_stage(&document.id, stage, options)
            .await
            .with_context(|| format!("{stage} failed for {input}"))?;
    }
    if let Some(cb) = &progress {
        cb.bar.finish_and_clear();
    }

    let state = pipeline.state(&document.id).await?;
    let cost: f64 = pipeline
        .usage_records()
        .await?
        .iter()
        .filter(|r| r.document_id.as_deref() == Some(document.id.as_str()))
        .map(|r| r.cost_usd)
        .sum();
    let result = serde_json::json!({
        "document": document,
        "classification": state.classification,
        "fields": state.field_identification,
        "extracted_data": state.extraction,
        "page_merge": state.page_merge,
    });
    let json = serde_json::to_string_pretty(&result).context("Failed to serialise result")?;

    match output {
        Some(path) => {
            tokio::fs::write(path, json.as_bytes())
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            if !cli.quiet {
                eprintln!("{}  {}", green("✔"), bold(&path.display().to_string()));
            }
        }
        None => println!("{json}"),
    }
    if !cli.quiet {
        eprintln!("   document {}  ·  ${:.4}", dim(&document.id), cost);
    }
    Ok(())
}

async fn inspect(config: &PipelineConfig, input: &str, pages: PageSelection, json: bool) -> Result<()> {
    let resolved = resolve_input(input, config.download_timeout_secs)
        .await
        .with_context(|| format!("Failed to open {input}"))?;
    let request = ExtractRequest {
        pages,
        words: true,
        images: false,
        password: config.password.clone(),
        ..Default::default()
    };
    let content = PdfiumExtractor
        .extract(resolved.path(), &request)
        .await
        .context("Failed to inspect PDF")?;
    let words = content.words();
    let layout = LayoutAnalysis {
        page_count: content.page_count,
        boundaries: spatial::cluster(&words, &config.spatial),
        tables: spatial::table_regions(&words, &config.spatial),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&layout)?);
        return Ok(());
    }
    println!("File:    {}", input);
    println!("Pages:   {}", layout.page_count);
    println!("Words:   {}", words.len());
    println!();
    for b in &layout.boundaries {
        let kind = if b.is_empty_field {
            red("empty")
        } else if b.is_likely_field {
            green("label")
        } else {
            dim("value")
        };
        println!("  p{} L{:<3} #{:<2} {:<14} {}", b.page + 1, b.line, b.cluster, kind, b.text);
    }
    for t in &layout.tables {
        println!(
            "\n  table p{}: {} rows × {} cols  [{}]",
            t.page + 1,
            t.row_count,
            t.column_count,
            t.headers.join(" | ")
        );
    }
    println!("\n{}", dim(&spatial::format_for_prompt(&words, &config.spatial)));
    Ok(())
}

fn print_usage(summary: &UsageSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    if summary.is_empty() {
        println!("No usage data in the last {} days", summary.period_days);
        return Ok(());
    }
    println!("Last {} days", summary.period_days);
    println!(
        "  {} requests ({} failed), {} tokens, ${:.4} (avg ${:.4})",
        summary.total_requests,
        summary.failed_requests,
        summary.total_tokens,
        summary.total_cost,
        summary.average_cost_per_request
    );
    println!("\nBy model:");
    for (model, b) in &summary.model_breakdown {
        println!("  {:<24} {:>5} req  {:>9} tok  ${:.4}", model, b.requests, b.tokens, b.cost);
    }
    println!("\nBy task:");
    for (task, b) in &summary.task_breakdown {
        println!("  {:<24} {:>5} req  {:>9} tok  ${:.4}", task, b.requests, b.tokens, b.cost);
    }
    println!();
    for s in summary.suggestions() {
        println!("  • {s}");
    }
    Ok(())
}
