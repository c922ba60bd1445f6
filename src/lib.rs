//! # pdf2json
//!
//! Turn PDF forms and tables into structured JSON with a three-stage LLM
//! pipeline.
//!
//! ## Why three stages?
//!
//! Asking a model for "all the data in this PDF" in one shot mixes up field
//! labels, values and table headers. Splitting the work lets a reviewer
//! correct each step before the next one builds on it:
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Classification        form / table / mixed        (cheap model, text)
//!  ├─ 2. Field identification  labels + table headers      (text, spatial, vision, hybrid)
//!  └─ 3. Extraction            label → value, table rows   (text, spatial, vision, hybrid)
//! ```
//!
//! Every stage result is persisted per document, can be re-run, refined with
//! free-text feedback, or corrected and validated by hand. Stage N refuses to
//! run until stage N−1 has a result.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf2json::{Pipeline, PipelineConfig, Stage, StageOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Models, provider and data directory from the environment (OPENAI_API_KEY etc.)
//!     let pipeline = Pipeline::from_config(PipelineConfig::from_env()?).await?;
//!     let doc = pipeline.upload("form.pdf", &std::fs::read("form.pdf")?).await?;
//!
//!     let options = StageOptions::default();
//!     for stage in Stage::ALL {
//!         pipeline.run_stage(&doc.id, stage, &options).await?;
//!     }
//!     let state = pipeline.state(&doc.id).await?;
//!     println!("{}", serde_json::to_string_pretty(&state.extraction)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Extraction Modes
//!
//! | Mode | Prompt input | Best for |
//! |------|--------------|----------|
//! | `text`    | pdfium text layer | Clean digital PDFs |
//! | `spatial` | words re-laid out by position, `[EMPTY]` markers | Forms with empty fields |
//! | `vision`  | rendered page PNGs | Scans, complex layouts |
//! | `hybrid`  | spatial text + page images | Best accuracy, highest cost |
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`     | on | Enables the `pdf2json` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `bundled` | on | Embeds the pdfium shared library at compile time |
//!
//! ```toml
//! pdf2json = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod server;
pub mod store;
pub mod usage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ModelConfig, PageSelection, PipelineConfig, PipelineConfigBuilder, SpatialConfig};
pub use error::{CompletionError, Pdf2JsonError};
pub use model::{
    BoundingBox, Document, ExtractedData, ExtractionMode, FeedbackEntry, FieldDescriptor, FieldSet, PipelineState,
    Stage, StageResult, StageStatus, Structure, UsageRecord,
};
pub use orchestrator::{LayoutAnalysis, Pipeline, PreprocessingPreview, StageOptions};
pub use pipeline::content::{ContentExtractor, PdfiumExtractor};
pub use pipeline::llm::{CompletionBackend, LlmBackend};
pub use pipeline::merge::MergeReport;
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use prompts::{DefaultPrompts, PromptPolicy};
pub use store::{DocumentStore, FileStore, MemoryStore, UsageLog};
pub use usage::UsageSummary;
