//! Configuration types for the extraction pipeline.
//!
//! Everything the pipeline, the completion client and the stores need is
//! carried by one [`PipelineConfig`], built through [`PipelineConfigBuilder`]
//! or read from the environment with [`PipelineConfig::from_env`]. The config
//! is read once at startup and passed to [`crate::Pipeline::new`]; nothing in
//! the crate reads environment variables after that.

use crate::error::Pdf2JsonError;
use crate::model::Stage;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Model parameters for one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier, e.g. "gpt-4o".
    pub model: String,

    /// Sampling temperature. Default: 0.0 for every stage.
    pub temperature: f32,

    /// Maximum completion tokens.
    ///
    /// Classification answers with a short label, so 800 is plenty. Field lists
    /// and extracted data for dense forms run long; 12 000 avoids truncation.
    pub max_tokens: usize,

    /// Per-attempt timeout in seconds. Default: 90.
    pub timeout_secs: u64,

    /// Retries after the first attempt on transient failures. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled after each attempt. Default: 500.
    pub retry_backoff_ms: u64,
}

impl ModelConfig {
    pub fn defaults_for(stage: Stage) -> Self {
        let (model, max_tokens) = match stage {
            Stage::Classification => ("gpt-3.5-turbo", 800),
            Stage::FieldIdentification => ("gpt-4o-mini", 12_000),
            Stage::Extraction => ("gpt-4o", 12_000),
        };
        Self {
            model: model.to_string(),
            temperature: 0.0,
            max_tokens,
            timeout_secs: 90,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> std::time::Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        std::time::Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Tolerances for the spatial preprocessor, in PDF points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialConfig {
    /// Words whose top edges differ by at most this much share a line. Default: 5.0.
    pub y_tolerance: f32,
    /// A horizontal gap larger than this multiple of the line's average gap
    /// starts a new column cluster. Default: 2.0.
    pub gap_multiplier: f32,
    /// Max x distance between a label and a value on the following line. Default: 30.0.
    pub value_x_tolerance: f32,
    /// Max x distance when matching clusters of a label line to a value line. Default: 50.0.
    pub cluster_match_tolerance: f32,
    /// Max deviation from the mean word gap for a line to count as a table row. Default: 10.0.
    pub table_spacing_tolerance: f32,
    /// Max vertical distance between consecutive table rows. Default: 20.0.
    pub table_row_gap: f32,
    /// Minimum words per table row. Default: 3.
    pub table_min_words: usize,
    /// Minimum rows per table region. Default: 2.
    pub table_min_rows: usize,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            y_tolerance: 5.0,
            gap_multiplier: 2.0,
            value_x_tolerance: 30.0,
            cluster_match_tolerance: 50.0,
            table_spacing_tolerance: 10.0,
            table_row_gap: 20.0,
            table_min_words: 3,
            table_min_rows: 2,
        }
    }
}

/// Configuration for a [`crate::Pipeline`].
///
/// # Example
/// ```rust
/// use pdf2json::{PipelineConfig, Stage};
///
/// let config = PipelineConfig::builder()
///     .model(Stage::Extraction, "gpt-4.1-mini")
///     .max_retries(5)
///     .data_dir("/var/lib/pdf2json")
///     .build()
///     .unwrap();
/// assert_eq!(config.model(Stage::Extraction).max_retries, 5);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    pub classification: ModelConfig,
    pub field_identification: ModelConfig,
    pub extraction: ModelConfig,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama"). Default: "openai".
    pub provider_name: String,

    /// Pre-constructed provider used for every stage. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Root of the filesystem store. Default: "data".
    pub data_dir: PathBuf,

    /// Largest accepted upload. Default: 16 MiB.
    pub max_upload_bytes: usize,

    /// Rendering DPI for page images sent in vision and hybrid modes. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Cap on either dimension of a rendered page image, in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    pub spatial: SpatialConfig,

    /// Record one usage entry per completion attempt. Default: true.
    pub cost_tracking: bool,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Pages extracted at once when stage 3 runs page by page. Default: 4.
    pub page_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            classification: ModelConfig::defaults_for(Stage::Classification),
            field_identification: ModelConfig::defaults_for(Stage::FieldIdentification),
            extraction: ModelConfig::defaults_for(Stage::Extraction),
            provider_name: "openai".to_string(),
            provider: None,
            data_dir: PathBuf::from("data"),
            max_upload_bytes: 16 * 1024 * 1024,
            dpi: 150,
            max_rendered_pixels: 2000,
            password: None,
            spatial: SpatialConfig::default(),
            cost_tracking: true,
            download_timeout_secs: 120,
            page_concurrency: 4,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("classification", &self.classification)
            .field("field_identification", &self.field_identification)
            .field("extraction", &self.extraction)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("data_dir", &self.data_dir)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("spatial", &self.spatial)
            .field("cost_tracking", &self.cost_tracking)
            .field("page_concurrency", &self.page_concurrency)
            .finish()
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn model(&self, stage: Stage) -> &ModelConfig {
        match stage {
            Stage::Classification => &self.classification,
            Stage::FieldIdentification => &self.field_identification,
            Stage::Extraction => &self.extraction,
        }
    }

    fn model_mut(&mut self, stage: Stage) -> &mut ModelConfig {
        match stage {
            Stage::Classification => &mut self.classification,
            Stage::FieldIdentification => &mut self.field_identification,
            Stage::Extraction => &mut self.extraction,
        }
    }

    /// Read the configuration from process environment variables.
    ///
    /// | Variable | Applies to |
    /// |----------|-----------|
    /// | `CLASSIFICATION_MODEL`, `FIELD_IDENTIFICATION_MODEL`, `DATA_EXTRACTION_MODEL` | model per stage |
    /// | `CLASSIFICATION_TEMPERATURE`, … `_MAX_TOKENS` | sampling per stage |
    /// | `GPT_TIMEOUT`, `GPT_MAX_RETRIES` | every stage |
    /// | `PDF2JSON_PROVIDER`, `PDF2JSON_DATA_DIR`, `MAX_UPLOAD_BYTES` | service |
    /// | `ENABLE_COST_TRACKING` | usage log |
    /// | `PAGE_CONCURRENCY` | page-by-page extraction |
    pub fn from_env() -> Result<Self, Pdf2JsonError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Pdf2JsonError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut b = Self::builder();

        for stage in Stage::ALL {
            let prefix = env_prefix(stage);
            if let Some(model) = get(&format!("{prefix}_MODEL")) {
                b = b.model(stage, model);
            }
            if let Some(t) = get(&format!("{prefix}_TEMPERATURE")) {
                b = b.temperature(stage, parse_env(&format!("{prefix}_TEMPERATURE"), &t)?);
            }
            if let Some(n) = get(&format!("{prefix}_MAX_TOKENS")) {
                b = b.max_tokens(stage, parse_env(&format!("{prefix}_MAX_TOKENS"), &n)?);
            }
        }
        if let Some(v) = get("GPT_TIMEOUT") {
            b = b.timeout_secs(parse_env("GPT_TIMEOUT", &v)?);
        }
        if let Some(v) = get("GPT_MAX_RETRIES") {
            b = b.max_retries(parse_env("GPT_MAX_RETRIES", &v)?);
        }
        if let Some(v) = get("PDF2JSON_PROVIDER") {
            b = b.provider_name(v);
        }
        if let Some(v) = get("PDF2JSON_DATA_DIR") {
            b = b.data_dir(v);
        }
        if let Some(v) = get("MAX_UPLOAD_BYTES") {
            b = b.max_upload_bytes(parse_env("MAX_UPLOAD_BYTES", &v)?);
        }
        if let Some(v) = get("ENABLE_COST_TRACKING") {
            b = b.cost_tracking(parse_bool(&v));
        }
        if let Some(v) = get("PAGE_CONCURRENCY") {
            b = b.page_concurrency(parse_env("PAGE_CONCURRENCY", &v)?);
        }
        b.build()
    }
}

fn env_prefix(stage: Stage) -> &'static str {
    match stage {
        Stage::Classification => "CLASSIFICATION",
        Stage::FieldIdentification => "FIELD_IDENTIFICATION",
        Stage::Extraction => "DATA_EXTRACTION",
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, Pdf2JsonError> {
    value
        .parse()
        .map_err(|_| Pdf2JsonError::InvalidConfig(format!("{key}: cannot parse '{value}'")))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn model_config(mut self, stage: Stage, model: ModelConfig) -> Self {
        *self.config.model_mut(stage) = model;
        self
    }

    pub fn model(mut self, stage: Stage, model: impl Into<String>) -> Self {
        self.config.model_mut(stage).model = model.into();
        self
    }

    pub fn temperature(mut self, stage: Stage, t: f32) -> Self {
        self.config.model_mut(stage).temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, stage: Stage, n: usize) -> Self {
        self.config.model_mut(stage).max_tokens = n;
        self
    }

    /// Per-attempt timeout for every stage.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        for stage in Stage::ALL {
            self.config.model_mut(stage).timeout_secs = secs;
        }
        self
    }

    /// Retry budget for every stage.
    pub fn max_retries(mut self, n: u32) -> Self {
        for stage in Stage::ALL {
            self.config.model_mut(stage).max_retries = n;
        }
        self
    }

    /// Initial backoff for every stage.
    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        for stage in Stage::ALL {
            self.config.model_mut(stage).retry_backoff_ms = ms;
        }
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = name.into();
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn max_upload_bytes(mut self, n: usize) -> Self {
        self.config.max_upload_bytes = n;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn spatial(mut self, spatial: SpatialConfig) -> Self {
        self.config.spatial = spatial;
        self
    }

    pub fn cost_tracking(mut self, enabled: bool) -> Self {
        self.config.cost_tracking = enabled;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn page_concurrency(mut self, n: usize) -> Self {
        self.config.page_concurrency = n.max(1);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, Pdf2JsonError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(Pdf2JsonError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        for stage in Stage::ALL {
            let m = c.model(stage);
            if m.model.trim().is_empty() {
                return Err(Pdf2JsonError::InvalidConfig(format!(
                    "model for {stage} must not be empty"
                )));
            }
            if m.max_tokens == 0 {
                return Err(Pdf2JsonError::InvalidConfig(format!(
                    "max_tokens for {stage} must be ≥ 1"
                )));
            }
            if m.timeout_secs == 0 {
                return Err(Pdf2JsonError::InvalidConfig(format!(
                    "timeout for {stage} must be ≥ 1 second"
                )));
            }
        }
        if c.page_concurrency == 0 {
            return Err(Pdf2JsonError::InvalidConfig(
                "page_concurrency must be ≥ 1".into(),
            ));
        }
        if c.max_upload_bytes == 0 {
            return Err(Pdf2JsonError::InvalidConfig(
                "max_upload_bytes must be ≥ 1".into(),
            ));
        }
        if c.provider_name.trim().is_empty() && c.provider.is_none() {
            return Err(Pdf2JsonError::InvalidConfig(
                "a provider name or a provider instance is required".into(),
            ));
        }
        if c.spatial.y_tolerance < 0.0 || c.spatial.gap_multiplier <= 0.0 {
            return Err(Pdf2JsonError::InvalidConfig(
                "spatial tolerances must be positive".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Page selection ───────────────────────────────────────────────────────

/// Specifies which pages of the PDF a stage reads.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSelection {
    /// Every page.
    All,
    /// A single page (1-indexed). The pipeline default is page 1.
    Single(usize),
    /// A contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
    /// First page only.
    #[default]
    First,
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::First => (0..total_pages.min(1)).collect(),
            PageSelection::Single(p) => {
                if *p >= 1 && *p <= total_pages {
                    vec![p - 1]
                } else {
                    vec![]
                }
            }
            PageSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
            PageSelection::Set(pages) => pages
                .iter()
                .filter(|&&p| p >= 1 && p <= total_pages)
                .map(|p| p - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

impl FromStr for PageSelection {
    type Err = Pdf2JsonError;

    /// Parse `all`, `5`, `3-15` or `1,3,5`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let bad = |msg: String| Pdf2JsonError::InvalidRequest(msg);
        let page = |p: &str| -> Result<usize, Pdf2JsonError> {
            let n: usize = p
                .trim()
                .parse()
                .map_err(|_| bad(format!("invalid page number '{}'", p.trim())))?;
            if n < 1 {
                return Err(bad("pages are 1-indexed, minimum is 1".into()));
            }
            Ok(n)
        };

        if s == "all" {
            return Ok(PageSelection::All);
        }
        if let Some((start, end)) = s.split_once('-') {
            let (start, end) = (page(start)?, page(end)?);
            if start > end {
                return Err(bad(format!(
                    "invalid page range '{start}-{end}': start must be <= end"
                )));
            }
            return Ok(PageSelection::Range(start, end));
        }
        if s.contains(',') {
            let pages = s.split(',').map(page).collect::<Result<Vec<_>, _>>()?;
            return Ok(PageSelection::Set(pages));
        }
        Ok(PageSelection::Single(page(&s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn stage_defaults_follow_task_size() {
        let c = PipelineConfig::default();
        assert_eq!(c.model(Stage::Classification).model, "gpt-3.5-turbo");
        assert_eq!(c.model(Stage::Classification).max_tokens, 800);
        assert_eq!(c.model(Stage::FieldIdentification).model, "gpt-4o-mini");
        assert_eq!(c.model(Stage::Extraction).model, "gpt-4o");
        assert_eq!(c.model(Stage::Extraction).max_tokens, 12_000);
        assert!(Stage::ALL.iter().all(|s| c.model(*s).temperature == 0.0));
    }

    #[test]
    fn backoff_doubles() {
        let m = ModelConfig::defaults_for(Stage::Classification);
        assert_eq!(m.backoff_for(1).as_millis(), 500);
        assert_eq!(m.backoff_for(2).as_millis(), 1000);
        assert_eq!(m.backoff_for(3).as_millis(), 2000);
    }

    #[test]
    fn from_lookup_reads_overrides() {
        let env: HashMap<&str, &str> = [
            ("DATA_EXTRACTION_MODEL", "gpt-4.1"),
            ("CLASSIFICATION_MAX_TOKENS", "400"),
            ("GPT_TIMEOUT", "30"),
            ("GPT_MAX_RETRIES", "1"),
            ("PDF2JSON_DATA_DIR", "/tmp/p2j"),
            ("ENABLE_COST_TRACKING", "false"),
            ("PAGE_CONCURRENCY", "2"),
        ]
        .into_iter()
        .collect();
        let c = PipelineConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(c.extraction.model, "gpt-4.1");
        assert_eq!(c.classification.max_tokens, 400);
        assert!(Stage::ALL.iter().all(|s| c.model(*s).timeout_secs == 30));
        assert!(Stage::ALL.iter().all(|s| c.model(*s).max_retries == 1));
        assert_eq!(c.data_dir, PathBuf::from("/tmp/p2j"));
        assert!(!c.cost_tracking);
        assert_eq!(c.page_concurrency, 2);
    }

    #[test]
    fn from_lookup_rejects_garbage_numbers() {
        let err = PipelineConfig::from_lookup(|k| (k == "GPT_TIMEOUT").then(|| "soon".to_string()));
        assert!(matches!(err, Err(Pdf2JsonError::InvalidConfig(_))));
    }

    #[test]
    fn build_rejects_empty_model() {
        let err = PipelineConfig::builder().model(Stage::Classification, " ").build();
        assert!(matches!(err, Err(Pdf2JsonError::InvalidConfig(_))));
    }

    #[test]
    fn page_selection_parsing() {
        assert_eq!("all".parse::<PageSelection>().unwrap(), PageSelection::All);
        assert_eq!("3".parse::<PageSelection>().unwrap(), PageSelection::Single(3));
        assert_eq!("2-4".parse::<PageSelection>().unwrap(), PageSelection::Range(2, 4));
        assert_eq!(
            "1, 3,5".parse::<PageSelection>().unwrap(),
            PageSelection::Set(vec![1, 3, 5])
        );
        assert!("0".parse::<PageSelection>().is_err());
        assert!("5-2".parse::<PageSelection>().is_err());
    }

    #[test]
    fn page_selection_indices() {
        assert_eq!(PageSelection::First.to_indices(5), vec![0]);
        assert_eq!(PageSelection::First.to_indices(0), Vec::<usize>::new());
        assert_eq!(PageSelection::Range(2, 9).to_indices(4), vec![1, 2, 3]);
        assert_eq!(PageSelection::Set(vec![3, 1, 3, 7]).to_indices(4), vec![0, 2]);
    }
}
