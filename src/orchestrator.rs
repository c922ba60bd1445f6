//! The three-stage pipeline: classification → field identification → extraction.
//!
//! [`Pipeline`] owns the collaborators (store, content extractor, completion
//! client, prompt policy) and exposes every operation the HTTP API and the
//! CLI need. Each stage invocation is one awaited future:
//!
//! ```text
//! check prerequisite ─▶ status=running ─▶ extract PDF content ─▶ build prompt
//!        ─▶ complete + validate JSON ─▶ persist result, status=done
//!                                   └─▶ on error: status=failed, prior result kept
//! ```
//!
//! The per-document store lock is only taken for the short state updates,
//! never across the AI call, so concurrent stages on one document resolve as
//! last-writer-wins without partial writes.

use crate::config::{PageSelection, PipelineConfig};
use crate::error::Pdf2JsonError;
use crate::model::{
    BoundingBox, Document, ExtractedData, ExtractionMode, FeedbackEntry, FieldDescriptor, FieldSet,
    PipelineState, Stage, StageResult, StageStatus, Structure, UsageRecord,
};
use crate::pipeline::content::{ContentExtractor, ExtractRequest, PageImage, PdfContent, PdfiumExtractor};
use crate::pipeline::input::{ensure_pdf_bytes, sanitize_filename};
use crate::pipeline::llm::{
    Completion, CompletionBackend, CompletionClient, CompletionRequest, LlmBackend, PromptMessage,
};
use crate::pipeline::merge::{self, MergeReport, PageExtraction};
use crate::pipeline::spatial::{self, FieldBoundary, TableRegion};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::prompts::{DefaultPrompts, PromptContext, PromptPolicy, Refinement};
use crate::store::{DocumentStore, FileStore, UsageLog};
use crate::usage::UsageSummary;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-call options for stages 2 and 3. Stage 1 always reads plain text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOptions {
    pub mode: ExtractionMode,
    pub pages: PageSelection,
    /// Stage 3 only: one request per selected page, answers merged afterwards.
    pub per_page: bool,
}

/// The text and images a stage would send for a mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreprocessingPreview {
    pub mode: ExtractionMode,
    pub page_count: usize,
    /// 1-indexed pages that were read.
    pub pages: Vec<usize>,
    pub text: String,
    pub word_count: usize,
    pub image_count: usize,
}

/// Spatial analysis of the stored PDF.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayoutAnalysis {
    pub page_count: usize,
    pub boundaries: Vec<FieldBoundary>,
    pub tables: Vec<TableRegion>,
}

/// What a stage produced, before it is persisted.
struct StageOutput {
    result: StageResult,
    attempts: u32,
    page_merge: Option<MergeReport>,
}

/// A completion request plus the mode its input was actually built in.
struct PreparedRequest {
    mode: ExtractionMode,
    completion: CompletionRequest,
}

/// Prompt input prepared from PDF content.
struct StageInput {
    mode: ExtractionMode,
    page_count: usize,
    pages: Vec<usize>,
    text: String,
    word_count: usize,
    images: Vec<PageImage>,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn DocumentStore>,
    usage_log: Arc<dyn UsageLog>,
    extractor: Arc<dyn ContentExtractor>,
    client: CompletionClient,
    prompts: Arc<dyn PromptPolicy>,
    progress: ProgressCallback,
}

impl Pipeline {
    /// Assemble a pipeline from explicit collaborators.
    pub fn new<S>(
        config: PipelineConfig,
        store: Arc<S>,
        extractor: Arc<dyn ContentExtractor>,
        backend: Arc<dyn CompletionBackend>,
    ) -> Self
    where
        S: DocumentStore + UsageLog + 'static,
    {
        let usage_log: Arc<dyn UsageLog> = store.clone();
        let tracked = config.cost_tracking.then(|| Arc::clone(&usage_log));
        let client = CompletionClient::new(backend, &config, tracked);
        Self {
            config,
            store,
            usage_log,
            extractor,
            client,
            prompts: Arc::new(DefaultPrompts),
            progress: Arc::new(NoopProgressCallback),
        }
    }

    /// File store under `config.data_dir`, pdfium extraction and the
    /// configured LLM provider. Fails with
    /// [`Pdf2JsonError::ProviderNotConfigured`] when the provider cannot be
    /// created for one of the stage models.
    pub async fn from_config(config: PipelineConfig) -> Result<Self, Pdf2JsonError> {
        let backend = Arc::new(LlmBackend::connect(&config)?);
        let store = Arc::new(FileStore::open(&config.data_dir).await?);
        Ok(Self::new(config, store, Arc::new(PdfiumExtractor), backend))
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_prompts(mut self, prompts: Arc<dyn PromptPolicy>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ── Documents ────────────────────────────────────────────────────────

    /// Store an uploaded PDF after checking its size and `%PDF` header.
    pub async fn upload(&self, filename: &str, bytes: &[u8]) -> Result<Document, Pdf2JsonError> {
        if bytes.len() > self.config.max_upload_bytes {
            return Err(Pdf2JsonError::InvalidRequest(format!(
                "upload is {} bytes, limit is {}",
                bytes.len(),
                self.config.max_upload_bytes
            )));
        }
        let filename = sanitize_filename(filename);
        ensure_pdf_bytes(bytes, Path::new(&filename))?;
        self.store.create_document(&filename, bytes).await
    }

    pub async fn document(&self, id: &str) -> Result<Document, Pdf2JsonError> {
        self.store.get_document(id).await
    }

    pub async fn recent_documents(&self, limit: usize) -> Result<Vec<Document>, Pdf2JsonError> {
        self.store.recent_documents(limit).await
    }

    pub async fn delete_document(&self, id: &str) -> Result<(), Pdf2JsonError> {
        self.store.delete_document(id).await
    }

    pub async fn state(&self, id: &str) -> Result<PipelineState, Pdf2JsonError> {
        self.store.load_state(id).await
    }

    // ── Stages ───────────────────────────────────────────────────────────

    /// Run one stage and persist its result, replacing any earlier one.
    pub async fn run_stage(
        &self,
        document_id: &str,
        stage: Stage,
        options: &StageOptions,
    ) -> Result<StageResult, Pdf2JsonError> {
        self.execute(document_id, stage, options, None).await
    }

    /// Re-run a stage with the prior result, the stage's feedback history and
    /// `feedback` added to the prompt. Appends a [`FeedbackEntry`].
    pub async fn refine_stage(
        &self,
        document_id: &str,
        stage: Stage,
        feedback: &str,
        options: &StageOptions,
    ) -> Result<StageResult, Pdf2JsonError> {
        if feedback.trim().is_empty() {
            return Err(Pdf2JsonError::InvalidRequest("feedback must not be empty".into()));
        }
        self.execute(document_id, stage, options, Some(feedback.trim())).await
    }

    async fn execute(
        &self,
        document_id: &str,
        stage: Stage,
        options: &StageOptions,
        feedback: Option<&str>,
    ) -> Result<StageResult, Pdf2JsonError> {
        let document = self.store.get_document(document_id).await?;
        let state = self.store.load_state(document_id).await?;
        if let Some(missing) = stage.prerequisite() {
            if !state.has_result(missing) {
                return Err(Pdf2JsonError::StagePrerequisiteMissing {
                    document_id: document_id.to_string(),
                    stage,
                    missing,
                });
            }
        }
        // Feedback refers to a result the caller has seen.
        if feedback.is_some() && !state.has_result(stage) {
            return Err(Pdf2JsonError::NoStageResult {
                document_id: document_id.to_string(),
                stage,
            });
        }

        self.store
            .update_state(
                document_id,
                Box::new(move |s| {
                    s.set_status(stage, StageStatus::Running);
                    Ok(())
                }),
            )
            .await?;
        info!("Document {}: running {} (stage {})", document_id, stage, stage.number());
        self.progress.on_stage_start(document_id, stage);

        let outcome = self.complete_stage(&document, &state, stage, options, feedback).await;
        match outcome {
            Ok(StageOutput {
                result,
                attempts,
                page_merge,
            }) => {
                let after = result.to_value();
                let stored = result.clone();
                let feedback = feedback.map(str::to_string);
                self.store
                    .update_state(
                        document_id,
                        Box::new(move |s| {
                            let before = s.result(stage).map(|r| r.to_value());
                            let iteration = s.next_iteration(stage);
                            s.set_result(stored);
                            if stage == Stage::Extraction {
                                s.page_merge = page_merge;
                            }
                            if let Some(feedback) = feedback {
                                s.feedback_history.push(FeedbackEntry {
                                    stage,
                                    iteration,
                                    feedback,
                                    result_before: before,
                                    result_after: after,
                                    timestamp: Utc::now(),
                                });
                            }
                            Ok(())
                        }),
                    )
                    .await?;
                info!("Document {}: {} done after {} attempt(s)", document_id, stage, attempts);
                self.progress.on_stage_complete(document_id, stage, attempts);
                Ok(result)
            }
            Err(e) => {
                warn!("Document {}: {} failed: {}", document_id, stage, e);
                let error = e.to_string();
                self.progress.on_stage_error(document_id, stage, &error);
                let recorded = self
                    .store
                    .update_state(
                        document_id,
                        Box::new(move |s| {
                            s.set_status(stage, StageStatus::Failed { error });
                            Ok(())
                        }),
                    )
                    .await;
                if let Err(store_err) = recorded {
                    warn!("Document {}: could not record failure: {}", document_id, store_err);
                }
                Err(e)
            }
        }
    }

    /// Everything between "status=running" and the validated result.
    async fn complete_stage(
        &self,
        document: &Document,
        state: &PipelineState,
        stage: Stage,
        options: &StageOptions,
        feedback: Option<&str>,
    ) -> Result<StageOutput, Pdf2JsonError> {
        if stage == Stage::Extraction && options.per_page {
            return self.extract_by_page(document, state, options, feedback).await;
        }
        // Stage 1 only needs the gist of the text.
        let mode = match stage {
            Stage::Classification => ExtractionMode::Text,
            _ => options.mode,
        };
        let input = self.prepare_input(document, mode, &options.pages).await?;
        let request = self.stage_request(document, state, stage, input, feedback);

        let progress = self.progress.as_ref();
        let (result, attempts) = match stage {
            Stage::Classification => {
                let c = self
                    .client
                    .complete_json(&request.completion, progress, Structure::from_value)
                    .await?;
                let attempts = c.attempts();
                (StageResult::Classification(c.value), attempts)
            }
            Stage::FieldIdentification => {
                let mode = request.mode;
                let c = self
                    .client
                    .complete_json(&request.completion, progress, move |v| FieldSet::from_value(v, mode))
                    .await?;
                let attempts = c.attempts();
                (StageResult::FieldIdentification(c.value), attempts)
            }
            Stage::Extraction => {
                let c = self.extract_once(&request, state).await?;
                let attempts = c.attempts();
                (StageResult::Extraction(c.value), attempts)
            }
        };
        Ok(StageOutput {
            result,
            attempts,
            page_merge: None,
        })
    }

    /// Build the prompt for one stage call.
    fn stage_request(
        &self,
        document: &Document,
        state: &PipelineState,
        stage: Stage,
        input: StageInput,
        feedback: Option<&str>,
    ) -> PreparedRequest {
        let prior = feedback.and_then(|_| state.result(stage)).map(|r| r.to_value());
        let history: Vec<FeedbackEntry> = state.feedback_for(stage).into_iter().cloned().collect();
        let ctx = PromptContext {
            stage,
            mode: input.mode,
            text: &input.text,
            page_count: input.page_count,
            structure: state.classification.as_ref(),
            fields: state.field_identification.as_ref(),
            refinement: feedback.map(|feedback| Refinement {
                prior: prior.as_ref(),
                history: &history,
                feedback,
            }),
        };
        let completion = CompletionRequest {
            stage,
            document_id: Some(document.id.clone()),
            messages: vec![
                PromptMessage::system(self.prompts.system(stage, input.mode)),
                PromptMessage::user_with_images(self.prompts.user(&ctx), input.images),
            ],
        };
        debug!(
            "{}: prompt {} chars, {} image(s), pages {:?}",
            stage,
            completion.messages.iter().map(|m| m.text.len()).sum::<usize>(),
            completion.messages.iter().map(|m| m.images.len()).sum::<usize>(),
            input.pages
        );
        PreparedRequest {
            mode: input.mode,
            completion,
        }
    }

    async fn extract_once(
        &self,
        request: &PreparedRequest,
        state: &PipelineState,
    ) -> Result<Completion<ExtractedData>, Pdf2JsonError> {
        let fields = state.field_identification.as_ref();
        self.client
            .complete_json(&request.completion, self.progress.as_ref(), |v| {
                ExtractedData::from_value(v, fields)
            })
            .await
    }

    /// Stage 3 over each selected page, then [`merge::merge_pages`].
    ///
    /// Pages run `page_concurrency` at a time. A failed page is reported in
    /// the [`MergeReport`]; the stage only fails when every page failed.
    async fn extract_by_page(
        &self,
        document: &Document,
        state: &PipelineState,
        options: &StageOptions,
        feedback: Option<&str>,
    ) -> Result<StageOutput, Pdf2JsonError> {
        let listing = ExtractRequest {
            pages: options.pages.clone(),
            password: self.config.password.clone(),
            ..Default::default()
        };
        let content = self.extractor.extract(&document.storage_path, &listing).await?;
        let pages: Vec<usize> = content.pages.iter().map(|p| p.index + 1).collect();
        if pages.is_empty() {
            return Err(Pdf2JsonError::InvalidRequest(format!(
                "page selection {:?} matches none of the {} page(s)",
                options.pages, content.page_count
            )));
        }
        let total = pages.len();
        info!("Document {}: extracting {} page(s) one by one", document.id, total);

        let outcomes: Vec<(usize, Result<Completion<ExtractedData>, Pdf2JsonError>)> =
            stream::iter(pages.into_iter().map(|page| async move {
                self.progress.on_page_start(&document.id, page, total);
                let result = self.extract_page(document, state, options, feedback, page).await;
                match &result {
                    Ok(_) => self.progress.on_page_complete(&document.id, page, total),
                    Err(e) => self.progress.on_page_error(&document.id, page, total, &e.to_string()),
                }
                (page, result)
            }))
            .buffer_unordered(self.config.page_concurrency)
            .collect()
            .await;

        let mut attempts = 0;
        let mut extracted = Vec::new();
        let mut failures = Vec::new();
        let mut first_error = None;
        for (page, outcome) in outcomes {
            match outcome {
                Ok(c) => {
                    attempts += c.attempts();
                    extracted.push(PageExtraction { page, data: c.value });
                }
                Err(e) => {
                    warn!("Document {}: page {} failed: {}", document.id, page, e);
                    failures.push((page, e.to_string()));
                    if first_error.as_ref().map_or(true, |(p, _)| page < *p) {
                        first_error = Some((page, e));
                    }
                }
            }
        }
        if extracted.is_empty() {
            if let Some((_, e)) = first_error {
                return Err(e);
            }
        }

        let (data, report) = merge::merge_pages(extracted, failures);
        if !report.field_conflicts.is_empty() || !report.table_anomalies.is_empty() {
            warn!(
                "Document {}: merged {} page(s) with {} field conflict(s), {} table anomaly(ies)",
                document.id,
                report.pages.len(),
                report.field_conflicts.len(),
                report.table_anomalies.len()
            );
        }
        Ok(StageOutput {
            result: StageResult::Extraction(data),
            attempts,
            page_merge: Some(report),
        })
    }

    async fn extract_page(
        &self,
        document: &Document,
        state: &PipelineState,
        options: &StageOptions,
        feedback: Option<&str>,
        page: usize,
    ) -> Result<Completion<ExtractedData>, Pdf2JsonError> {
        let input = self
            .prepare_input(document, options.mode, &PageSelection::Single(page))
            .await?;
        let request = self.stage_request(document, state, Stage::Extraction, input, feedback);
        self.extract_once(&request, state).await
    }

    /// Read the PDF and build the text and images for `mode`.
    ///
    /// Spatial and hybrid fall back to plain text when the PDF has no word
    /// boxes (scanned pages); vision falls back to text when rendering failed.
    async fn prepare_input(
        &self,
        document: &Document,
        mode: ExtractionMode,
        pages: &PageSelection,
    ) -> Result<StageInput, Pdf2JsonError> {
        let request = ExtractRequest {
            pages: pages.clone(),
            words: mode.uses_words(),
            images: mode.uses_images(),
            dpi: self.config.dpi,
            max_rendered_pixels: self.config.max_rendered_pixels,
            password: self.config.password.clone(),
        };
        let content: PdfContent = self.extractor.extract(&document.storage_path, &request).await?;
        let words = content.words();
        let images: Vec<PageImage> = content.images().cloned().collect();

        let mut effective = mode;
        let text = match mode {
            ExtractionMode::Text => content.text(),
            ExtractionMode::Spatial | ExtractionMode::Hybrid => {
                let laid_out = spatial::format_for_prompt(&words, &self.config.spatial);
                if laid_out.trim().is_empty() {
                    warn!("{}: no word boxes, using plain text instead of {} layout", document.id, mode);
                    content.text()
                } else {
                    laid_out
                }
            }
            ExtractionMode::Vision if images.is_empty() => {
                warn!("{}: no page images rendered, falling back to text", document.id);
                effective = ExtractionMode::Text;
                content.text()
            }
            ExtractionMode::Vision => String::new(),
        };
        if effective == ExtractionMode::Hybrid && images.is_empty() {
            effective = ExtractionMode::Spatial;
        }

        Ok(StageInput {
            mode: effective,
            page_count: content.page_count,
            pages: content.pages.iter().map(|p| p.index + 1).collect(),
            text,
            word_count: words.len(),
            images,
        })
    }

    // ── Review and corrections ───────────────────────────────────────────

    /// Merge user corrections into the stored result and mark it validated.
    ///
    /// `corrections` is a JSON object whose keys replace the matching keys of
    /// the stored result. The merged value must still parse as the stage's
    /// result type.
    pub async fn validate_stage(
        &self,
        document_id: &str,
        stage: Stage,
        corrections: Value,
    ) -> Result<StageResult, Pdf2JsonError> {
        let Value::Object(corrections) = corrections else {
            return Err(Pdf2JsonError::InvalidRequest("corrections must be a JSON object".into()));
        };
        let id = document_id.to_string();
        let state = self
            .store
            .update_state(
                document_id,
                Box::new(move |s| {
                    let current = s.result(stage).ok_or_else(|| Pdf2JsonError::NoStageResult {
                        document_id: id,
                        stage,
                    })?;
                    let merged = merge(current.to_value(), corrections);
                    let corrected = match &current {
                        StageResult::Classification(_) => Structure::from_value(merged).map(StageResult::Classification),
                        StageResult::FieldIdentification(fs) => {
                            FieldSet::from_value(merged, fs.mode).map(StageResult::FieldIdentification)
                        }
                        StageResult::Extraction(_) => {
                            ExtractedData::from_value(merged, s.field_identification.as_ref()).map(StageResult::Extraction)
                        }
                    }
                    .map_err(|e| Pdf2JsonError::InvalidRequest(format!("corrected {stage} is invalid: {e}")))?;
                    s.set_result(corrected);
                    s.validated_at.insert(stage, Utc::now());
                    Ok(())
                }),
            )
            .await?;
        info!("Document {}: {} validated", document_id, stage);
        state
            .result(stage)
            .ok_or_else(|| Pdf2JsonError::Internal(format!("{stage} result vanished after validation")))
    }

    pub async fn reset_validation(&self, document_id: &str, stage: Stage) -> Result<PipelineState, Pdf2JsonError> {
        self.store
            .update_state(
                document_id,
                Box::new(move |s| {
                    s.validated_at.remove(&stage);
                    Ok(())
                }),
            )
            .await
    }

    /// Set the region of one identified field.
    pub async fn update_field_region(
        &self,
        document_id: &str,
        field_id: u32,
        region: BoundingBox,
    ) -> Result<FieldDescriptor, Pdf2JsonError> {
        if !region.is_valid() {
            return Err(Pdf2JsonError::InvalidRequest(format!(
                "region ({}, {}, {}, {}) is not a valid box",
                region.x0, region.y0, region.x1, region.y1
            )));
        }
        let id = document_id.to_string();
        let state = self
            .store
            .update_state(
                document_id,
                Box::new(move |s| {
                    let fields = s.field_identification.as_mut().ok_or_else(|| Pdf2JsonError::NoStageResult {
                        document_id: id.clone(),
                        stage: Stage::FieldIdentification,
                    })?;
                    let field = fields.field_mut(field_id).ok_or(Pdf2JsonError::FieldNotFound {
                        document_id: id,
                        field_id,
                    })?;
                    field.region = Some(region);
                    Ok(())
                }),
            )
            .await?;
        state
            .field_identification
            .as_ref()
            .and_then(|fs| fs.field(field_id))
            .cloned()
            .ok_or_else(|| Pdf2JsonError::Internal(format!("field {field_id} vanished after update")))
    }

    pub async fn feedback_history(&self, document_id: &str, stage: Stage) -> Result<Vec<FeedbackEntry>, Pdf2JsonError> {
        let state = self.store.load_state(document_id).await?;
        Ok(state.feedback_for(stage).into_iter().cloned().collect())
    }

    // ── Inspection ───────────────────────────────────────────────────────

    /// Word clusters and table regions of the stored PDF.
    pub async fn field_boundaries(&self, document_id: &str, pages: &PageSelection) -> Result<LayoutAnalysis, Pdf2JsonError> {
        let document = self.store.get_document(document_id).await?;
        let request = ExtractRequest {
            pages: pages.clone(),
            words: true,
            images: false,
            dpi: self.config.dpi,
            max_rendered_pixels: self.config.max_rendered_pixels,
            password: self.config.password.clone(),
        };
        let content = self.extractor.extract(&document.storage_path, &request).await?;
        let words = content.words();
        Ok(LayoutAnalysis {
            page_count: content.page_count,
            boundaries: spatial::cluster(&words, &self.config.spatial),
            tables: spatial::table_regions(&words, &self.config.spatial),
        })
    }

    /// The exact text context a stage would send in `mode`.
    pub async fn preprocessing_preview(
        &self,
        document_id: &str,
        mode: ExtractionMode,
        pages: &PageSelection,
    ) -> Result<PreprocessingPreview, Pdf2JsonError> {
        let document = self.store.get_document(document_id).await?;
        let input = self.prepare_input(&document, mode, pages).await?;
        Ok(PreprocessingPreview {
            mode: input.mode,
            page_count: input.page_count,
            pages: input.pages,
            text: input.text,
            word_count: input.word_count,
            image_count: input.images.len(),
        })
    }

    // ── Usage ────────────────────────────────────────────────────────────

    pub async fn usage_records(&self) -> Result<Vec<UsageRecord>, Pdf2JsonError> {
        self.usage_log.usage_records().await
    }

    pub async fn usage_summary(&self, days: u32) -> Result<UsageSummary, Pdf2JsonError> {
        let records = self.usage_log.usage_records().await?;
        Ok(UsageSummary::from_records(&records, days, Utc::now()))
    }
}

/// Shallow merge: keys of `corrections` replace those of `base`.
fn merge(base: Value, corrections: Map<String, Value>) -> Value {
    match base {
        Value::Object(mut map) => {
            map.extend(corrections);
            Value::Object(map)
        }
        _ => Value::Object(corrections),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stage_options_default_to_text_first_page() {
        let opts: StageOptions = serde_json::from_value(json!({})).unwrap();
        assert_eq!(opts.mode, ExtractionMode::Text);
        assert_eq!(opts.pages, PageSelection::First);

        let opts: StageOptions = serde_json::from_value(json!({"mode": "spatial", "pages": "all"})).unwrap();
        assert_eq!(opts.mode, ExtractionMode::Spatial);
        assert_eq!(opts.pages, PageSelection::All);
    }

    #[test]
    fn merge_replaces_top_level_keys() {
        let merged = merge(
            json!({"structure": "form", "confidence": 0.4}),
            json!({"structure": "table"}).as_object().cloned().unwrap(),
        );
        assert_eq!(merged, json!({"structure": "table", "confidence": 0.4}));
    }
}
