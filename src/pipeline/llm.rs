//! Completion client: prompt messages in, validated JSON out.
//!
//! The client owns everything between a finished prompt and a typed stage
//! result: picking the model for the stage, retrying transient failures,
//! recording one [`UsageRecord`] per attempt, salvaging JSON from the reply,
//! and sending a single repair request when the reply still has the wrong
//! shape.
//!
//! The network sits behind [`CompletionBackend`]. Production uses
//! [`LlmBackend`], which wraps an `edgequake_llm` provider; tests plug in a
//! scripted backend.
//!
//! ## Retry Strategy
//!
//! Transient failures (timeouts, 429, 5xx) are retried with exponential
//! backoff `retry_backoff_ms * 2^(retry-1)`: 500 ms → 1 s → 2 s with the
//! defaults. Permanent failures (bad key, malformed request) stop at once.

use crate::config::{ModelConfig, PipelineConfig};
use crate::error::{CompletionError, Pdf2JsonError};
use crate::model::{Stage, UsageRecord};
use crate::pipeline::content::PageImage;
use crate::pipeline::{encode, postprocess};
use crate::progress::PipelineProgressCallback;
use crate::store::UsageLog;
use crate::usage;
use async_trait::async_trait;
use chrono::Utc;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

// ── Messages ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
}

/// One chat message, optionally carrying page images.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: Role,
    pub text: String,
    pub images: Vec<PageImage>,
}

impl PromptMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn user_with_images(text: impl Into<String>, images: Vec<PageImage>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            images,
        }
    }
}

/// A stage's request to the completion client.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub stage: Stage,
    pub document_id: Option<String>,
    pub messages: Vec<PromptMessage>,
}

/// Raw reply from a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendResponse {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A validated reply.
#[derive(Debug, Clone)]
pub struct Completion<T> {
    pub value: T,
    /// Text of the reply that produced `value`.
    pub raw: String,
    /// Every API attempt, including the repair request.
    pub usage: Vec<UsageRecord>,
}

impl<T> Completion<T> {
    pub fn attempts(&self) -> u32 {
        self.usage.len() as u32
    }
}

// ── Backends ─────────────────────────────────────────────────────────────

/// Transport for a single completion attempt.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        model: &ModelConfig,
        messages: &[PromptMessage],
    ) -> Result<BackendResponse, CompletionError>;
}

/// [`CompletionBackend`] over `edgequake_llm` providers.
///
/// A pre-built provider serves every model. Otherwise one provider per model
/// name is created on first use through `ProviderFactory`, which reads the
/// provider's API key from the environment.
pub struct LlmBackend {
    provider_name: String,
    fixed: Option<Arc<dyn LLMProvider>>,
    providers: Mutex<HashMap<String, Arc<dyn LLMProvider>>>,
}

impl LlmBackend {
    pub fn new(provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            fixed: None,
            providers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_provider(provider_name: impl Into<String>, provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider_name: provider_name.into(),
            fixed: Some(provider),
            providers: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        match &config.provider {
            Some(p) => Self::with_provider(config.provider_name.clone(), Arc::clone(p)),
            None => Self::new(config.provider_name.clone()),
        }
    }

    /// Like [`LlmBackend::from_config`], but create the provider for every
    /// stage model up front so a missing API key fails at startup.
    pub fn connect(config: &PipelineConfig) -> Result<Self, Pdf2JsonError> {
        if let Some(p) = &config.provider {
            return Ok(Self::with_provider(config.provider_name.clone(), Arc::clone(p)));
        }
        let mut providers = HashMap::new();
        for stage in Stage::ALL {
            let model = &config.model(stage).model;
            if providers.contains_key(model) {
                continue;
            }
            let provider = ProviderFactory::create_llm_provider(&config.provider_name, model).map_err(|e| {
                Pdf2JsonError::ProviderNotConfigured {
                    provider: config.provider_name.clone(),
                    hint: format!("{e}"),
                }
            })?;
            providers.insert(model.clone(), provider);
        }
        info!("Using {} provider for {} model(s)", config.provider_name, providers.len());
        Ok(Self {
            provider_name: config.provider_name.clone(),
            fixed: None,
            providers: Mutex::new(providers),
        })
    }

    async fn provider_for(&self, model: &str) -> Result<Arc<dyn LLMProvider>, CompletionError> {
        if let Some(p) = &self.fixed {
            return Ok(Arc::clone(p));
        }
        let mut providers = self.providers.lock().await;
        if let Some(p) = providers.get(model) {
            return Ok(Arc::clone(p));
        }
        let provider = ProviderFactory::create_llm_provider(&self.provider_name, model).map_err(|e| {
            CompletionError::Permanent(format!(
                "LLM provider '{}' not configured for model '{}': {}",
                self.provider_name, model, e
            ))
        })?;
        info!("Created {} provider for model {}", self.provider_name, model);
        providers.insert(model.to_string(), Arc::clone(&provider));
        Ok(provider)
    }
}

fn to_chat_messages(messages: &[PromptMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| match m.role {
            Role::System => ChatMessage::system(m.text.as_str()),
            Role::User => ChatMessage::user_with_images(
                m.text.as_str(),
                m.images.iter().map(|img| encode::image_data(&img.png)).collect(),
            ),
        })
        .collect()
}

#[async_trait]
impl CompletionBackend for LlmBackend {
    async fn complete(
        &self,
        model: &ModelConfig,
        messages: &[PromptMessage],
    ) -> Result<BackendResponse, CompletionError> {
        let provider = self.provider_for(&model.model).await?;
        let chat = to_chat_messages(messages);
        let options = CompletionOptions {
            temperature: Some(model.temperature),
            max_tokens: Some(model.max_tokens),
            ..Default::default()
        };

        let secs = model.timeout_secs;
        match timeout(Duration::from_secs(secs), provider.chat(&chat, Some(&options))).await {
            Err(_) => Err(CompletionError::Transient(format!("request timed out after {secs}s"))),
            Ok(Err(e)) => Err(CompletionError::from_llm(&e)),
            Ok(Ok(response)) => Ok(BackendResponse {
                content: response.content,
                prompt_tokens: response.prompt_tokens as u64,
                completion_tokens: response.completion_tokens as u64,
            }),
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────────

/// Longest slice of a bad reply quoted back in the repair request.
const REPAIR_QUOTE_LIMIT: usize = 4000;

pub struct CompletionClient {
    backend: Arc<dyn CompletionBackend>,
    models: HashMap<Stage, ModelConfig>,
    usage_log: Option<Arc<dyn UsageLog>>,
}

impl CompletionClient {
    /// `usage_log` is `None` when cost tracking is off.
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        config: &PipelineConfig,
        usage_log: Option<Arc<dyn UsageLog>>,
    ) -> Self {
        let models = Stage::ALL.iter().map(|s| (*s, config.model(*s).clone())).collect();
        Self {
            backend,
            models,
            usage_log,
        }
    }

    pub fn model(&self, stage: Stage) -> Option<&ModelConfig> {
        self.models.get(&stage)
    }

    /// Run the request and validate the reply with `validate`.
    ///
    /// A reply that is not JSON, or JSON that `validate` rejects, triggers one
    /// repair request quoting the bad reply. If that fails too the result is
    /// [`Pdf2JsonError::AiResponseUnparseable`].
    pub async fn complete_json<T, F>(
        &self,
        request: &CompletionRequest,
        progress: &dyn PipelineProgressCallback,
        validate: F,
    ) -> Result<Completion<T>, Pdf2JsonError>
    where
        F: Fn(Value) -> Result<T, String>,
    {
        let stage = request.stage;
        let model = self
            .models
            .get(&stage)
            .ok_or_else(|| Pdf2JsonError::Internal(format!("no model configured for {stage}")))?;
        let mut usage = Vec::new();

        let raw = self.send(request, model, &request.messages, &mut usage, progress).await?;
        let reason = match postprocess::parse_json_response(&raw).and_then(&validate) {
            Ok(value) => return Ok(Completion { value, raw, usage }),
            Err(reason) => reason,
        };

        warn!("{}: reply unusable ({}), sending one repair request", stage, reason);
        let mut messages = request.messages.clone();
        messages.push(PromptMessage::user(repair_prompt(&raw, &reason)));
        let repaired = self.send(request, model, &messages, &mut usage, progress).await?;

        match postprocess::parse_json_response(&repaired).and_then(&validate) {
            Ok(value) => Ok(Completion {
                value,
                raw: repaired,
                usage,
            }),
            Err(detail) => Err(Pdf2JsonError::AiResponseUnparseable {
                stage,
                detail,
                raw: repaired,
            }),
        }
    }

    /// One logical request: the first attempt plus up to `max_retries` retries.
    async fn send(
        &self,
        request: &CompletionRequest,
        model: &ModelConfig,
        messages: &[PromptMessage],
        usage: &mut Vec<UsageRecord>,
        progress: &dyn PipelineProgressCallback,
    ) -> Result<String, Pdf2JsonError> {
        let stage = request.stage;
        let doc = request.document_id.as_deref().unwrap_or("-");
        let mut last_err: Option<CompletionError> = None;
        let mut tries = 0u32;

        for retry in 0..=model.max_retries {
            if retry > 0 {
                let backoff = model.backoff_for(retry);
                warn!(
                    "{} [{}]: retry {}/{} after {}ms",
                    stage,
                    doc,
                    retry,
                    model.max_retries,
                    backoff.as_millis()
                );
                sleep(backoff).await;
            }
            tries += 1;
            let started = Instant::now();
            let outcome = self.backend.complete(model, messages).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let attempt = usage.len() as u32 + 1;

            match outcome {
                Ok(response) => {
                    debug!(
                        "{} [{}]: {} input tokens, {} output tokens, {}ms",
                        stage, doc, response.prompt_tokens, response.completion_tokens, elapsed_ms
                    );
                    let record = UsageRecord {
                        timestamp: Utc::now(),
                        document_id: request.document_id.clone(),
                        stage,
                        model: model.model.clone(),
                        attempt,
                        prompt_tokens: response.prompt_tokens,
                        completion_tokens: response.completion_tokens,
                        cost_usd: usage::cost_usd(&model.model, response.prompt_tokens, response.completion_tokens),
                        duration_ms: elapsed_ms,
                        error: None,
                    };
                    self.record(record, usage).await;
                    return Ok(response.content);
                }
                Err(e) => {
                    warn!("{} [{}]: attempt {} failed: {}", stage, doc, attempt, e);
                    progress.on_attempt_failed(doc, stage, attempt, e.detail());
                    let record = UsageRecord {
                        timestamp: Utc::now(),
                        document_id: request.document_id.clone(),
                        stage,
                        model: model.model.clone(),
                        attempt,
                        prompt_tokens: 0,
                        completion_tokens: 0,
                        cost_usd: 0.0,
                        duration_ms: elapsed_ms,
                        error: Some(e.detail().to_string()),
                    };
                    self.record(record, usage).await;
                    let transient = e.is_transient();
                    last_err = Some(e);
                    if !transient {
                        break;
                    }
                }
            }
        }

        Err(Pdf2JsonError::AiRequestFailed {
            stage,
            attempts: tries,
            detail: last_err
                .map(|e| e.detail().to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
        })
    }

    async fn record(&self, record: UsageRecord, usage: &mut Vec<UsageRecord>) {
        if let Some(log) = &self.usage_log {
            if let Err(e) = log.append_usage(&record).await {
                warn!("Failed to append usage record: {}", e);
            }
        }
        usage.push(record);
    }
}

fn repair_prompt(bad_reply: &str, reason: &str) -> String {
    let quoted: String = bad_reply.chars().take(REPAIR_QUOTE_LIMIT).collect();
    format!(
        "Your previous reply could not be used: {reason}.\n\n\
         Previous reply:\n{quoted}\n\n\
         Reply again with the complete answer as a single valid JSON object \
         in the format requested above. No markdown fences, no commentary."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgressCallback;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Replays canned outcomes and records the messages it saw.
    struct Scripted {
        replies: StdMutex<VecDeque<Result<String, CompletionError>>>,
        seen: StdMutex<Vec<Vec<PromptMessage>>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<&str, CompletionError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: StdMutex::new(replies.into_iter().map(|r| r.map(str::to_string)).collect()),
                seen: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionBackend for Scripted {
        async fn complete(
            &self,
            _model: &ModelConfig,
            messages: &[PromptMessage],
        ) -> Result<BackendResponse, CompletionError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            let next = self.replies.lock().unwrap().pop_front();
            match next {
                Some(Ok(content)) => Ok(BackendResponse {
                    content,
                    prompt_tokens: 1000,
                    completion_tokens: 500,
                }),
                Some(Err(e)) => Err(e),
                None => Err(CompletionError::Permanent("script exhausted".into())),
            }
        }
    }

    fn client(backend: Arc<Scripted>) -> CompletionClient {
        let config = PipelineConfig::builder().retry_backoff_ms(1).build().unwrap();
        CompletionClient::new(backend, &config, None)
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            stage: Stage::Classification,
            document_id: Some("doc-1".into()),
            messages: vec![PromptMessage::system("classify"), PromptMessage::user("text")],
        }
    }

    fn as_object(v: Value) -> Result<Value, String> {
        if v.is_object() {
            Ok(v)
        } else {
            Err("expected an object".into())
        }
    }

    #[tokio::test]
    async fn transient_then_success_records_each_attempt() {
        let backend = Scripted::new(vec![
            Err(CompletionError::Transient("HTTP 503".into())),
            Ok(r#"{"structure": "form"}"#),
        ]);
        let c = client(backend.clone())
            .complete_json(&request(), &NoopProgressCallback, as_object)
            .await
            .unwrap();

        assert_eq!(c.value["structure"], "form");
        assert_eq!(c.attempts(), 2);
        assert_eq!(c.usage[0].attempt, 1);
        assert!(!c.usage[0].succeeded());
        assert_eq!(c.usage[0].cost_usd, 0.0);
        assert!(c.usage[1].succeeded());
        assert_eq!(c.usage[1].model, "gpt-3.5-turbo");
        // 1000 × 0.0015/1K + 500 × 0.002/1K
        assert!((c.usage[1].cost_usd - 0.0025).abs() < 1e-9);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let backend = Scripted::new(vec![Err(CompletionError::Permanent("HTTP 401".into()))]);
        let err = client(backend.clone())
            .complete_json(&request(), &NoopProgressCallback, as_object)
            .await
            .unwrap_err();
        assert!(matches!(err, Pdf2JsonError::AiRequestFailed { attempts: 1, .. }));
        assert_eq!(backend.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retries_stop_after_budget() {
        let transient = || Err(CompletionError::Transient("timeout".into()));
        let backend = Scripted::new(vec![transient(), transient(), transient(), transient(), transient()]);
        let err = client(backend.clone())
            .complete_json(&request(), &NoopProgressCallback, as_object)
            .await
            .unwrap_err();
        // 1 attempt + 3 retries
        assert!(matches!(err, Pdf2JsonError::AiRequestFailed { attempts: 4, .. }));
        assert_eq!(backend.seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn bad_shape_gets_exactly_one_repair() {
        let backend = Scripted::new(vec![Ok("[1, 2, 3]"), Ok(r#"{"structure": "table"}"#)]);
        let c = client(backend.clone())
            .complete_json(&request(), &NoopProgressCallback, as_object)
            .await
            .unwrap();
        assert_eq!(c.value["structure"], "table");
        assert_eq!(c.attempts(), 2);

        let seen = backend.seen.lock().unwrap();
        let repair = seen[1].last().unwrap();
        assert_eq!(repair.role, Role::User);
        assert!(repair.text.contains("[1, 2, 3]"));
        assert!(repair.text.contains("expected an object"));
    }

    #[tokio::test]
    async fn second_bad_reply_is_unparseable() {
        let backend = Scripted::new(vec![Ok("no idea"), Ok("still no idea"), Ok("{}")]);
        let err = client(backend.clone())
            .complete_json(&request(), &NoopProgressCallback, as_object)
            .await
            .unwrap_err();
        match err {
            Pdf2JsonError::AiResponseUnparseable { stage, raw, .. } => {
                assert_eq!(stage, Stage::Classification);
                assert_eq!(raw, "still no idea");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(backend.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn repair_prompt_quotes_a_bounded_prefix() {
        let long = "x".repeat(REPAIR_QUOTE_LIMIT * 2);
        let p = repair_prompt(&long, "not valid JSON");
        assert!(p.len() < REPAIR_QUOTE_LIMIT + 400);
        assert!(p.contains("not valid JSON"));
    }
}
