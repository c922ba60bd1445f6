//! Shared fixtures: a scripted completion backend, a canned PDF extractor,
//! and a pipeline wired to a temporary file store.

#![allow(dead_code)]

use async_trait::async_trait;
use pdf2json::pipeline::content::{ExtractRequest, PageContent, PageImage, PdfContent};
use pdf2json::pipeline::llm::{BackendResponse, PromptMessage};
use pdf2json::{
    BoundingBox, CompletionBackend, CompletionError, ContentExtractor, FileStore, ModelConfig, Pdf2JsonError,
    Pipeline, PipelineConfig,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Smallest byte string the upload check accepts.
pub const PDF_BYTES: &[u8] = b"%PDF-1.4\n1 0 obj\n<<>>\nendobj\ntrailer\n<<>>\n%%EOF\n";

pub const PROMPT_TOKENS: u64 = 1000;
pub const COMPLETION_TOKENS: u64 = 500;

/// Replays canned replies in order and records every call.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<String, CompletionError>>>,
    calls: Mutex<Vec<(String, Vec<PromptMessage>)>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, content: impl Into<String>) -> &Self {
        self.replies.lock().unwrap().push_back(Ok(content.into()));
        self
    }

    pub fn fail(&self, error: CompletionError) -> &Self {
        self.replies.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Model name of every call, in order.
    pub fn models(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
    }

    /// Concatenated text of the user messages of call `index`.
    pub fn user_text(&self, index: usize) -> String {
        let calls = self.calls.lock().unwrap();
        calls[index]
            .1
            .iter()
            .skip(1)
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn system_text(&self, index: usize) -> String {
        self.calls.lock().unwrap()[index].1[0].text.clone()
    }

    pub fn image_count(&self, index: usize) -> usize {
        self.calls.lock().unwrap()[index].1.iter().map(|m| m.images.len()).sum()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, model: &ModelConfig, messages: &[PromptMessage]) -> Result<BackendResponse, CompletionError> {
        self.calls
            .lock()
            .unwrap()
            .push((model.model.clone(), messages.to_vec()));
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(content)) => Ok(BackendResponse {
                content,
                prompt_tokens: PROMPT_TOKENS,
                completion_tokens: COMPLETION_TOKENS,
            }),
            Some(Err(e)) => Err(e),
            None => Err(CompletionError::Permanent("no scripted reply left".into())),
        }
    }
}

/// A form: "Name: John Smith" and an empty "Date:" field, with a rendered
/// page image when requested. One page unless `set_page_count` says more;
/// every page after the first starts with "Page N".
#[derive(Default)]
pub struct FormExtractor {
    pub requests: Mutex<Vec<ExtractRequest>>,
    page_count: AtomicUsize,
}

impl FormExtractor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_page_count(&self, n: usize) {
        self.page_count.store(n, Ordering::SeqCst);
    }

    fn pages(&self) -> usize {
        self.page_count.load(Ordering::SeqCst).max(1)
    }

    pub fn last_request(&self) -> Option<ExtractRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

pub fn word(text: &str, x0: f32, y0: f32, x1: f32, y1: f32) -> pdf2json::model::Word {
    pdf2json::model::Word {
        text: text.to_string(),
        bbox: BoundingBox::new(x0, y0, x1, y1),
        page: 0,
    }
}

pub fn form_words() -> Vec<pdf2json::model::Word> {
    vec![
        word("Name:", 50.0, 100.0, 90.0, 112.0),
        word("John", 100.0, 100.0, 130.0, 112.0),
        word("Smith", 134.0, 100.0, 170.0, 112.0),
        word("Date:", 50.0, 130.0, 85.0, 142.0),
    ]
}

#[async_trait]
impl ContentExtractor for FormExtractor {
    async fn extract(&self, path: &Path, request: &ExtractRequest) -> Result<PdfContent, Pdf2JsonError> {
        if !path.exists() {
            return Err(Pdf2JsonError::FileNotFound { path: path.to_path_buf() });
        }
        self.requests.lock().unwrap().push(request.clone());
        let page_count = self.pages();
        let pages = request
            .pages
            .to_indices(page_count)
            .into_iter()
            .map(|index| PageContent {
                index,
                width: 612.0,
                height: 792.0,
                text: if index == 0 {
                    "Name: John Smith\nDate:".to_string()
                } else {
                    format!("Page {}\nName: John Smith\nDate:", index + 1)
                },
                words: if request.words {
                    form_words().into_iter().map(|w| pdf2json::model::Word { page: index, ..w }).collect()
                } else {
                    Vec::new()
                },
                image: request.images.then(|| PageImage {
                    png: vec![0x89, b'P', b'N', b'G'],
                    width: 1275,
                    height: 1650,
                }),
            })
            .collect();
        Ok(PdfContent { page_count, pages })
    }
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub backend: Arc<ScriptedBackend>,
    pub extractor: Arc<FormExtractor>,
    pub store: Arc<FileStore>,
    pub dir: TempDir,
}

pub fn test_config(dir: &Path) -> PipelineConfig {
    PipelineConfig::builder()
        .data_dir(dir)
        .retry_backoff_ms(1)
        .max_retries(3)
        .build()
        .expect("valid test config")
}

pub async fn harness() -> Harness {
    harness_with(|c| c).await
}

pub async fn harness_with(tweak: impl FnOnce(PipelineConfig) -> PipelineConfig) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let config = tweak(test_config(dir.path()));
    let store = Arc::new(FileStore::open(dir.path()).await.expect("open store"));
    let backend = ScriptedBackend::new();
    let extractor = FormExtractor::new();
    let pipeline = Pipeline::new(config, store.clone(), extractor.clone(), backend.clone());
    Harness {
        pipeline,
        backend,
        extractor,
        store,
        dir,
    }
}
