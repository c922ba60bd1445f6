//! Error types for the pdf2json library.
//!
//! Two distinct error types reflect two distinct failure scopes:
//!
//! * [`Pdf2JsonError`]: returned from a pipeline operation. The operation
//!   failed as a whole, but the failure is local to that one call: previously
//!   persisted stage results for the document are left untouched.
//!
//! * [`CompletionError`]: a single completion attempt failed. The
//!   [`crate::pipeline::llm::CompletionClient`] inspects it to decide whether
//!   another attempt is worthwhile, and only converts it into a
//!   [`Pdf2JsonError`] once the retry budget is spent.

use crate::model::Stage;
use edgequake_llm::{LlmError, RetryStrategy};
use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by pipeline, store and extractor operations.
#[derive(Debug, Error)]
pub enum Pdf2JsonError {
    // ── Caller errors ─────────────────────────────────────────────────────
    /// Stage N > 1 was requested before stage N−1 produced a result.
    #[error("Cannot run {stage} for document '{document_id}': {missing} has not completed yet")]
    StagePrerequisiteMissing {
        document_id: String,
        stage: Stage,
        missing: Stage,
    },

    /// Stage number outside 1..=3.
    #[error("Invalid stage {0}: expected 1 (classification), 2 (field identification) or 3 (extraction)")]
    InvalidStage(u8),

    /// No document with this identifier exists in the store.
    #[error("Document '{0}' not found")]
    DocumentNotFound(String),

    /// A region edit referenced a field id that is not in the stored FieldSet.
    #[error("Field {field_id} not found in document '{document_id}'")]
    FieldNotFound { document_id: String, field_id: u32 },

    /// An operation needs a stored stage result that does not exist.
    #[error("Document '{document_id}' has no {stage} result")]
    NoStageResult { document_id: String, stage: Stage },

    /// The request itself is malformed (empty feedback, bad corrections…).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // ── PDF errors ────────────────────────────────────────────────────────
    /// The PDF cannot be opened: corrupt, encrypted, or not a PDF at all.
    #[error("Unreadable PDF '{path}': {detail}")]
    UnreadablePdf { path: PathBuf, detail: String },

    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
PDFium is normally downloaded automatically on first run.\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy."
    )]
    PdfiumBindingFailed(String),

    // ── AI errors ─────────────────────────────────────────────────────────
    /// The configured provider could not be created (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The completion API failed and retrying did not help (or could not).
    #[error("AI request for {stage} failed after {attempts} attempt(s): {detail}")]
    AiRequestFailed {
        stage: Stage,
        attempts: u32,
        detail: String,
    },

    /// The model answered, but not with JSON of the shape the stage expects.
    #[error("AI response for {stage} could not be parsed: {detail}")]
    AiResponseUnparseable {
        stage: Stage,
        detail: String,
        raw: String,
    },

    // ── Storage errors ────────────────────────────────────────────────────
    /// Reading or writing persisted state failed.
    #[error("Storage error at '{path}': {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Persisted state exists but cannot be deserialised.
    #[error("Corrupt persisted state at '{path}': {detail}")]
    CorruptState { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Pdf2JsonError {
    /// True for errors caused by the caller's request rather than by the
    /// service or its collaborators.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Pdf2JsonError::StagePrerequisiteMissing { .. }
                | Pdf2JsonError::InvalidStage(_)
                | Pdf2JsonError::DocumentNotFound(_)
                | Pdf2JsonError::FieldNotFound { .. }
                | Pdf2JsonError::NoStageResult { .. }
                | Pdf2JsonError::InvalidRequest(_)
                | Pdf2JsonError::UnreadablePdf { .. }
        )
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Pdf2JsonError::Storage {
            path: path.into(),
            source,
        }
    }
}

/// A failed completion attempt, classified for the retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompletionError {
    /// Timeout, rate limit, 5xx, dropped connection. Worth retrying.
    #[error("transient: {0}")]
    Transient(String),

    /// Authentication failure or malformed request. Retrying cannot help.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl CompletionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CompletionError::Transient(_))
    }

    pub fn detail(&self) -> &str {
        match self {
            CompletionError::Transient(d) | CompletionError::Permanent(d) => d,
        }
    }

    /// Classify a typed provider error.
    ///
    /// Variants the provider crate marks as not retryable are permanent, and
    /// so is a token limit since the same prompt would overflow again. The
    /// rest still go through [`CompletionError::classify`] because an
    /// `ApiError` often carries the HTTP status only in its message.
    pub fn from_llm(err: &LlmError) -> Self {
        match err.retry_strategy() {
            RetryStrategy::NoRetry | RetryStrategy::ReduceContext => {
                CompletionError::Permanent(err.to_string())
            }
            _ => CompletionError::classify(err.to_string()),
        }
    }

    /// Classify a provider error message.
    ///
    /// Provider crates surface HTTP failures as formatted strings, so the
    /// status code or a well-known phrase is the only signal available.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        const PERMANENT: &[&str] = &[
            "401",
            "403",
            "unauthorized",
            "forbidden",
            "invalid api key",
            "incorrect api key",
            "authentication",
            "400 bad request",
            "invalid_request",
            "content_filter",
            "not configured",
        ];
        if PERMANENT.iter().any(|p| lower.contains(p)) {
            return CompletionError::Permanent(message);
        }
        CompletionError::Transient(message)
    }
}
