//! Progress-callback trait for per-stage pipeline events.
//!
//! Pass an [`Arc<dyn PipelineProgressCallback>`] to
//! [`crate::Pipeline::with_progress`] to observe stages as they run. The CLI
//! drives its spinner from these events; a server could forward them to a
//! websocket without the library knowing.
//!
//! # Example
//!
//! ```rust
//! use pdf2json::{PipelineProgressCallback, Stage};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct RetryCounter(AtomicUsize);
//!
//! impl PipelineProgressCallback for RetryCounter {
//!     fn on_attempt_failed(&self, _doc: &str, stage: Stage, attempt: u32, error: &str) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{stage}: attempt {attempt} failed: {error}");
//!     }
//! }
//! ```

use crate::model::Stage;
use std::sync::Arc;

/// Called by the pipeline as stages start, retry, and finish.
///
/// Implementations must be `Send + Sync`: stages for different documents run
/// concurrently on the tokio runtime. All methods default to no-ops.
pub trait PipelineProgressCallback: Send + Sync {
    /// A stage passed its precondition checks and is about to call the model.
    fn on_stage_start(&self, document_id: &str, stage: Stage) {
        let _ = (document_id, stage);
    }

    /// One completion attempt failed; `attempt` is 1-based.
    fn on_attempt_failed(&self, document_id: &str, stage: Stage, attempt: u32, error: &str) {
        let _ = (document_id, stage, attempt, error);
    }

    /// The stage result was persisted.
    ///
    /// `attempts` counts every completion request the stage made, including
    /// the JSON repair follow-up.
    fn on_stage_complete(&self, document_id: &str, stage: Stage, attempts: u32) {
        let _ = (document_id, stage, attempts);
    }

    /// The stage failed and its status was recorded as failed.
    fn on_stage_error(&self, document_id: &str, stage: Stage, error: &str) {
        let _ = (document_id, stage, error);
    }

    /// Page-by-page extraction started on `page` (1-indexed) of `total` selected pages.
    fn on_page_start(&self, document_id: &str, page: usize, total: usize) {
        let _ = (document_id, page, total);
    }

    fn on_page_complete(&self, document_id: &str, page: usize, total: usize) {
        let _ = (document_id, page, total);
    }

    /// The page is left out of the merged result.
    fn on_page_error(&self, document_id: &str, page: usize, total: usize, error: &str) {
        let _ = (document_id, page, total, error);
    }
}

/// The default when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
