//! Persistence for documents, pipeline state and the usage log.
//!
//! Two backends implement the same traits:
//!
//! - [`FileStore`]: one directory per document under `<data>/documents/`,
//!   JSON files replaced atomically, usage appended to `<data>/usage.jsonl`.
//! - [`MemoryStore`]: maps in memory; uploaded PDFs still land in a temp
//!   directory because pdfium reads from a path.
//!
//! State changes go through [`DocumentStore::update_state`], which runs the
//! closure under a per-document async lock so two writers for the same
//! document never interleave. Callers never hold that lock across an AI call.

mod fs;
mod memory;

pub use fs::FileStore;
pub use memory::MemoryStore;

use crate::error::Pdf2JsonError;
use crate::model::{Document, PipelineState, UsageRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A read-modify-write step on a document's state. Returning an error leaves
/// the stored state untouched.
pub type StateUpdate = Box<dyn FnOnce(&mut PipelineState) -> Result<(), Pdf2JsonError> + Send>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist the PDF bytes and a fresh [`PipelineState`]; returns the new document.
    async fn create_document(&self, filename: &str, bytes: &[u8]) -> Result<Document, Pdf2JsonError>;

    async fn get_document(&self, id: &str) -> Result<Document, Pdf2JsonError>;

    /// Newest first.
    async fn recent_documents(&self, limit: usize) -> Result<Vec<Document>, Pdf2JsonError>;

    async fn delete_document(&self, id: &str) -> Result<(), Pdf2JsonError>;

    async fn load_state(&self, id: &str) -> Result<PipelineState, Pdf2JsonError>;

    /// Apply `update` to the stored state and persist the result.
    async fn update_state(&self, id: &str, update: StateUpdate) -> Result<PipelineState, Pdf2JsonError>;
}

/// Append-only record of completion attempts.
#[async_trait]
pub trait UsageLog: Send + Sync {
    async fn append_usage(&self, record: &UsageRecord) -> Result<(), Pdf2JsonError>;

    /// Oldest first.
    async fn usage_records(&self) -> Result<Vec<UsageRecord>, Pdf2JsonError>;
}

/// One async mutex per document id.
#[derive(Default)]
pub(crate) struct DocumentLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DocumentLocks {
    pub(crate) fn for_document(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    pub(crate) fn forget(&self, id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.remove(id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

/// Ids are UUIDs; anything else cannot name a stored document.
pub(crate) fn check_id(id: &str) -> Result<(), Pdf2JsonError> {
    uuid::Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| Pdf2JsonError::DocumentNotFound(id.to_string()))
}
