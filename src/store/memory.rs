//! In-memory backend for tests and throwaway runs.

use super::{check_id, DocumentLocks, DocumentStore, StateUpdate, UsageLog};
use crate::error::Pdf2JsonError;
use crate::model::{Document, PipelineState, UsageRecord};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tempfile::TempDir;
use tokio::sync::RwLock;

pub struct MemoryStore {
    /// Uploaded PDFs, removed when the store is dropped.
    sources: TempDir,
    documents: RwLock<HashMap<String, Document>>,
    states: RwLock<HashMap<String, PipelineState>>,
    usage: RwLock<Vec<UsageRecord>>,
    locks: DocumentLocks,
}

impl MemoryStore {
    pub fn new() -> Result<Self, Pdf2JsonError> {
        let sources = TempDir::new().map_err(|e| Pdf2JsonError::Internal(format!("temp dir: {e}")))?;
        Ok(Self {
            sources,
            documents: RwLock::default(),
            states: RwLock::default(),
            usage: RwLock::default(),
            locks: DocumentLocks::default(),
        })
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_document(&self, filename: &str, bytes: &[u8]) -> Result<Document, Pdf2JsonError> {
        let id = uuid::Uuid::new_v4().to_string();
        let path = self.sources.path().join(format!("{id}.pdf"));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| Pdf2JsonError::storage(&path, e))?;

        let document = Document {
            id: id.clone(),
            filename: filename.to_string(),
            storage_path: path,
            created_at: Utc::now(),
        };
        self.states.write().await.insert(id.clone(), PipelineState::new(&id));
        self.documents.write().await.insert(id, document.clone());
        Ok(document)
    }

    async fn get_document(&self, id: &str) -> Result<Document, Pdf2JsonError> {
        check_id(id)?;
        self.documents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Pdf2JsonError::DocumentNotFound(id.to_string()))
    }

    async fn recent_documents(&self, limit: usize) -> Result<Vec<Document>, Pdf2JsonError> {
        let mut documents: Vec<Document> = self.documents.read().await.values().cloned().collect();
        documents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        documents.truncate(limit);
        Ok(documents)
    }

    async fn delete_document(&self, id: &str) -> Result<(), Pdf2JsonError> {
        check_id(id)?;
        let lock = self.locks.for_document(id);
        let _guard = lock.lock().await;
        let removed = self.documents.write().await.remove(id);
        self.states.write().await.remove(id);
        self.locks.forget(id);
        let document = removed.ok_or_else(|| Pdf2JsonError::DocumentNotFound(id.to_string()))?;
        // The temp dir is cleaned up on drop anyway.
        let _ = tokio::fs::remove_file(&document.storage_path).await;
        Ok(())
    }

    async fn load_state(&self, id: &str) -> Result<PipelineState, Pdf2JsonError> {
        check_id(id)?;
        self.states
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Pdf2JsonError::DocumentNotFound(id.to_string()))
    }

    async fn update_state(&self, id: &str, update: StateUpdate) -> Result<PipelineState, Pdf2JsonError> {
        check_id(id)?;
        let lock = self.locks.for_document(id);
        let _guard = lock.lock().await;

        let mut state = match self.load_state(id).await {
            Ok(state) => state,
            Err(e) => {
                self.locks.forget(id);
                return Err(e);
            }
        };
        update(&mut state)?;
        state.updated_at = Utc::now();
        self.states.write().await.insert(id.to_string(), state.clone());
        Ok(state)
    }
}

#[async_trait]
impl UsageLog for MemoryStore {
    async fn append_usage(&self, record: &UsageRecord) -> Result<(), Pdf2JsonError> {
        self.usage.write().await.push(record.clone());
        Ok(())
    }

    async fn usage_records(&self) -> Result<Vec<UsageRecord>, Pdf2JsonError> {
        Ok(self.usage.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Stage, StageStatus};

    #[tokio::test]
    async fn round_trip_through_memory() {
        let store = MemoryStore::new().unwrap();
        let doc = store.create_document("x.pdf", b"%PDF-1.7").await.unwrap();
        assert_eq!(tokio::fs::read(&doc.storage_path).await.unwrap(), b"%PDF-1.7");

        store
            .update_state(
                &doc.id,
                Box::new(|s| {
                    s.set_status(Stage::Classification, StageStatus::Running);
                    Ok(())
                }),
            )
            .await
            .unwrap();
        let state = store.load_state(&doc.id).await.unwrap();
        assert_eq!(state.status(Stage::Classification), StageStatus::Running);

        store.delete_document(&doc.id).await.unwrap();
        assert!(store.get_document(&doc.id).await.is_err());
        assert!(store.recent_documents(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_leave_no_locks_behind() {
        let store = MemoryStore::new().unwrap();
        assert!(matches!(
            store.get_document("../etc").await,
            Err(Pdf2JsonError::DocumentNotFound(_))
        ));

        let missing = uuid::Uuid::new_v4().to_string();
        for _ in 0..3 {
            let err = store.update_state(&missing, Box::new(|_| Ok(()))).await.unwrap_err();
            assert!(matches!(err, Pdf2JsonError::DocumentNotFound(_)));
            assert!(store.delete_document(&missing).await.is_err());
        }
        assert!(store.update_state("not-a-uuid", Box::new(|_| Ok(()))).await.is_err());
        assert_eq!(store.locks.len(), 0);
    }
}
