//! Filesystem backend.
//!
//! ```text
//! <root>/
//! ├── documents/<id>/document.json
//! ├── documents/<id>/state.json
//! ├── documents/<id>/source.pdf
//! └── usage.jsonl
//! ```

use super::{check_id, DocumentLocks, DocumentStore, StateUpdate, UsageLog};
use crate::error::Pdf2JsonError;
use crate::model::{Document, PipelineState, UsageRecord};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DOCUMENT_FILE: &str = "document.json";
const STATE_FILE: &str = "state.json";
const SOURCE_FILE: &str = "source.pdf";
const USAGE_FILE: &str = "usage.jsonl";

pub struct FileStore {
    root: PathBuf,
    locks: DocumentLocks,
    usage_lock: Mutex<()>,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, Pdf2JsonError> {
        let root = root.into();
        let documents = root.join("documents");
        tokio::fs::create_dir_all(&documents)
            .await
            .map_err(|e| Pdf2JsonError::storage(&documents, e))?;
        info!("File store at {}", root.display());
        Ok(Self {
            root,
            locks: DocumentLocks::default(),
            usage_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_dir(&self, id: &str) -> PathBuf {
        self.root.join("documents").join(id)
    }

    fn usage_path(&self) -> PathBuf {
        self.root.join(USAGE_FILE)
    }
}

/// Write to a sibling temp file, then rename over the target.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), Pdf2JsonError> {
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| Pdf2JsonError::storage(&tmp_path, e))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Pdf2JsonError::storage(path, e))
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Pdf2JsonError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| Pdf2JsonError::CorruptState {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    write_atomic(path, &bytes).await
}

/// `Ok(None)` when the file does not exist.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, Pdf2JsonError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Pdf2JsonError::storage(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| Pdf2JsonError::CorruptState {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn create_document(&self, filename: &str, bytes: &[u8]) -> Result<Document, Pdf2JsonError> {
        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.document_dir(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Pdf2JsonError::storage(&dir, e))?;

        let source = dir.join(SOURCE_FILE);
        write_atomic(&source, bytes).await?;

        let document = Document {
            id: id.clone(),
            filename: filename.to_string(),
            storage_path: source,
            created_at: Utc::now(),
        };
        write_json(&dir.join(STATE_FILE), &PipelineState::new(&id)).await?;
        // document.json last: a directory without it is an incomplete upload.
        write_json(&dir.join(DOCUMENT_FILE), &document).await?;

        info!("Stored document {} ({}, {} bytes)", id, filename, bytes.len());
        Ok(document)
    }

    async fn get_document(&self, id: &str) -> Result<Document, Pdf2JsonError> {
        check_id(id)?;
        read_json(&self.document_dir(id).join(DOCUMENT_FILE))
            .await?
            .ok_or_else(|| Pdf2JsonError::DocumentNotFound(id.to_string()))
    }

    async fn recent_documents(&self, limit: usize) -> Result<Vec<Document>, Pdf2JsonError> {
        let documents_dir = self.root.join("documents");
        let mut entries = tokio::fs::read_dir(&documents_dir)
            .await
            .map_err(|e| Pdf2JsonError::storage(&documents_dir, e))?;

        let mut documents = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Pdf2JsonError::storage(&documents_dir, e))?
        {
            let path = entry.path().join(DOCUMENT_FILE);
            match read_json::<Document>(&path).await {
                Ok(Some(doc)) => documents.push(doc),
                Ok(None) => debug!("Skipping incomplete document dir {}", entry.path().display()),
                Err(e) => warn!("Skipping unreadable document: {}", e),
            }
        }
        documents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        documents.truncate(limit);
        Ok(documents)
    }

    async fn delete_document(&self, id: &str) -> Result<(), Pdf2JsonError> {
        check_id(id)?;
        let lock = self.locks.for_document(id);
        let _guard = lock.lock().await;
        let dir = self.document_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.locks.forget(id);
                return Err(Pdf2JsonError::DocumentNotFound(id.to_string()));
            }
            Err(e) => return Err(Pdf2JsonError::storage(&dir, e)),
        }
        self.locks.forget(id);
        info!("Deleted document {}", id);
        Ok(())
    }

    async fn load_state(&self, id: &str) -> Result<PipelineState, Pdf2JsonError> {
        check_id(id)?;
        read_json(&self.document_dir(id).join(STATE_FILE))
            .await?
            .ok_or_else(|| Pdf2JsonError::DocumentNotFound(id.to_string()))
    }

    async fn update_state(&self, id: &str, update: StateUpdate) -> Result<PipelineState, Pdf2JsonError> {
        check_id(id)?;
        let lock = self.locks.for_document(id);
        let _guard = lock.lock().await;

        let path = self.document_dir(id).join(STATE_FILE);
        let Some(mut state) = read_json::<PipelineState>(&path).await? else {
            self.locks.forget(id);
            return Err(Pdf2JsonError::DocumentNotFound(id.to_string()));
        };
        update(&mut state)?;
        state.updated_at = Utc::now();
        write_json(&path, &state).await?;
        Ok(state)
    }
}

#[async_trait]
impl UsageLog for FileStore {
    async fn append_usage(&self, record: &UsageRecord) -> Result<(), Pdf2JsonError> {
        let path = self.usage_path();
        let mut line = serde_json::to_string(record).map_err(|e| Pdf2JsonError::Internal(e.to_string()))?;
        line.push('\n');

        let _guard = self.usage_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Pdf2JsonError::storage(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Pdf2JsonError::storage(&path, e))?;
        file.flush().await.map_err(|e| Pdf2JsonError::storage(&path, e))
    }

    async fn usage_records(&self) -> Result<Vec<UsageRecord>, Pdf2JsonError> {
        let path = self.usage_path();
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Pdf2JsonError::storage(&path, e)),
        };
        let mut records = Vec::new();
        for (n, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(r) => records.push(r),
                // A crash mid-append leaves at most one torn line.
                Err(e) => warn!("{}:{}: skipping malformed usage record: {}", path.display(), n + 1, e),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Stage, StageStatus, Structure};
    use serde_json::json;

    async fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_writes_layout() {
        let (_dir, store) = store().await;
        let doc = store.create_document("form.pdf", b"%PDF-1.4").await.unwrap();

        let doc_dir = store.root().join("documents").join(&doc.id);
        assert!(doc_dir.join("document.json").exists());
        assert!(doc_dir.join("state.json").exists());
        assert_eq!(std::fs::read(&doc.storage_path).unwrap(), b"%PDF-1.4");
        assert_eq!(store.get_document(&doc.id).await.unwrap(), doc);

        let state = store.load_state(&doc.id).await.unwrap();
        assert_eq!(state.status(Stage::Classification), StageStatus::Pending);
    }

    #[tokio::test]
    async fn update_persists_and_failed_update_does_not() {
        let (_dir, store) = store().await;
        let doc = store.create_document("a.pdf", b"%PDF").await.unwrap();

        store
            .update_state(
                &doc.id,
                Box::new(|s| {
                    let structure = Structure::from_value(json!({"structure": "form"})).map_err(Pdf2JsonError::Internal)?;
                    s.classification = Some(structure);
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let err = store
            .update_state(
                &doc.id,
                Box::new(|s| {
                    s.classification = None;
                    Err(Pdf2JsonError::InvalidRequest("nope".into()))
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Pdf2JsonError::InvalidRequest(_)));

        let state = store.load_state(&doc.id).await.unwrap();
        assert_eq!(state.classification.unwrap().label(), "form");
        assert!(!doc.storage_path.with_file_name("state.tmp").exists());
    }

    #[tokio::test]
    async fn concurrent_updates_do_not_lose_writes() {
        let (_dir, store) = store().await;
        let store = std::sync::Arc::new(store);
        let doc = store.create_document("a.pdf", b"%PDF").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let id = doc.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_state(
                        &id,
                        Box::new(move |s| {
                            s.feedback_history.push(crate::model::FeedbackEntry {
                                stage: Stage::Classification,
                                iteration: i,
                                feedback: format!("note {i}"),
                                result_before: None,
                                result_after: json!({}),
                                timestamp: Utc::now(),
                            });
                            Ok(())
                        }),
                    )
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.load_state(&doc.id).await.unwrap().feedback_history.len(), 16);
    }

    #[tokio::test]
    async fn recent_documents_newest_first() {
        let (_dir, store) = store().await;
        let first = store.create_document("1.pdf", b"%PDF").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store.create_document("2.pdf", b"%PDF").await.unwrap();

        let docs = store.recent_documents(10).await.unwrap();
        assert_eq!(docs.iter().map(|d| &d.id).collect::<Vec<_>>(), [&second.id, &first.id]);
        assert_eq!(store.recent_documents(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_and_deleted_documents() {
        let (_dir, store) = store().await;
        let unknown = uuid::Uuid::new_v4().to_string();
        assert!(matches!(
            store.get_document(&unknown).await,
            Err(Pdf2JsonError::DocumentNotFound(_))
        ));

        let doc = store.create_document("a.pdf", b"%PDF").await.unwrap();
        store.delete_document(&doc.id).await.unwrap();
        assert!(matches!(
            store.load_state(&doc.id).await,
            Err(Pdf2JsonError::DocumentNotFound(_))
        ));

        assert!(store.update_state(&unknown, Box::new(|_| Ok(()))).await.is_err());
        assert!(store.delete_document(&unknown).await.is_err());
        assert_eq!(store.locks.len(), 0);
    }

    #[tokio::test]
    async fn usage_log_appends_and_skips_torn_lines() {
        let (_dir, store) = store().await;
        let record = UsageRecord {
            timestamp: Utc::now(),
            document_id: None,
            stage: Stage::Extraction,
            model: "gpt-4o".into(),
            attempt: 1,
            prompt_tokens: 10,
            completion_tokens: 5,
            cost_usd: 0.5,
            duration_ms: 3,
            error: None,
        };
        store.append_usage(&record).await.unwrap();
        store.append_usage(&record).await.unwrap();
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(store.root().join("usage.jsonl"))
            .await
            .unwrap()
            .write_all(b"{\"timestamp\": \"20")
            .await
            .unwrap();

        let records = store.usage_records().await.unwrap();
        assert_eq!(records, vec![record.clone(), record]);
    }
}
