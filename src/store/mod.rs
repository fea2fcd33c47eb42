//! Per-subject document store.
//!
//! The store keeps one immutable [`SubjectSnapshot`] per subject behind an
//! `Arc`. Readers clone the `Arc` and never observe a half-applied ingest
//! or removal. Writers are serialized by an async mutex, build the next
//! snapshot off to the side, persist it (when a database is attached) and
//! only then swap it in.
//!
//! ```text
//! upload ─► detect type ─► extract segments ─► chunk ─► embed (optional)
//!                                                         │
//!                                  write lock ◄───────────┘
//!                                     │
//!                        SQLite txn ─►┴─► swap snapshot
//! ```

pub mod sqlite;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::chunk::{chunk_segments, ChunkingParams, DocumentRef};
use crate::embedding::{embed_batched, Embedder};
use crate::error::{EngineError, Result};
use crate::extract::{detect_content_type, extract_segments};
use crate::models::{Document, Passage};

use self::sqlite::SqliteBackend;

/// A raw file handed to [`DocumentStore::ingest`].
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    /// Content type declared by the client, if any.
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            content_type: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Immutable view of one subject's documents and passages.
///
/// `version` changes whenever the subject's passage set changes, so it is a
/// safe cache key for derived indexes.
#[derive(Debug, Clone)]
pub struct SubjectSnapshot {
    pub subject_id: String,
    pub version: u64,
    /// Live documents in ingestion order.
    pub documents: Vec<Document>,
    /// Passages grouped by document in ingestion order, then by `seq`.
    pub passages: Vec<Arc<Passage>>,
    pub vectors: HashMap<String, Arc<Vec<f32>>>,
}

impl SubjectSnapshot {
    fn new(subject_id: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            version: 0,
            documents: Vec::new(),
            passages: Vec::new(),
            vectors: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn vector(&self, passage_id: &str) -> Option<&[f32]> {
        self.vectors.get(passage_id).map(|v| v.as_slice())
    }
}

/// Counts reported by `notes subjects` and `GET /subjects`.
#[derive(Debug, Clone, Serialize)]
pub struct SubjectStats {
    pub subject_id: String,
    pub documents: usize,
    pub passages: usize,
    pub embedded_passages: usize,
    pub last_ingested_at: Option<i64>,
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    subjects: HashMap<String, Arc<SubjectSnapshot>>,
    /// document id → subject id
    owners: HashMap<String, String>,
    version: u64,
}

pub struct DocumentStore {
    state: RwLock<Arc<StoreState>>,
    write_lock: tokio::sync::Mutex<()>,
    chunking: ChunkingParams,
    embedder: Option<Arc<dyn Embedder>>,
    embed_batch_size: usize,
    backend: Option<SqliteBackend>,
}

impl DocumentStore {
    /// A store with no durable backend.
    pub fn in_memory(chunking: ChunkingParams) -> Self {
        Self {
            state: RwLock::new(Arc::new(StoreState::default())),
            write_lock: tokio::sync::Mutex::new(()),
            chunking,
            embedder: None,
            embed_batch_size: 64,
            backend: None,
        }
    }

    /// Open the SQLite database at `path` and load every live document.
    pub async fn open(path: &Path, chunking: ChunkingParams) -> anyhow::Result<Self> {
        let backend = SqliteBackend::open(path).await?;
        let loaded = backend.load().await?;

        let mut state = StoreState::default();
        let mut building: HashMap<String, SubjectSnapshot> = HashMap::new();

        for doc in loaded.documents {
            state.owners.insert(doc.id.clone(), doc.subject_id.clone());
            building
                .entry(doc.subject_id.clone())
                .or_insert_with(|| SubjectSnapshot::new(&doc.subject_id))
                .documents
                .push(doc);
        }
        for passage in loaded.passages {
            if let Some(snapshot) = building.get_mut(&passage.subject_id) {
                snapshot.passages.push(Arc::new(passage));
            }
        }
        for (passage_id, vector) in loaded.vectors {
            let subject = passage_id
                .rsplit_once(':')
                .and_then(|(doc_id, _)| state.owners.get(doc_id));
            if let Some(snapshot) = subject.and_then(|s| building.get_mut(s)) {
                snapshot.vectors.insert(passage_id, Arc::new(vector));
            }
        }

        for (subject_id, mut snapshot) in building {
            state.version += 1;
            snapshot.version = state.version;
            state.subjects.insert(subject_id, Arc::new(snapshot));
        }

        info!(
            path = %path.display(),
            documents = state.owners.len(),
            subjects = state.subjects.len(),
            "loaded document store"
        );

        Ok(Self {
            backend: Some(backend),
            state: RwLock::new(Arc::new(state)),
            ..Self::in_memory(chunking)
        })
    }

    /// Compute passage vectors at ingest with `embedder`.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        self.embedder = Some(embedder);
        self.embed_batch_size = batch_size;
        self
    }

    fn current(&self) -> Arc<StoreState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, next: StoreState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }

    /// Decode, chunk and publish one upload under `subject_id`.
    ///
    /// Fails with [`EngineError::UnsupportedFormat`] when the bytes cannot
    /// be decoded and [`EngineError::EmptyDocument`] when nothing is left
    /// after cleaning. A failed ingest leaves the store unchanged. Decoding
    /// and chunking run on the blocking pool.
    pub async fn ingest(&self, subject_id: &str, upload: Upload) -> Result<Document> {
        let chunking = self.chunking;
        let owner = subject_id.to_string();
        let (document, passages) =
            tokio::task::spawn_blocking(move || decode_upload(&owner, upload, chunking))
                .await
                .map_err(|e| EngineError::Storage(format!("ingest worker failed: {}", e)))??;

        let vectors = self.embed_passages(&passages).await;

        let _guard = self.write_lock.lock().await;

        if let Some(backend) = &self.backend {
            let model = self.embedder.as_ref().map(|e| e.model_name()).unwrap_or("");
            backend
                .insert_document(&document, &passages, &vectors, model)
                .await?;
        }

        let mut next = (*self.current()).clone();
        next.version += 1;
        let mut snapshot = next
            .subjects
            .get(subject_id)
            .map(|s| (**s).clone())
            .unwrap_or_else(|| SubjectSnapshot::new(subject_id));
        snapshot.version = next.version;
        snapshot.documents.push(document.clone());
        snapshot
            .passages
            .extend(passages.into_iter().map(Arc::new));
        snapshot
            .vectors
            .extend(vectors.into_iter().map(|(id, v)| (id, Arc::new(v))));
        next.owners
            .insert(document.id.clone(), subject_id.to_string());
        next.subjects
            .insert(subject_id.to_string(), Arc::new(snapshot));
        self.publish(next);

        info!(
            subject = subject_id,
            document = %document.id,
            filename = %document.filename,
            passages = document.passage_count,
            "ingested document"
        );
        Ok(document)
    }

    /// Best-effort passage embedding. Failures leave the passages lexical-only.
    async fn embed_passages(&self, passages: &[Passage]) -> Vec<(String, Vec<f32>)> {
        let Some(embedder) = &self.embedder else {
            return Vec::new();
        };
        let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
        match embed_batched(embedder.as_ref(), &texts, self.embed_batch_size).await {
            Ok(vectors) => passages.iter().map(|p| p.id.clone()).zip(vectors).collect(),
            Err(e) => {
                warn!(error = %e, model = embedder.model_name(), "embedding failed; passages stay lexical-only");
                Vec::new()
            }
        }
    }

    /// Remove a document and its passages. The next snapshot read no longer
    /// contains any of them.
    pub async fn remove(&self, document_id: &str) -> Result<Document> {
        let _guard = self.write_lock.lock().await;

        let current = self.current();
        let not_found = || EngineError::DocumentNotFound(document_id.to_string());
        let subject_id = current.owners.get(document_id).ok_or_else(not_found)?;
        let snapshot = current.subjects.get(subject_id).ok_or_else(not_found)?;
        let document = snapshot
            .documents
            .iter()
            .find(|d| d.id == document_id)
            .cloned()
            .ok_or_else(not_found)?;

        if let Some(backend) = &self.backend {
            backend
                .remove_document(document_id, chrono::Utc::now().timestamp())
                .await?;
        }

        let mut next = (*current).clone();
        next.version += 1;
        next.owners.remove(document_id);

        let mut updated = (**snapshot).clone();
        updated.documents.retain(|d| d.id != document_id);
        updated.passages.retain(|p| p.document_id != document_id);
        let prefix = format!("{}:", document_id);
        updated.vectors.retain(|id, _| !id.starts_with(&prefix));

        if updated.documents.is_empty() {
            next.subjects.remove(subject_id);
        } else {
            updated.version = next.version;
            next.subjects.insert(subject_id.clone(), Arc::new(updated));
        }
        self.publish(next);

        info!(document = document_id, subject = %document.subject_id, "removed document");
        Ok(document)
    }

    /// The current passage set of a subject, if it has any.
    pub fn snapshot(&self, subject_id: &str) -> Option<Arc<SubjectSnapshot>> {
        self.current().subjects.get(subject_id).cloned()
    }

    pub fn passages_for(&self, subject_id: &str) -> Vec<Passage> {
        self.snapshot(subject_id)
            .map(|s| s.passages.iter().map(|p| (**p).clone()).collect())
            .unwrap_or_default()
    }

    pub fn documents(&self, subject_id: &str) -> Vec<Document> {
        self.snapshot(subject_id)
            .map(|s| s.documents.clone())
            .unwrap_or_default()
    }

    pub fn document(&self, document_id: &str) -> Option<Document> {
        let current = self.current();
        let subject_id = current.owners.get(document_id)?;
        current
            .subjects
            .get(subject_id)?
            .documents
            .iter()
            .find(|d| d.id == document_id)
            .cloned()
    }

    /// Per-subject counts, sorted by subject id.
    pub fn subject_stats(&self) -> Vec<SubjectStats> {
        let current = self.current();
        let mut stats: Vec<SubjectStats> = current
            .subjects
            .values()
            .map(|s| SubjectStats {
                subject_id: s.subject_id.clone(),
                documents: s.documents.len(),
                passages: s.passages.len(),
                embedded_passages: s.vectors.len(),
                last_ingested_at: s.documents.iter().map(|d| d.ingested_at).max(),
            })
            .collect();
        stats.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));
        stats
    }

    pub async fn close(&self) {
        if let Some(backend) = &self.backend {
            backend.close().await;
        }
    }
}

/// Detect, extract and chunk one upload. CPU-bound; runs off the runtime.
fn decode_upload(
    subject_id: &str,
    upload: Upload,
    chunking: ChunkingParams,
) -> Result<(Document, Vec<Passage>)> {
    let content_type = detect_content_type(&upload.filename, upload.content_type.as_deref());
    let segments = extract_segments(&upload.bytes, &content_type)
        .map_err(|e| EngineError::UnsupportedFormat(format!("{}: {}", upload.filename, e)))?;

    let document_id = uuid::Uuid::new_v4().to_string();
    let passages = chunk_segments(
        DocumentRef {
            document_id: &document_id,
            subject_id,
            filename: &upload.filename,
        },
        &segments,
        chunking,
    );
    if passages.is_empty() {
        return Err(EngineError::EmptyDocument(upload.filename));
    }

    let document = Document {
        id: document_id,
        subject_id: subject_id.to_string(),
        filename: upload.filename,
        content_type,
        ingested_at: chrono::Utc::now().timestamp(),
        content_hash: format!("{:x}", Sha256::digest(&upload.bytes)),
        size_bytes: upload.bytes.len() as u64,
        passage_count: passages.len(),
    };
    Ok((document, passages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn store() -> DocumentStore {
        DocumentStore::in_memory(ChunkingParams::default())
    }

    fn text(name: &str, body: &str) -> Upload {
        Upload::new(name, body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn ingest_publishes_passages() {
        let store = store();
        let doc = store
            .ingest("bio", text("cells.txt", "Cells divide by mitosis. Plants photosynthesize."))
            .await
            .unwrap();
        assert_eq!(doc.subject_id, "bio");
        assert_eq!(doc.content_type, "text/plain");
        assert_eq!(doc.passage_count, 1);

        let passages = store.passages_for("bio");
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].id, format!("{}:0", doc.id));
        assert_eq!(passages[0].filename, "cells.txt");
        assert_eq!(store.document(&doc.id), Some(doc));
    }

    #[tokio::test]
    async fn binary_garbage_is_rejected_without_side_effects() {
        let store = store();
        store.ingest("bio", text("a.txt", "Some notes.")).await.unwrap();

        let garbage = Upload::new("blob.bin", vec![0u8, 159, 146, 150, 0, 1, 2]);
        let err = store.ingest("bio", garbage).await.unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedFormat(_)));

        let err = store.ingest("bio", text("blank.txt", " \n\t ")).await.unwrap_err();
        assert!(matches!(err, EngineError::EmptyDocument(_)));

        assert_eq!(store.documents("bio").len(), 1);
        assert_eq!(store.passages_for("bio").len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn decoding_does_not_stall_other_tasks() {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

        let store = Arc::new(store());
        let done = Arc::new(AtomicBool::new(false));
        let reads = Arc::new(AtomicUsize::new(0));
        let reader = {
            let (store, done, reads) = (store.clone(), done.clone(), reads.clone());
            tokio::spawn(async move {
                while !done.load(Ordering::SeqCst) {
                    let _ = store.snapshot("bio");
                    reads.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                }
            })
        };

        let body = "Mitochondria release energy from glucose in every cell. ".repeat(20_000);
        let doc = store.ingest("bio", text("big.txt", &body)).await.unwrap();
        let reads_during_ingest = reads.load(Ordering::SeqCst);
        done.store(true, Ordering::SeqCst);
        reader.await.unwrap();

        assert!(doc.passage_count > 1);
        assert!(reads_during_ingest > 0);
    }

    #[test]
    fn decode_upload_builds_document_and_passages() {
        let (doc, passages) = decode_upload(
            "bio",
            text("cells.md", "# Cells\n\nCells divide by mitosis."),
            ChunkingParams::default(),
        )
        .unwrap();
        assert_eq!(doc.filename, "cells.md");
        assert_eq!(doc.passage_count, passages.len());
        assert!(passages.iter().all(|p| p.document_id == doc.id));
    }

    #[tokio::test]
    async fn subjects_are_isolated() {
        let store = store();
        store.ingest("bio", text("a.txt", "Mitosis.")).await.unwrap();
        store.ingest("web", text("b.txt", "Flexbox.")).await.unwrap();
        assert!(store.passages_for("bio").iter().all(|p| p.subject_id == "bio"));
        assert!(store.passages_for("web").iter().all(|p| p.subject_id == "web"));
        assert!(store.snapshot("chem").is_none());
    }

    #[tokio::test]
    async fn remove_is_visible_and_old_snapshots_stay_intact() {
        let store = store();
        let a = store.ingest("bio", text("a.txt", "Alpha.")).await.unwrap();
        let b = store.ingest("bio", text("b.txt", "Beta.")).await.unwrap();

        let before = store.snapshot("bio").unwrap();
        store.remove(&a.id).await.unwrap();
        let after = store.snapshot("bio").unwrap();

        assert_eq!(before.passages.len(), 2);
        assert_eq!(after.passages.len(), 1);
        assert_eq!(after.passages[0].document_id, b.id);
        assert_ne!(before.version, after.version);
        assert!(store.document(&a.id).is_none());

        store.remove(&b.id).await.unwrap();
        assert!(store.snapshot("bio").is_none());
    }

    #[tokio::test]
    async fn remove_unknown_document() {
        let err = store().remove("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::DocumentNotFound(_)));
    }

    #[tokio::test]
    async fn stats_are_sorted_by_subject() {
        let store = store();
        store.ingest("web", text("b.txt", "Grid.")).await.unwrap();
        store.ingest("bio", text("a.txt", "Cells.")).await.unwrap();
        let stats = store.subject_stats();
        let ids: Vec<&str> = stats.iter().map(|s| s.subject_id.as_str()).collect();
        assert_eq!(ids, vec!["bio", "web"]);
        assert_eq!(stats[0].documents, 1);
        assert_eq!(stats[0].embedded_passages, 0);
    }

    struct Broken;

    #[async_trait]
    impl Embedder for Broken {
        fn model_name(&self) -> &str {
            "broken"
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            anyhow::bail!("backend down")
        }
    }

    struct Ones;

    #[async_trait]
    impl Embedder for Ones {
        fn model_name(&self) -> &str {
            "ones"
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 1.0, 1.0]).collect())
        }
    }

    #[tokio::test]
    async fn embedding_failure_is_not_fatal() {
        let store = store().with_embedder(Arc::new(Broken), 8);
        store.ingest("bio", text("a.txt", "Cells.")).await.unwrap();
        let snapshot = store.snapshot("bio").unwrap();
        assert_eq!(snapshot.passages.len(), 1);
        assert!(snapshot.vectors.is_empty());
    }

    #[tokio::test]
    async fn vectors_are_attached_at_ingest() {
        let store = store().with_embedder(Arc::new(Ones), 8);
        let doc = store.ingest("bio", text("a.txt", "Cells.")).await.unwrap();
        let snapshot = store.snapshot("bio").unwrap();
        assert_eq!(snapshot.vector(&format!("{}:0", doc.id)), Some(&[1.0f32, 1.0, 1.0][..]));
    }

    #[tokio::test]
    async fn sqlite_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.sqlite");

        let (kept, removed) = {
            let store = DocumentStore::open(&path, ChunkingParams::default())
                .await
                .unwrap()
                .with_embedder(Arc::new(Ones), 8);
            let kept = store
                .ingest("bio", text("notes.md", "# Cells\nCells divide.\n# Energy\nATP."))
                .await
                .unwrap();
            let removed = store.ingest("bio", text("old.txt", "Outdated.")).await.unwrap();
            store.remove(&removed.id).await.unwrap();
            store.close().await;
            (kept, removed)
        };

        let store = DocumentStore::open(&path, ChunkingParams::default())
            .await
            .unwrap();
        assert_eq!(store.documents("bio"), vec![kept.clone()]);
        assert!(store.document(&removed.id).is_none());

        let snapshot = store.snapshot("bio").unwrap();
        assert_eq!(snapshot.passages.len(), kept.passage_count);
        assert_eq!(snapshot.vectors.len(), kept.passage_count);
        assert_eq!(snapshot.passages[0].section_label(), "Cells");
    }
}
