//! The grounded answer engine.
//!
//! [`AnswerEngine`] wires the document store, retriever, synthesizer and
//! confidence mapper together from a [`Config`]. The HTTP server and the
//! CLI are thin layers over it.
//!
//! ```text
//! Query ─► subject check ─► Retriever ─► Synthesizer (timeout) ─► classify ─► AnswerRecord
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::chunk::ChunkingParams;
use crate::classify::{classify, ConfidencePolicy};
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::error::{EngineError, Result};
use crate::models::{AnswerRecord, Document, HistoryTurn, Query, RetrievalResult, Subject};
use crate::retrieve::Retriever;
use crate::store::{DocumentStore, Upload};
use crate::synthesize::{create_synthesizer, synthesize_grounded, SynthesisRequest, Synthesizer};
use crate::text::{truncate_chars, word_count};

/// Questions shorter than this are treated as possible follow-ups.
const FOLLOW_UP_MAX_WORDS: usize = 8;
const PREVIEW_CHARS: usize = 300;

/// Result of ingesting one file of a batch.
#[derive(Debug)]
pub struct IngestOutcome {
    pub filename: String,
    pub result: Result<Document>,
    /// Leading text of the first passage, when ingestion succeeded.
    pub preview: Option<String>,
}

/// A subject and its current corpus size.
#[derive(Debug, Clone, Serialize)]
pub struct SubjectSummary {
    pub id: String,
    pub name: String,
    pub documents: usize,
    pub passages: usize,
}

pub struct AnswerEngine {
    store: Arc<DocumentStore>,
    retriever: Retriever,
    synthesizer: Arc<dyn Synthesizer>,
    policy: ConfidencePolicy,
    subjects: Vec<Subject>,
    top_k: usize,
    timeout: Duration,
}

impl AnswerEngine {
    /// Build an engine, opening the SQLite store when `[db]` is configured.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let chunking = chunking_params(config);
        let store = match &config.db {
            Some(db) => DocumentStore::open(&db.path, chunking).await?,
            None => DocumentStore::in_memory(chunking),
        };
        Self::assemble(config, store)
    }

    /// Build an engine that keeps everything in memory, ignoring `[db]`.
    pub fn in_memory(config: &Config) -> anyhow::Result<Self> {
        Self::assemble(config, DocumentStore::in_memory(chunking_params(config)))
    }

    fn assemble(config: &Config, store: DocumentStore) -> anyhow::Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let store = match &embedder {
            Some(e) => store.with_embedder(e.clone(), config.embedding.batch_size),
            None => store,
        };
        let store = Arc::new(store);
        let retriever = Retriever::from_config(store.clone(), &config.retrieval, embedder)?;
        let synthesizer = create_synthesizer(&config.answer)?;

        info!(
            scorer = retriever.scorer_name(),
            synthesizer = synthesizer.name(),
            subjects = config.subjects.len(),
            "answer engine ready"
        );

        Ok(Self {
            store,
            retriever,
            synthesizer,
            policy: ConfidencePolicy {
                strong_threshold: config.answer.strong_threshold,
                snippet_chars: config.answer.snippet_chars,
            },
            subjects: config.subjects.clone(),
            top_k: config.retrieval.top_k,
            timeout: Duration::from_secs(config.answer.timeout_secs),
        })
    }

    /// Replace the configured synthesis strategy.
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Reject empty ids, and ids outside `[[subjects]]` when any are
    /// configured.
    pub fn check_subject(&self, subject_id: &str) -> Result<()> {
        let known = self.subjects.is_empty() || self.subjects.iter().any(|s| s.id == subject_id);
        if subject_id.trim().is_empty() || !known {
            return Err(EngineError::InvalidSubject(subject_id.to_string()));
        }
        Ok(())
    }

    /// Configured subjects, or every subject with documents when none are
    /// configured.
    pub fn subjects(&self) -> Vec<SubjectSummary> {
        let stats = self.store.subject_stats();
        let counts = |id: &str| {
            stats
                .iter()
                .find(|s| s.subject_id == id)
                .map(|s| (s.documents, s.passages))
                .unwrap_or((0, 0))
        };

        if self.subjects.is_empty() {
            return stats
                .iter()
                .map(|s| SubjectSummary {
                    id: s.subject_id.clone(),
                    name: s.subject_id.clone(),
                    documents: s.documents,
                    passages: s.passages,
                })
                .collect();
        }

        self.subjects
            .iter()
            .map(|subject| {
                let (documents, passages) = counts(&subject.id);
                SubjectSummary {
                    id: subject.id.clone(),
                    name: subject.name.clone(),
                    documents,
                    passages,
                }
            })
            .collect()
    }

    pub fn documents(&self, subject_id: &str) -> Result<Vec<Document>> {
        self.check_subject(subject_id)?;
        Ok(self.store.documents(subject_id))
    }

    pub async fn ingest(&self, subject_id: &str, upload: Upload) -> Result<Document> {
        self.check_subject(subject_id)?;
        self.store.ingest(subject_id, upload).await
    }

    /// Ingest several files. Only an invalid subject fails the whole call;
    /// per-file failures are reported in the outcomes.
    pub async fn ingest_batch(
        &self,
        subject_id: &str,
        uploads: Vec<Upload>,
    ) -> Result<Vec<IngestOutcome>> {
        self.check_subject(subject_id)?;

        let mut outcomes = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let filename = upload.filename.clone();
            let result = self.store.ingest(subject_id, upload).await;
            let preview = match &result {
                Ok(doc) => self
                    .store
                    .snapshot(subject_id)
                    .and_then(|s| {
                        s.passages
                            .iter()
                            .find(|p| p.document_id == doc.id)
                            .map(|p| truncate_chars(&p.text, PREVIEW_CHARS))
                    }),
                Err(e) => {
                    tracing::warn!(subject = subject_id, filename = %filename, error = %e, "upload rejected");
                    None
                }
            };
            outcomes.push(IngestOutcome {
                filename,
                result,
                preview,
            });
        }
        Ok(outcomes)
    }

    pub async fn remove(&self, document_id: &str) -> Result<Document> {
        self.store.remove(document_id).await
    }

    /// Top-k passages for `question` without synthesizing an answer.
    pub async fn retrieve(&self, subject_id: &str, question: &str) -> Result<RetrievalResult> {
        self.check_subject(subject_id)?;
        self.retriever.retrieve(subject_id, question, self.top_k).await
    }

    /// Answer a question from the subject's notes.
    pub async fn ask(&self, query: &Query) -> Result<AnswerRecord> {
        self.check_subject(&query.subject_id)?;
        let question = query.question.trim();
        if question.is_empty() {
            return Err(EngineError::EmptyQuestion);
        }

        let search_text = expand_question(question, &query.history);
        let retrieval = self
            .retriever
            .retrieve(&query.subject_id, &search_text, self.top_k)
            .await?;

        let request = SynthesisRequest {
            question,
            retrieval: &retrieval,
            style: query.style,
            history: &query.history,
        };
        let synthesis = synthesize_grounded(self.synthesizer.as_ref(), &request, self.timeout).await?;
        let classification = classify(&synthesis.trace, &retrieval, &self.policy);

        info!(
            subject = %query.subject_id,
            retrieved = retrieval.len(),
            claims = synthesis.trace.claims.len(),
            confidence = %classification.confidence,
            citations = classification.citations.len(),
            "answered question"
        );

        Ok(AnswerRecord {
            answer: synthesis.answer,
            confidence: classification.confidence,
            citations: classification.citations,
            evidence: classification.evidence,
        })
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

fn chunking_params(config: &Config) -> ChunkingParams {
    ChunkingParams {
        max_words: config.chunking.max_words,
        overlap_words: config.chunking.overlap_words,
    }
}

/// Prefix short follow-ups ("simplify it") with the last user turn so
/// retrieval has something to match.
pub fn expand_question(question: &str, history: &[HistoryTurn]) -> String {
    if word_count(question) >= FOLLOW_UP_MAX_WORDS {
        return question.to_string();
    }
    match history
        .iter()
        .rev()
        .find(|turn| turn.role.eq_ignore_ascii_case("user") && !turn.content.trim().is_empty())
    {
        Some(turn) => format!("{} {}", turn.content.trim(), question),
        None => question.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: &str, content: &str) -> HistoryTurn {
        HistoryTurn {
            role: role.into(),
            content: content.into(),
        }
    }

    #[test]
    fn short_follow_up_uses_last_user_turn() {
        let history = vec![
            turn("user", "What is osmosis?"),
            turn("assistant", "Osmosis is diffusion of water."),
            turn("user", "What is mitosis?"),
            turn("assistant", "Cell division."),
        ];
        assert_eq!(expand_question("simplify it", &history), "What is mitosis? simplify it");
    }

    #[test]
    fn long_question_is_not_expanded() {
        let history = vec![turn("user", "What is osmosis?")];
        let q = "How does the cell membrane regulate osmosis in plant cells?";
        assert_eq!(expand_question(q, &history), q);
    }

    #[test]
    fn no_user_turn_means_no_expansion() {
        let history = vec![turn("assistant", "Hello!")];
        assert_eq!(expand_question("give an example", &history), "give an example");
    }

    #[test]
    fn configured_subjects_are_enforced() {
        let mut config = Config::default();
        config.subjects = vec![Subject {
            id: "subject1".into(),
            name: "Biology".into(),
        }];
        let engine = AnswerEngine::in_memory(&config).unwrap();
        assert!(engine.check_subject("subject1").is_ok());
        assert!(matches!(
            engine.check_subject("subject9"),
            Err(EngineError::InvalidSubject(_))
        ));

        let open = AnswerEngine::in_memory(&Config::default()).unwrap();
        assert!(open.check_subject("anything").is_ok());
        assert!(open.check_subject("  ").is_err());
    }
}
