//! Subject-scoped passage retrieval.
//!
//! A [`Retriever`] reads the current [`SubjectSnapshot`] of a subject,
//! scores every passage with a pluggable [`Scorer`], drops passages at or
//! below the relevance floor and returns the top `k`.
//!
//! Ordering is by descending score; ties go to the lower `seq`, then to
//! the earlier-ingested document. Every scorer produces values in
//! `[0, 1]`, so the floor and the confidence thresholds mean the same
//! thing whichever scorer is configured.
//!
//! | Scorer     | Score                                       |
//! |------------|---------------------------------------------|
//! | `lexical`  | bounded BM25 term coverage ([`lexical`])    |
//! | `semantic` | cosine similarity, clamped to `[0, 1]`      |
//! | `hybrid`   | `(1-α)·lexical + α·semantic`                |

pub mod lexical;

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::{cosine_similarity, embed_query, Embedder};
use crate::error::{EngineError, Result};
use crate::models::{RetrievalResult, ScoredPassage};
use crate::store::{DocumentStore, SubjectSnapshot};

pub use self::lexical::{LexicalIndex, LexicalScorer};

/// Scores every passage of a snapshot against a question.
///
/// Implementations return one score in `[0, 1]` per passage, in snapshot
/// order.
#[async_trait]
pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;
    async fn score(&self, snapshot: &SubjectSnapshot, question: &str) -> anyhow::Result<Vec<f64>>;
}

/// Cosine similarity between the question and each passage vector.
/// Passages without a vector score zero.
pub struct SemanticScorer {
    embedder: Arc<dyn Embedder>,
}

impl SemanticScorer {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl Scorer for SemanticScorer {
    fn name(&self) -> &str {
        "semantic"
    }

    async fn score(&self, snapshot: &SubjectSnapshot, question: &str) -> anyhow::Result<Vec<f64>> {
        if snapshot.vectors.is_empty() {
            bail!("subject {} has no passage vectors", snapshot.subject_id);
        }
        let query = embed_query(self.embedder.as_ref(), question).await?;
        Ok(snapshot
            .passages
            .iter()
            .map(|p| match snapshot.vector(&p.id) {
                Some(v) => (cosine_similarity(&query, v) as f64).clamp(0.0, 1.0),
                None => 0.0,
            })
            .collect())
    }
}

/// Weighted blend of lexical and semantic scores.
pub struct HybridScorer {
    lexical: Arc<LexicalScorer>,
    semantic: SemanticScorer,
    alpha: f64,
}

impl HybridScorer {
    pub fn new(lexical: Arc<LexicalScorer>, semantic: SemanticScorer, alpha: f64) -> Self {
        Self {
            lexical,
            semantic,
            alpha,
        }
    }
}

#[async_trait]
impl Scorer for HybridScorer {
    fn name(&self) -> &str {
        "hybrid"
    }

    async fn score(&self, snapshot: &SubjectSnapshot, question: &str) -> anyhow::Result<Vec<f64>> {
        let lexical = self.lexical.score(snapshot, question).await?;
        let semantic = self.semantic.score(snapshot, question).await?;
        Ok(lexical
            .iter()
            .zip(&semantic)
            .map(|(l, s)| (1.0 - self.alpha) * l + self.alpha * s)
            .collect())
    }
}

pub struct Retriever {
    store: Arc<DocumentStore>,
    scorer: Arc<dyn Scorer>,
    /// Used directly for `lexical`, and as the fallback when another
    /// scorer fails.
    lexical: Arc<LexicalScorer>,
    min_relevance: f64,
}

impl Retriever {
    /// A retriever using only lexical scoring.
    pub fn lexical(store: Arc<DocumentStore>, min_relevance: f64) -> Self {
        let lexical = Arc::new(LexicalScorer::new());
        Self {
            store,
            scorer: lexical.clone(),
            lexical,
            min_relevance,
        }
    }

    pub fn from_config(
        store: Arc<DocumentStore>,
        config: &RetrievalConfig,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> anyhow::Result<Self> {
        let mut retriever = Self::lexical(store, config.min_relevance);
        retriever.scorer = match (config.scorer.as_str(), embedder) {
            ("lexical", _) => retriever.lexical.clone(),
            ("semantic", Some(e)) => Arc::new(SemanticScorer::new(e)),
            ("hybrid", Some(e)) => Arc::new(HybridScorer::new(
                retriever.lexical.clone(),
                SemanticScorer::new(e),
                config.hybrid_alpha,
            )),
            (other, None) if other == "semantic" || other == "hybrid" => {
                bail!("retrieval.scorer = '{}' requires an embedding provider", other)
            }
            (other, _) => bail!("Unknown retrieval scorer: '{}'", other),
        };
        Ok(retriever)
    }

    pub fn scorer_name(&self) -> &str {
        self.scorer.name()
    }

    /// Top-`k` passages of `subject_id` for `question`.
    ///
    /// Fails with [`EngineError::UnknownSubject`] when the subject has no
    /// passages. An empty result means nothing cleared the relevance floor.
    pub async fn retrieve(
        &self,
        subject_id: &str,
        question: &str,
        k: usize,
    ) -> Result<RetrievalResult> {
        let snapshot = self
            .store
            .snapshot(subject_id)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::UnknownSubject(subject_id.to_string()))?;

        let scores = match self.scorer.score(&snapshot, question).await {
            Ok(scores) => scores,
            Err(e) => {
                warn!(
                    scorer = self.scorer.name(),
                    error = %e,
                    "scorer failed; falling back to lexical"
                );
                self.lexical
                    .score(&snapshot, question)
                    .await
                    .map_err(|e| EngineError::Storage(e.to_string()))?
            }
        };

        let items = rank(&snapshot, &scores, self.min_relevance, k);
        debug!(
            subject = subject_id,
            scorer = self.scorer.name(),
            candidates = snapshot.passages.len(),
            returned = items.len(),
            "retrieved passages"
        );

        Ok(RetrievalResult {
            subject_id: subject_id.to_string(),
            items,
        })
    }
}

/// Filter by `min_relevance`, order, and truncate to `k`.
///
/// Snapshot order is document ingestion order, so the position index
/// breaks ties that `seq` leaves open.
fn rank(snapshot: &SubjectSnapshot, scores: &[f64], min_relevance: f64, k: usize) -> Vec<ScoredPassage> {
    let mut candidates: Vec<(usize, f64)> = scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, score)| *score > min_relevance)
        .collect();

    candidates.sort_by(|(ia, sa), (ib, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| snapshot.passages[*ia].seq.cmp(&snapshot.passages[*ib].seq))
            .then_with(|| ia.cmp(ib))
    });
    candidates.truncate(k);

    candidates
        .into_iter()
        .map(|(i, score)| ScoredPassage {
            passage: snapshot.passages[i].clone(),
            score,
        })
        .collect()
}
