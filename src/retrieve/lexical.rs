//! Bounded BM25 term-coverage scoring.
//!
//! Each passage gets an IDF-weighted average of per-term BM25 saturation,
//! normalized so a score is always in `[0, 1)`:
//!
//! ```text
//!           Σ_t idf(t) · sat(t, p) / (k1 + 1)
//! score =  ──────────────────────────────────
//!                     Σ_t idf(t)
//!
//! sat(t, p) = tf · (k1 + 1) / (tf + k1 · (1 - b + b · |p| / avg|p|))
//! idf(t)    = ln(1 + (N - df + 0.5) / (df + 0.5))
//! ```
//!
//! `t` ranges over the distinct content terms of the question. Unlike raw
//! BM25 the result does not grow with question length, so fixed relevance
//! thresholds stay meaningful across questions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::models::Passage;
use crate::store::SubjectSnapshot;
use crate::text::{tokenize, unique_terms};

use super::Scorer;

const K1: f64 = 1.2;
const B: f64 = 0.75;

struct PassageTerms {
    tf: HashMap<String, u32>,
    len: usize,
}

/// Term statistics for one subject snapshot.
pub struct LexicalIndex {
    passages: Vec<PassageTerms>,
    df: HashMap<String, usize>,
    avg_len: f64,
}

impl LexicalIndex {
    pub fn build(passages: &[Arc<Passage>]) -> Self {
        let mut df: HashMap<String, usize> = HashMap::new();
        let mut indexed = Vec::with_capacity(passages.len());
        let mut total_len = 0usize;

        for passage in passages {
            let tokens = tokenize(&passage.text);
            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *tf.entry(token.clone()).or_default() += 1;
            }
            for term in tf.keys() {
                *df.entry(term.clone()).or_default() += 1;
            }
            total_len += tokens.len();
            indexed.push(PassageTerms {
                tf,
                len: tokens.len(),
            });
        }

        let avg_len = if indexed.is_empty() {
            0.0
        } else {
            total_len as f64 / indexed.len() as f64
        };

        Self {
            passages: indexed,
            df,
            avg_len,
        }
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.passages.len() as f64;
        let df = self.df.get(term).copied().unwrap_or(0) as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    /// Score every passage against `question`, in snapshot order.
    pub fn scores(&self, question: &str) -> Vec<f64> {
        let terms = unique_terms(question);
        let weights: Vec<f64> = terms.iter().map(|t| self.idf(t)).collect();
        let total: f64 = weights.iter().sum();
        if terms.is_empty() || total <= 0.0 {
            return vec![0.0; self.passages.len()];
        }

        self.passages
            .iter()
            .map(|p| {
                let norm = if self.avg_len > 0.0 {
                    p.len as f64 / self.avg_len
                } else {
                    1.0
                };
                let covered: f64 = terms
                    .iter()
                    .zip(&weights)
                    .map(|(term, idf)| {
                        let tf = p.tf.get(term).copied().unwrap_or(0) as f64;
                        if tf == 0.0 {
                            return 0.0;
                        }
                        let sat = tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * norm));
                        idf * sat / (K1 + 1.0)
                    })
                    .sum();
                covered / total
            })
            .collect()
    }
}

/// Lexical scorer with one cached index per subject snapshot version.
#[derive(Default)]
pub struct LexicalScorer {
    cache: Mutex<HashMap<String, (u64, Arc<LexicalIndex>)>>,
}

impl LexicalScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The index for `snapshot`, building it on first use of a version.
    pub fn index_for(&self, snapshot: &SubjectSnapshot) -> Arc<LexicalIndex> {
        {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((version, index)) = cache.get(&snapshot.subject_id) {
                if *version == snapshot.version {
                    return index.clone();
                }
            }
        }

        let index = Arc::new(LexicalIndex::build(&snapshot.passages));
        tracing::debug!(
            subject = %snapshot.subject_id,
            version = snapshot.version,
            passages = index.len(),
            "built lexical index"
        );
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot.subject_id.clone(), (snapshot.version, index.clone()));
        index
    }
}

#[async_trait]
impl Scorer for LexicalScorer {
    fn name(&self) -> &str {
        "lexical"
    }

    async fn score(&self, snapshot: &SubjectSnapshot, question: &str) -> anyhow::Result<Vec<f64>> {
        Ok(self.index_for(snapshot).scores(question))
    }
}
