//! Extractive answers: quote the best-matching sentences verbatim.
//!
//! Every claim is a sentence copied from a retrieved passage, so every
//! claim is supported by construction. A sentence is supported by each
//! retrieved passage that contains it, which lets overlapping windows
//! corroborate one another.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{AnswerStyle, ScoredPassage};
use crate::text::{split_sentences, tokenize, unique_terms};

use super::{Claim, GroundingTrace, Synthesis, SynthesisRequest, Synthesizer};

pub struct ExtractiveSynthesizer {
    max_sentences: usize,
    context_passages: usize,
}

struct Candidate<'a> {
    text: &'a str,
    overlap: usize,
    rank: usize,
    position: usize,
}

impl ExtractiveSynthesizer {
    pub fn new(max_sentences: usize, context_passages: usize) -> Self {
        Self {
            max_sentences: max_sentences.max(1),
            context_passages: context_passages.max(1),
        }
    }

    /// Pick sentences and build claims. Deterministic for a given input.
    pub fn compose(&self, question: &str, items: &[ScoredPassage]) -> Vec<Claim> {
        let question_terms = unique_terms(question);
        let context = &items[..items.len().min(self.context_passages)];

        let mut candidates: Vec<Candidate<'_>> = Vec::new();
        for (rank, item) in context.iter().enumerate() {
            for (position, sentence) in split_sentences(&item.passage.text).into_iter().enumerate() {
                let terms = unique_terms(sentence);
                let overlap = question_terms.iter().filter(|t| terms.contains(t)).count();
                if overlap > 0 {
                    candidates.push(Candidate {
                        text: sentence,
                        overlap,
                        rank,
                        position,
                    });
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.overlap
                .cmp(&a.overlap)
                .then(a.rank.cmp(&b.rank))
                .then(a.position.cmp(&b.position))
        });

        let mut chosen: Vec<&Candidate<'_>> = Vec::new();
        for candidate in &candidates {
            if chosen.len() == self.max_sentences {
                break;
            }
            if !chosen.iter().any(|c| c.text == candidate.text) {
                chosen.push(candidate);
            }
        }
        // Read in document order rather than score order.
        chosen.sort_by(|a, b| a.rank.cmp(&b.rank).then(a.position.cmp(&b.position)));

        let mut sentences: Vec<&str> = chosen.iter().map(|c| c.text).collect();
        if sentences.is_empty() {
            if let Some(first) = context
                .first()
                .and_then(|item| split_sentences(&item.passage.text).into_iter().next())
            {
                sentences.push(first);
            }
        }

        sentences
            .into_iter()
            .map(|sentence| {
                let support = items
                    .iter()
                    .filter(|item| item.passage.text.contains(sentence))
                    .map(|item| item.passage.id.clone())
                    .collect();
                Claim::supported(sentence, support)
            })
            .collect()
    }
}

/// A content question about the most prominent term of the answer that
/// the student did not already ask about.
pub(crate) fn follow_up_question(question: &str, answer: &str) -> String {
    let asked = unique_terms(question);
    let mut counts: Vec<(String, usize)> = Vec::new();
    for term in tokenize(answer) {
        if asked.contains(&term) || term.chars().all(|c| c.is_numeric()) {
            continue;
        }
        match counts.iter_mut().find(|(t, _)| *t == term) {
            Some((_, n)) => *n += 1,
            None => counts.push((term, 1)),
        }
    }
    // Highest count wins, then the longer term, then first appearance.
    let mut best: Option<&(String, usize)> = None;
    for entry in &counts {
        if best.map_or(true, |b| (entry.1, entry.0.len()) > (b.1, b.0.len())) {
            best = Some(entry);
        }
    }

    match (best, asked.first()) {
        (Some((term, _)), Some(topic)) => {
            format!("How would you explain the link between {} and {} in your own words?", topic, term)
        }
        (Some((term, _)), None) => format!("How would you explain {} in your own words?", term),
        (None, Some(topic)) => format!("Can you give an example of {} from your notes?", topic),
        (None, None) => "Which part of this would you like to explore next?".to_string(),
    }
}

#[async_trait]
impl Synthesizer for ExtractiveSynthesizer {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn synthesize(&self, request: &SynthesisRequest<'_>) -> Result<Synthesis> {
        let claims = self.compose(request.question, &request.retrieval.items);
        let mut answer = claims
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        if request.style == AnswerStyle::Teacher {
            let follow_up = follow_up_question(request.question, &answer);
            answer = format!("Here's what your notes say: {} {}", answer, follow_up);
        }

        Ok(Synthesis {
            answer,
            trace: GroundingTrace::new(claims),
        })
    }
}
