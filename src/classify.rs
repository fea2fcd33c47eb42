//! Confidence labels, citations and evidence from a grounding trace.
//!
//! The rule is deterministic:
//!
//! | Label    | Condition                                                        |
//! |----------|------------------------------------------------------------------|
//! | `Low`    | no claims, or any claim has no supporting retrieved passage      |
//! | `High`   | every claim has a supporting passage scoring above the strong     |
//! |          | threshold, and those passages come from at least two documents   |
//! | `Medium` | otherwise                                                        |
//!
//! Support ids that are not in the retrieval result are ignored, so an
//! answer can never cite a passage it was not given. Overlapping windows of
//! one document repeat the same text, so independence is counted per
//! document rather than per passage.

use crate::models::{Citation, Confidence, Evidence, Passage, RetrievalResult};
use crate::synthesize::GroundingTrace;
use crate::text::truncate_chars;

#[derive(Debug, Clone, Copy)]
pub struct ConfidencePolicy {
    /// A supporting passage is strong when its score exceeds this.
    pub strong_threshold: f64,
    /// Maximum characters of passage text in an evidence snippet.
    pub snippet_chars: usize,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            strong_threshold: 0.4,
            snippet_chars: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub confidence: Confidence,
    pub citations: Vec<Citation>,
    pub evidence: Vec<Evidence>,
}

pub fn citation_for(passage: &Passage) -> Citation {
    Citation {
        passage_id: passage.id.clone(),
        document_id: passage.document_id.clone(),
        file: passage.filename.clone(),
        section: passage.section_label(),
    }
}

pub fn classify(
    trace: &GroundingTrace,
    retrieval: &RetrievalResult,
    policy: &ConfidencePolicy,
) -> Classification {
    let mut cited: Vec<&str> = Vec::new();
    let mut strong: Vec<&str> = Vec::new();
    let mut any_unsupported = trace.claims.is_empty();
    let mut all_strong = !trace.claims.is_empty();

    for claim in &trace.claims {
        let mut supported = false;
        let mut claim_strong = false;
        for id in &claim.support {
            let Some(item) = retrieval.get(id) else {
                continue;
            };
            supported = true;
            let id = item.passage.id.as_str();
            if !cited.contains(&id) {
                cited.push(id);
            }
            if item.score > policy.strong_threshold {
                claim_strong = true;
                let document = item.passage.document_id.as_str();
                if !strong.contains(&document) {
                    strong.push(document);
                }
            }
        }
        any_unsupported |= !supported;
        all_strong &= claim_strong;
    }

    let confidence = if any_unsupported {
        Confidence::Low
    } else if all_strong && strong.len() >= 2 {
        Confidence::High
    } else {
        Confidence::Medium
    };

    let mut citations = Vec::with_capacity(cited.len());
    let mut evidence = Vec::with_capacity(cited.len());
    for id in cited {
        if let Some(item) = retrieval.get(id) {
            let citation = citation_for(&item.passage);
            evidence.push(Evidence {
                snippet: truncate_chars(&item.passage.text, policy.snippet_chars),
                citation: citation.clone(),
            });
            citations.push(citation);
        }
    }

    Classification {
        confidence,
        citations,
        evidence,
    }
}
