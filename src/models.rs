//! Core data models used throughout the answer engine.
//!
//! These types represent the subjects, documents, passages and answers that
//! flow through the ingestion and question-answering pipeline.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Delimiter between file name and section in the wire form of a citation.
pub const CITATION_DELIMITER: &str = " | ";

/// An isolation boundary for documents and queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Opaque identifier used on the wire (e.g. `subject1`).
    pub id: String,
    /// Human-readable display name (e.g. `Biology`).
    pub name: String,
}

/// One uploaded source file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub subject_id: String,
    pub filename: String,
    pub content_type: String,
    /// Unix timestamp (seconds) of ingestion.
    pub ingested_at: i64,
    /// SHA-256 of the raw upload bytes.
    pub content_hash: String,
    pub size_bytes: u64,
    pub passage_count: usize,
}

/// Where inside a document a passage came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Locator {
    Page(u32),
    Slide(u32),
    Section(String),
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Page(n) => write!(f, "page {}", n),
            Locator::Slide(n) => write!(f, "slide {}", n),
            Locator::Section(heading) => f.write_str(heading),
        }
    }
}

/// A chunk of a document; the atomic unit of retrieval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    /// `"<document_id>:<seq>"`.
    pub id: String,
    pub document_id: String,
    pub subject_id: String,
    /// Owning document's file name, copied so citations stay self-contained.
    pub filename: String,
    /// Contiguous 0-based index within the document.
    pub seq: i64,
    pub text: String,
    pub locator: Option<Locator>,
    /// SHA-256 of `text`.
    pub hash: String,
}

impl Passage {
    /// Builds the passage id for a document/sequence pair.
    pub fn make_id(document_id: &str, seq: i64) -> String {
        format!("{}:{}", document_id, seq)
    }

    /// Human-readable location inside the owning document.
    pub fn section_label(&self) -> String {
        match &self.locator {
            Some(locator) => locator.to_string(),
            None => format!("passage {}", self.seq + 1),
        }
    }
}

/// One prior conversation turn supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

/// How the answer should be phrased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnswerStyle {
    /// Plain grounded answer (`/ask`).
    #[default]
    Concise,
    /// Conversational reply that ends with a follow-up question (`/teacher_ask`).
    Teacher,
}

/// A single question directed at a subject.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub subject_id: String,
    pub question: String,
    pub history: Vec<HistoryTurn>,
    pub style: AnswerStyle,
}

impl Query {
    pub fn new(subject_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            question: question.into(),
            ..Self::default()
        }
    }

    pub fn with_history(mut self, history: Vec<HistoryTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_style(mut self, style: AnswerStyle) -> Self {
        self.style = style;
        self
    }
}

/// A passage paired with its relevance score for one query.
#[derive(Debug, Clone)]
pub struct ScoredPassage {
    pub passage: Arc<Passage>,
    pub score: f64,
}

/// Ordered top-k passages for one query.
///
/// Sorted by descending score. Scores are only comparable within one result.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub subject_id: String,
    pub items: Vec<ScoredPassage>,
}

impl RetrievalResult {
    pub fn empty(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            items: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Looks up a retrieved passage by id.
    pub fn get(&self, passage_id: &str) -> Option<&ScoredPassage> {
        self.items.iter().find(|sp| sp.passage.id == passage_id)
    }

    pub fn contains(&self, passage_id: &str) -> bool {
        self.get(passage_id).is_some()
    }
}

/// Discrete summary of grounding strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Confidence::High => "High",
            Confidence::Medium => "Medium",
            Confidence::Low => "Low",
        };
        f.write_str(label)
    }
}

/// Structured pointer from an answer back to its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Citation {
    pub passage_id: String,
    pub document_id: String,
    pub file: String,
    pub section: String,
}

impl Citation {
    /// Wire form: `"<file> | <section>"`.
    pub fn label(&self) -> String {
        format!("{}{}{}", self.file, CITATION_DELIMITER, self.section)
    }
}

/// Literal excerpt of a cited passage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evidence {
    pub snippet: String,
    pub citation: Citation,
}

/// The engine's output for one query.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerRecord {
    pub answer: String,
    pub confidence: Confidence,
    pub citations: Vec<Citation>,
    pub evidence: Vec<Evidence>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(locator: Option<Locator>, seq: i64) -> Passage {
        Passage {
            id: Passage::make_id("doc", seq),
            document_id: "doc".into(),
            subject_id: "s".into(),
            filename: "notes.pdf".into(),
            seq,
            text: String::new(),
            locator,
            hash: String::new(),
        }
    }

    #[test]
    fn section_label_uses_locator() {
        assert_eq!(passage(Some(Locator::Page(3)), 0).section_label(), "page 3");
        assert_eq!(passage(Some(Locator::Slide(2)), 0).section_label(), "slide 2");
        assert_eq!(
            passage(Some(Locator::Section("Cells".into())), 0).section_label(),
            "Cells"
        );
        assert_eq!(passage(None, 4).section_label(), "passage 5");
    }

    #[test]
    fn citation_label_joins_file_and_section() {
        let c = Citation {
            passage_id: "d:0".into(),
            document_id: "d".into(),
            file: "bio.pdf".into(),
            section: "page 1".into(),
        };
        assert_eq!(c.label(), "bio.pdf | page 1");
    }

    #[test]
    fn confidence_orders_low_to_high() {
        assert!(Confidence::Low < Confidence::Medium);
        assert!(Confidence::Medium < Confidence::High);
        assert_eq!(Confidence::Medium.to_string(), "Medium");
    }
}
