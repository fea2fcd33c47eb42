//! Error taxonomy for the answer engine.
//!
//! Ingestion errors ([`EngineError::UnsupportedFormat`],
//! [`EngineError::EmptyDocument`]) are reported per file and never abort a
//! batch. Retrieval only fails with [`EngineError::UnknownSubject`].
//! Synthesis may time out; a timeout never carries a partial answer.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the store, retriever, synthesizer and engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The uploaded bytes could not be decoded to text.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Decoding succeeded but no text was left after cleaning.
    #[error("document contains no extractable text: {0}")]
    EmptyDocument(String),

    /// The subject has no ingested passages.
    #[error("unknown subject: {0}")]
    UnknownSubject(String),

    /// The subject id is empty or not one of the configured subjects.
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),

    /// The question was empty after trimming.
    #[error("question must not be empty")]
    EmptyQuestion,

    /// No live document has this id.
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// Answer synthesis exceeded its deadline.
    #[error("answer synthesis timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The synthesis strategy failed without a usable answer.
    #[error("answer synthesis failed: {0}")]
    Synthesis(String),

    /// The durable backend rejected a read or write.
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Machine-readable code used in the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::UnsupportedFormat(_) => "unsupported_format",
            EngineError::EmptyDocument(_) => "empty_document",
            EngineError::UnknownSubject(_) => "unknown_subject",
            EngineError::InvalidSubject(_) => "invalid_subject",
            EngineError::EmptyQuestion => "bad_request",
            EngineError::DocumentNotFound(_) => "not_found",
            EngineError::Timeout(_) => "timeout",
            EngineError::Synthesis(_) => "synthesis_failed",
            EngineError::Storage(_) => "internal",
        }
    }

    /// Whether a caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Timeout(_) | EngineError::Synthesis(_))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

/// Convenience result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
