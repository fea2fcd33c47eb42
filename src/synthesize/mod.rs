//! Answer synthesis strategies.
//!
//! A [`Synthesizer`] turns a question and its retrieved passages into
//! answer text plus a [`GroundingTrace`]: the list of claims the answer
//! makes and the passage ids each one rests on. The trace is what the
//! confidence mapper classifies; a synthesizer never assigns confidence
//! itself.
//!
//! Strategies:
//! - [`ExtractiveSynthesizer`] quotes the sentences of the top passages
//!   that share the most terms with the question.
//! - [`GenerativeSynthesizer`] asks an OpenAI-compatible chat model to
//!   answer from numbered sources and parses its `[n]` tags.
//!
//! [`synthesize_grounded`] wraps every strategy: it short-circuits an
//! empty retrieval to [`INSUFFICIENT_INFORMATION`] and bounds the call
//! with a timeout.

pub mod extractive;
pub mod generative;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::AnswerConfig;
use crate::error::{EngineError, Result};
use crate::models::{AnswerStyle, HistoryTurn, RetrievalResult};

pub use self::extractive::ExtractiveSynthesizer;
pub use self::generative::GenerativeSynthesizer;

/// The fixed answer when no passage clears the relevance floor.
pub const INSUFFICIENT_INFORMATION: &str = "Not found in your notes.";

/// One statement in an answer and the passages it is grounded in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub text: String,
    /// Passage ids; empty means the claim is unsupported.
    pub support: Vec<String>,
}

impl Claim {
    pub fn supported(text: impl Into<String>, support: Vec<String>) -> Self {
        Self {
            text: text.into(),
            support,
        }
    }

    pub fn unsupported(text: impl Into<String>) -> Self {
        Self::supported(text, Vec::new())
    }

    pub fn is_supported(&self) -> bool {
        !self.support.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroundingTrace {
    pub claims: Vec<Claim>,
}

impl GroundingTrace {
    pub fn new(claims: Vec<Claim>) -> Self {
        Self { claims }
    }
}

/// Answer text and the trace that grounds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synthesis {
    pub answer: String,
    pub trace: GroundingTrace,
}

impl Synthesis {
    /// The fixed no-grounding answer: one claim with no support.
    pub fn insufficient() -> Self {
        Self {
            answer: INSUFFICIENT_INFORMATION.to_string(),
            trace: GroundingTrace::new(vec![Claim::unsupported(INSUFFICIENT_INFORMATION)]),
        }
    }
}

/// Everything a strategy may read while composing an answer.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisRequest<'a> {
    pub question: &'a str,
    pub retrieval: &'a RetrievalResult,
    pub style: AnswerStyle,
    pub history: &'a [HistoryTurn],
}

/// A strategy for composing grounded answers.
///
/// Implementations may only cite passages present in
/// `request.retrieval`; the mapper ignores anything else.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &str;
    async fn synthesize(&self, request: &SynthesisRequest<'_>) -> Result<Synthesis>;
}

/// Run `synthesizer` with the empty-retrieval short circuit and a deadline.
///
/// On timeout no partial answer is returned.
pub async fn synthesize_grounded(
    synthesizer: &dyn Synthesizer,
    request: &SynthesisRequest<'_>,
    timeout: Duration,
) -> Result<Synthesis> {
    if request.retrieval.is_empty() {
        return Ok(Synthesis::insufficient());
    }

    let mut synthesis = tokio::time::timeout(timeout, synthesizer.synthesize(request))
        .await
        .map_err(|_| EngineError::Timeout(timeout))??;

    // An answer that asserts nothing checkable is still an answer with no
    // support behind it.
    if synthesis.trace.claims.is_empty() {
        let text = synthesis.answer.clone();
        synthesis.trace.claims.push(Claim::unsupported(text));
    }
    Ok(synthesis)
}

/// Build the configured strategy.
pub fn create_synthesizer(config: &AnswerConfig) -> anyhow::Result<Arc<dyn Synthesizer>> {
    let extractive = ExtractiveSynthesizer::new(config.max_sentences, config.context_passages);
    match config.synthesizer.as_str() {
        "extractive" => Ok(Arc::new(extractive)),
        "generative" => Ok(Arc::new(GenerativeSynthesizer::new(
            &config.generative,
            config.context_passages,
            extractive,
        )?)),
        other => anyhow::bail!("Unknown answer synthesizer: '{}'", other),
    }
}
