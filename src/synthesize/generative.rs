//! Generative answers from an OpenAI-compatible chat completion backend.
//!
//! The model sees the top passages as numbered sources and must tag each
//! sentence with the sources it used, e.g. `Chlorophyll absorbs light [2].`
//! Tags are parsed back into the grounding trace:
//!
//! - a tag naming a source that was not offered is dropped
//! - a sentence without a valid tag becomes an unsupported claim
//! - questions (sentences ending in `?`) are not claims
//!
//! If the backend fails the request falls back to the extractive strategy
//! unless `fallback = false`, in which case it fails with
//! [`EngineError::Synthesis`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::config::GenerativeConfig;
use crate::error::{EngineError, Result};
use crate::models::{AnswerStyle, HistoryTurn, Passage};
use crate::remote::{client_with_timeout, post_json_with_retry};
use crate::text::{clean_text, split_sentences};

use super::{
    Claim, ExtractiveSynthesizer, GroundingTrace, Synthesis, SynthesisRequest, Synthesizer,
    INSUFFICIENT_INFORMATION,
};

/// How many trailing history turns the teacher prompt includes.
const HISTORY_TURNS: usize = 4;

const CONCISE_PROMPT: &str = "You are AskMyNotes. Answer ONLY using the numbered SOURCES. \
Do NOT invent information. End every sentence with the number of each source it relies on \
in square brackets, for example [1] or [1, 3]. If the answer is not in the sources, reply \
with exactly: Not found in your notes. Keep answers concise and educational.";

const TEACHER_PROMPT: &str = "You are AskMyNotes, an encouraging and interactive teacher. \
Answer the student's question concisely using ONLY the numbered SOURCES, using the \
CONVERSATION HISTORY to understand follow-ups such as \"simplify it\" or \"give an example\". \
Do NOT invent information. End every factual sentence with the number of each source it \
relies on in square brackets, for example [2]. Speak naturally. ALWAYS end with ONE specific, \
content-related follow-up question that tests the student's understanding.";

pub struct GenerativeSynthesizer {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
    context_passages: usize,
    fallback: Option<ExtractiveSynthesizer>,
}

impl GenerativeSynthesizer {
    /// Reads the API key from the environment variable named in `config`.
    pub fn new(
        config: &GenerativeConfig,
        context_passages: usize,
        fallback: ExtractiveSynthesizer,
    ) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("{} environment variable not set", config.api_key_env))?;
        Ok(Self {
            client: client_with_timeout(Duration::from_secs(60))?,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            context_passages: context_passages.max(1),
            fallback: config.fallback.then_some(fallback),
        })
    }

    async fn complete(&self, system: &str, user: &str) -> anyhow::Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        let response = post_json_with_retry(
            &self.client,
            &self.url,
            Some(&self.api_key),
            &body,
            self.max_retries,
            "chat completion",
        )
        .await?;

        response
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| anyhow::anyhow!("chat completion response has no content"))
    }
}

/// The user message: numbered sources, optional history, then the question.
pub(crate) fn build_prompt(
    question: &str,
    sources: &[Arc<Passage>],
    style: AnswerStyle,
    history: &[HistoryTurn],
) -> String {
    let mut prompt = String::from("SOURCES:\n");
    for (i, passage) in sources.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] ({} | {})\n{}\n\n",
            i + 1,
            passage.filename,
            passage.section_label(),
            passage.text
        ));
    }

    if style == AnswerStyle::Teacher {
        prompt.push_str("CONVERSATION HISTORY:\n");
        let start = history.len().saturating_sub(HISTORY_TURNS);
        if start == history.len() {
            prompt.push_str("No previous history.\n");
        }
        for turn in &history[start..] {
            prompt.push_str(&format!("{}: {}\n", turn.role.to_uppercase(), turn.content));
        }
        prompt.push('\n');
        prompt.push_str("STUDENT QUESTION:\n");
    } else {
        prompt.push_str("QUESTION:\n");
    }
    prompt.push_str(question);
    prompt
}

/// Parse `[n]` / `[n, m]` at the start of `s`, returning the 1-based
/// indices and the byte length of the tag.
fn parse_tag(s: &str) -> Option<(Vec<usize>, usize)> {
    let close = s.find(']')?;
    let inner = s.get(1..close)?;
    if inner.trim().is_empty() {
        return None;
    }
    let indices = inner
        .split(',')
        .map(|part| part.trim().parse::<usize>().ok())
        .collect::<Option<Vec<_>>>()?;
    Some((indices, close + 1))
}

/// Move tags that follow a sentence terminator in front of it, so
/// `"Cells divide. [1] Next"` splits into a sentence that owns its tag.
fn anchor_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('[') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];
        match parse_tag(candidate) {
            Some((_, len)) => {
                let tag = &candidate[..len];
                let trimmed = out.trim_end().len();
                match out[..trimmed].chars().last() {
                    Some(t @ ('.' | '!' | '?')) => {
                        out.truncate(trimmed - t.len_utf8());
                        out.push(' ');
                        out.push_str(tag);
                        out.push(t);
                    }
                    _ => out.push_str(tag),
                }
                rest = &candidate[len..];
            }
            None => {
                out.push('[');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Remove every tag from `sentence`, returning the clean text and the
/// passage ids of the tags that name an offered source.
fn strip_tags(sentence: &str, sources: &[Arc<Passage>]) -> (String, Vec<String>) {
    let mut text = String::with_capacity(sentence.len());
    let mut support: Vec<String> = Vec::new();
    let mut rest = sentence;
    while let Some(start) = rest.find('[') {
        text.push_str(&rest[..start]);
        let candidate = &rest[start..];
        match parse_tag(candidate) {
            Some((indices, len)) => {
                for n in indices {
                    if let Some(passage) = n.checked_sub(1).and_then(|i| sources.get(i)) {
                        if !support.contains(&passage.id) {
                            support.push(passage.id.clone());
                        }
                    }
                }
                rest = &candidate[len..];
            }
            None => {
                text.push('[');
                rest = &candidate[1..];
            }
        }
    }
    text.push_str(rest);
    (clean_text(&text), support)
}

/// Turn a tagged model reply into display text and a grounding trace.
pub(crate) fn parse_reply(reply: &str, sources: &[Arc<Passage>]) -> Synthesis {
    if reply.trim().trim_matches('"') == INSUFFICIENT_INFORMATION {
        return Synthesis::insufficient();
    }

    let anchored = anchor_tags(&clean_text(reply));
    let mut answer_parts = Vec::new();
    let mut claims = Vec::new();

    for sentence in split_sentences(&anchored) {
        let (text, support) = strip_tags(sentence, sources);
        if text.is_empty() {
            continue;
        }
        if !text.ends_with('?') {
            claims.push(Claim::supported(text.clone(), support));
        }
        answer_parts.push(text);
    }

    Synthesis {
        answer: answer_parts.join(" "),
        trace: GroundingTrace::new(claims),
    }
}

#[async_trait]
impl Synthesizer for GenerativeSynthesizer {
    fn name(&self) -> &str {
        "generative"
    }

    async fn synthesize(&self, request: &SynthesisRequest<'_>) -> Result<Synthesis> {
        let sources: Vec<Arc<Passage>> = request
            .retrieval
            .items
            .iter()
            .take(self.context_passages)
            .map(|item| item.passage.clone())
            .collect();

        let system = match request.style {
            AnswerStyle::Concise => CONCISE_PROMPT,
            AnswerStyle::Teacher => TEACHER_PROMPT,
        };
        let user = build_prompt(request.question, &sources, request.style, request.history);

        match self.complete(system, &user).await {
            Ok(reply) => {
                info!(model = %self.model, sources = sources.len(), "generated answer");
                Ok(parse_reply(&reply, &sources))
            }
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    warn!(error = %e, model = %self.model, "chat completion failed; using extractive answer");
                    fallback.synthesize(request).await
                }
                None => Err(EngineError::Synthesis(format!("{:#}", e))),
            },
        }
    }
}
