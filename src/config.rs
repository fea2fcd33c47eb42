use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::Subject;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: Option<DbConfig>,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub answer: AnswerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub subjects: Vec<Subject>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_words")]
    pub max_words: usize,
    #[serde(default = "default_overlap_words")]
    pub overlap_words: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_words: default_max_words(),
            overlap_words: default_overlap_words(),
        }
    }
}

fn default_max_words() -> usize {
    400
}
fn default_overlap_words() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// `lexical`, `semantic`, or `hybrid`.
    #[serde(default = "default_scorer")]
    pub scorer: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Passages scoring at or below this floor are dropped.
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f64,
    /// Weight for semantic vs lexical: `hybrid = (1-α)*lexical + α*semantic`.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            scorer: default_scorer(),
            top_k: default_top_k(),
            min_relevance: default_min_relevance(),
            hybrid_alpha: default_hybrid_alpha(),
        }
    }
}

fn default_scorer() -> String {
    "lexical".to_string()
}
fn default_top_k() -> usize {
    5
}
fn default_min_relevance() -> f64 {
    0.1
}
fn default_hybrid_alpha() -> f64 {
    0.6
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnswerConfig {
    /// `extractive` or `generative`.
    #[serde(default = "default_synthesizer")]
    pub synthesizer: String,
    /// Relevance a supporting passage must exceed to count as strong.
    #[serde(default = "default_strong_threshold")]
    pub strong_threshold: f64,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
    #[serde(default = "default_max_sentences")]
    pub max_sentences: usize,
    /// How many of the top retrieved passages the synthesizer reads.
    #[serde(default = "default_context_passages")]
    pub context_passages: usize,
    #[serde(default = "default_answer_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub generative: GenerativeConfig,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            synthesizer: default_synthesizer(),
            strong_threshold: default_strong_threshold(),
            snippet_chars: default_snippet_chars(),
            max_sentences: default_max_sentences(),
            context_passages: default_context_passages(),
            timeout_secs: default_answer_timeout_secs(),
            generative: GenerativeConfig::default(),
        }
    }
}

fn default_synthesizer() -> String {
    "extractive".to_string()
}
fn default_strong_threshold() -> f64 {
    0.4
}
fn default_snippet_chars() -> usize {
    200
}
fn default_max_sentences() -> usize {
    3
}
fn default_context_passages() -> usize {
    3
}
fn default_answer_timeout_secs() -> u64 {
    30
}

/// OpenAI-compatible chat completion backend (Groq, OpenAI, vLLM, ...).
#[derive(Debug, Deserialize, Clone)]
pub struct GenerativeConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
    /// Answer extractively when the backend fails. When off the failure
    /// is reported as `synthesis_failed`.
    #[serde(default = "default_true")]
    pub fallback: bool,
}

impl Default for GenerativeConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_llm_api_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_retries: default_llm_max_retries(),
            fallback: true,
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}
fn default_llm_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}
fn default_llm_api_key_env() -> String {
    "GROQ_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    512
}
fn default_llm_max_retries() -> u32 {
    2
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Overrides the provider's default endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_max_upload_bytes() -> usize {
    25 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Globs applied to files found when ingesting a directory.
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    ["pdf", "md", "markdown", "txt", "docx", "pptx", "xlsx"]
        .iter()
        .map(|ext| format!("**/*.{}", ext))
        .collect()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;

    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_words == 0 {
        anyhow::bail!("chunking.max_words must be > 0");
    }
    if config.chunking.overlap_words >= config.chunking.max_words {
        anyhow::bail!("chunking.overlap_words must be < chunking.max_words");
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if !(0.0..1.0).contains(&config.retrieval.min_relevance) {
        anyhow::bail!("retrieval.min_relevance must be in [0.0, 1.0)");
    }
    match config.retrieval.scorer.as_str() {
        "lexical" => {}
        "semantic" | "hybrid" => {
            if !config.embedding.is_enabled() {
                anyhow::bail!(
                    "retrieval.scorer = '{}' requires an embedding provider",
                    config.retrieval.scorer
                );
            }
        }
        other => anyhow::bail!(
            "Unknown retrieval scorer: '{}'. Must be lexical, semantic, or hybrid.",
            other
        ),
    }

    // Validate answer synthesis
    match config.answer.synthesizer.as_str() {
        "extractive" | "generative" => {}
        other => anyhow::bail!(
            "Unknown answer synthesizer: '{}'. Must be extractive or generative.",
            other
        ),
    }
    if config.answer.timeout_secs == 0 {
        anyhow::bail!("answer.timeout_secs must be > 0");
    }
    if config.answer.snippet_chars == 0 {
        anyhow::bail!("answer.snippet_chars must be > 0");
    }
    if config.answer.max_sentences == 0 || config.answer.context_passages == 0 {
        anyhow::bail!("answer.max_sentences and answer.context_passages must be > 0");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    // Validate subjects
    for (i, subject) in config.subjects.iter().enumerate() {
        if subject.id.trim().is_empty() {
            anyhow::bail!("subjects[{}].id must not be empty", i);
        }
        if config.subjects[..i].iter().any(|s| s.id == subject.id) {
            anyhow::bail!("duplicate subject id: '{}'", subject.id);
        }
    }

    Ok(())
}
