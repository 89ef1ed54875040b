use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub answer: AnswerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory; each namespace lives under `<root>/<namespace>/`.
    pub root: PathBuf,
    /// Which files in a namespace's docs directory count as sources.
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "*.pdf".to_string(),
        "*.txt".to_string(),
        "*.md".to_string(),
        "*.doc".to_string(),
        "*.docx".to_string(),
        "*.xls".to_string(),
        "*.xlsx".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { chunk_size: default_chunk_size(), overlap: default_overlap() }
    }
}

fn default_chunk_size() -> usize {
    8000
}
fn default_overlap() -> usize {
    800
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Top-N fetched from each of the semantic and lexical channels.
    #[serde(default = "default_candidate_n")]
    pub candidate_n: usize,
    /// Results returned after fusion.
    #[serde(default = "default_final_k")]
    pub final_k: usize,
    /// Default fusion weights, overridden per query by the analyzer.
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_n: default_candidate_n(),
            final_k: default_final_k(),
            semantic_weight: default_semantic_weight(),
            lexical_weight: default_lexical_weight(),
        }
    }
}

fn default_candidate_n() -> usize {
    10
}
fn default_final_k() -> usize {
    5
}
fn default_semantic_weight() -> f64 {
    0.7
}
fn default_lexical_weight() -> f64 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `openai`, `gemini`, or `disabled`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
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
            provider: default_disabled(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
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

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    /// `http` or `disabled`. With `disabled`, garbled PDFs are skipped with
    /// a warning instead of falling back.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            endpoint: None,
            timeout_secs: default_ocr_timeout_secs(),
        }
    }
}

fn default_ocr_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Page budget for one crawl invocation.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
            user_agent: default_user_agent(),
            max_pages: default_max_pages(),
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    10
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (compatible; DocchatBot/1.0)".to_string()
}
fn default_max_pages() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnswerConfig {
    /// `openai` or `disabled`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default = "default_answer_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: default_answer_model(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_answer_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f64 {
    0.1
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.overlap must be smaller than chunking.chunk_size");
    }

    if config.retrieval.candidate_n == 0 || config.retrieval.final_k == 0 {
        anyhow::bail!("retrieval.candidate_n and retrieval.final_k must be >= 1");
    }
    let weight_sum = config.retrieval.semantic_weight + config.retrieval.lexical_weight;
    if (weight_sum - 1.0).abs() > 1e-9 {
        anyhow::bail!(
            "retrieval.semantic_weight + retrieval.lexical_weight must sum to 1.0, got {}",
            weight_sum
        );
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "gemini" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or gemini.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.ocr.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.ocr.endpoint.is_none() {
                anyhow::bail!("ocr.endpoint must be set when ocr.provider is 'http'");
            }
        }
        other => anyhow::bail!("Unknown ocr provider: '{}'. Must be disabled or http.", other),
    }

    match config.answer.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown answer provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}

impl Config {
    /// A configuration rooted at `root` with every other section defaulted.
    /// Embedding, OCR, and answer providers start disabled.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Config {
            storage: StorageConfig { root: root.into(), include_globs: default_include_globs() },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            ocr: OcrConfig::default(),
            fetch: FetchConfig::default(),
            answer: AnswerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::with_root("data");
        validate(&config).unwrap();
        assert_eq!(config.chunking.chunk_size, 8000);
        assert_eq!(config.chunking.overlap, 800);
        assert_eq!(config.retrieval.candidate_n, 10);
        assert_eq!(config.retrieval.final_k, 5);
    }

    #[test]
    fn weights_must_sum_to_one() {
        let mut config = Config::with_root("data");
        config.retrieval.semantic_weight = 0.9;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn enabled_embedding_requires_model_and_dims() {
        let mut config = Config::with_root("data");
        config.embedding.provider = "openai".to_string();
        assert!(validate(&config).is_err());
        config.embedding.model = Some("text-embedding-3-small".to_string());
        config.embedding.dims = Some(1536);
        validate(&config).unwrap();
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let mut config = Config::with_root("data");
        config.chunking.overlap = config.chunking.chunk_size;
        assert!(validate(&config).is_err());
    }
}
