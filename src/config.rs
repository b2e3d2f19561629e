//! Configuration parsing and validation.
//!
//! The core is configured via a TOML file (default: `config/ragcore.toml`).
//! Sections map directly onto the components in `src/`: chunking policy,
//! embedding/reranker model lifecycle, hybrid retrieval tuning, corrective
//! gating, the LLM provider, and session/ingestion concurrency.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub query_expansion: QueryExpansionConfig,
    #[serde(default)]
    pub corrective_rag: CorrectiveRagConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_words")]
    pub target_words: usize,
    #[serde(default = "default_overlap_words")]
    pub overlap_words: usize,
    #[serde(default = "default_min_words")]
    pub min_words: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default)]
    pub preserve_tables: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_words: default_target_words(),
            overlap_words: default_overlap_words(),
            min_words: default_min_words(),
            max_chars: default_max_chars(),
            preserve_tables: true,
        }
    }
}

fn default_target_words() -> usize {
    1000
}
fn default_overlap_words() -> usize {
    200
}
fn default_min_words() -> usize {
    50
}
fn default_max_chars() -> usize {
    8000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_policy")]
    pub batch_policy: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_s: u64,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            batch_policy: default_batch_policy(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            idle_timeout_s: default_idle_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    1024
}
fn default_batch_policy() -> String {
    "adaptive".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_batch_size() -> usize {
    8
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k_vec")]
    pub k_vec: i64,
    #[serde(default = "default_k_lex")]
    pub k_lex: i64,
    #[serde(default = "default_k_out")]
    pub k_out: i64,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_hybrid_weight")]
    pub hybrid_weight: f64,
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f32,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_vec: default_k_vec(),
            k_lex: default_k_lex(),
            k_out: default_k_out(),
            rrf_k: default_rrf_k(),
            hybrid_weight: default_hybrid_weight(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
        }
    }
}

fn default_k_vec() -> i64 {
    100
}
fn default_k_lex() -> i64 {
    100
}
fn default_k_out() -> i64 {
    20
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_hybrid_weight() -> f64 {
    0.7
}
fn default_bm25_k1() -> f32 {
    1.5
}
fn default_bm25_b() -> f32 {
    0.75
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_reranker_model")]
    pub model: String,
    #[serde(default = "default_rerank_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_s: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: default_reranker_model(),
            batch_size: default_rerank_batch_size(),
            idle_timeout_s: default_idle_timeout_secs(),
        }
    }
}

fn default_reranker_model() -> String {
    "bge-reranker-base".to_string()
}
fn default_rerank_batch_size() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryExpansionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_n_variants")]
    pub n_variants: usize,
    #[serde(default = "default_expansion_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_expansion_temperature")]
    pub temperature: f32,
}

impl Default for QueryExpansionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            n_variants: default_n_variants(),
            timeout_secs: default_expansion_timeout_secs(),
            temperature: default_expansion_temperature(),
        }
    }
}

fn default_n_variants() -> usize {
    3
}
fn default_expansion_timeout_secs() -> u64 {
    5
}
fn default_expansion_temperature() -> f32 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorrectiveRagConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: u8,
    #[serde(default = "default_min_relevant")]
    pub min_relevant: usize,
    #[serde(default)]
    pub external_search_enabled: bool,
    #[serde(default = "default_corrective_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CorrectiveRagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            relevance_threshold: default_relevance_threshold(),
            min_relevant: default_min_relevant(),
            external_search_enabled: false,
            timeout_secs: default_corrective_timeout_secs(),
        }
    }
}

fn default_relevance_threshold() -> u8 {
    7
}
fn default_min_relevant() -> usize {
    3
}
fn default_corrective_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub default_model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            endpoint: default_llm_endpoint(),
            api_key: None,
            default_model: default_llm_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "ollama".to_string()
}
fn default_llm_endpoint() -> String {
    "http://localhost:11434".to_string()
}
fn default_llm_model() -> String {
    "llama3".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl_s")]
    pub ttl_s: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_s: default_session_ttl_s(),
        }
    }
}

fn default_session_ttl_s() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_concurrency")]
    pub concurrency: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: default_ingest_concurrency(),
        }
    }
}

fn default_ingest_concurrency() -> usize {
    2
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "failed to parse config file")?;

    if config.chunking.target_words == 0 {
        anyhow::bail!("chunking.target_words must be > 0");
    }
    if config.chunking.overlap_words >= config.chunking.target_words {
        anyhow::bail!("chunking.overlap_words must be < chunking.target_words");
    }
    if config.retrieval.k_out < 1 {
        anyhow::bail!("retrieval.k_out must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_weight) {
        anyhow::bail!("retrieval.hybrid_weight must be in [0.0, 1.0]");
    }
    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0 when provider is not disabled");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "unknown embedding provider: '{}'. must be disabled, openai, ollama, or local",
            other
        ),
    }
    match config.llm.provider.as_str() {
        "ollama" | "openai" | "vllm" => {}
        other => anyhow::bail!(
            "unknown llm provider: '{}'. must be ollama, openai, or vllm",
            other
        ),
    }
    if config.corrective_rag.relevance_threshold > 10 {
        anyhow::bail!("corrective_rag.relevance_threshold must be in 0..=10");
    }

    Ok(config)
}
