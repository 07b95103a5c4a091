use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// SQLite database path for chat history and session metadata.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_max_chunks_per_doc")]
    pub max_chunks_per_doc: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            max_chunks_per_doc: default_max_chunks_per_doc(),
        }
    }
}

fn default_chunk_size() -> usize {
    1500
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_max_chunks_per_doc() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Minimum similarity score a chunk must meet to be used as evidence.
    /// Deliberately permissive: the generation prompt is also instructed to
    /// acknowledge missing information.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    /// Per-sub-query top-K when a question is decomposed.
    #[serde(default = "default_top_k")]
    pub decomposition_top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            score_threshold: default_score_threshold(),
            decomposition_top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_score_threshold() -> f32 {
    0.34
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Base URL of the embeddings API (e.g. `https://api.voyageai.com/v1`).
    pub base_url: String,
    pub model: String,
    pub dims: usize,
    /// Environment variable holding the API key.
    #[serde(default = "default_embedding_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// In-memory cache of embeddings keyed by exact input text. Purely a
    /// latency/cost optimization; correctness never depends on it.
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_embedding_api_key_env() -> String {
    "VOYAGE_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_cache_ttl_secs() -> u64 {
    86_400
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Base URL of the messages API (e.g. `https://api.anthropic.com/v1`).
    pub base_url: String,
    pub model: String,
    /// Cheaper, low-latency model used for query classification.
    #[serde(default)]
    pub classify_model: Option<String>,
    #[serde(default = "default_generation_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Timeout for the routing classification call; on expiry the router
    /// falls back to single-document retrieval.
    #[serde(default = "default_classify_timeout_secs")]
    pub classify_timeout_secs: u64,
    #[serde(default = "default_max_sub_queries")]
    pub max_sub_queries: usize,
}

fn default_generation_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_temperature() -> f32 {
    0.2
}
fn default_classify_timeout_secs() -> u64 {
    10
}
fn default_max_sub_queries() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Base URL of the Qdrant-compatible vector index.
    pub url: String,
    #[serde(default = "default_index_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,
    #[serde(default = "default_scroll_limit")]
    pub scroll_limit: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_index_api_key_env() -> String {
    "QDRANT_API_KEY".to_string()
}
fn default_collection() -> String {
    "documents".to_string()
}
fn default_upsert_batch_size() -> usize {
    100
}
fn default_scroll_limit() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_per_minute")]
    pub requests_per_minute: usize,
    #[serde(default = "default_per_hour")]
    pub requests_per_hour: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_per_minute(),
            requests_per_hour: default_per_hour(),
        }
    }
}

fn default_per_minute() -> usize {
    20
}
fn default_per_hour() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    /// Number of recent turns included in prompts.
    #[serde(default = "default_context_turns")]
    pub context_turns: usize,
    /// Once a conversation exceeds this many stored turns, a summary is
    /// generated and prepended to the context.
    #[serde(default = "default_summary_after_turns")]
    pub summary_after_turns: usize,
    /// Regenerate the summary every this many new turns.
    #[serde(default = "default_summary_refresh_turns")]
    pub summary_refresh_turns: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            context_turns: default_context_turns(),
            summary_after_turns: default_summary_after_turns(),
            summary_refresh_turns: default_summary_refresh_turns(),
        }
    }
}

fn default_context_turns() -> usize {
    10
}
fn default_summary_after_turns() -> usize {
    10
}
fn default_summary_refresh_turns() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.score_threshold) {
        anyhow::bail!("retrieval.score_threshold must be in [0.0, 1.0]");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.model.is_empty() {
        anyhow::bail!("embedding.model must be specified");
    }

    if config.generation.model.is_empty() {
        anyhow::bail!("generation.model must be specified");
    }

    if config.rate_limit.requests_per_minute == 0 || config.rate_limit.requests_per_hour == 0 {
        anyhow::bail!("rate_limit windows must be >= 1");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    const MINIMAL: &str = r#"
[db]
path = "/tmp/docq.sqlite"

[embedding]
base_url = "https://api.voyageai.com/v1"
model = "voyage-3-lite"
dims = 512

[generation]
base_url = "https://api.anthropic.com/v1"
model = "claude-sonnet-4-20250514"

[index]
url = "http://localhost:6333"

[server]
bind = "127.0.0.1:8080"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let f = write_config(MINIMAL);
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.chunking.chunk_size, 1500);
        assert_eq!(cfg.chunking.chunk_overlap, 200);
        assert_eq!(cfg.retrieval.top_k, 5);
        assert!((cfg.retrieval.score_threshold - 0.34).abs() < 1e-6);
        assert_eq!(cfg.rate_limit.requests_per_minute, 20);
        assert_eq!(cfg.rate_limit.requests_per_hour, 200);
        assert_eq!(cfg.history.context_turns, 10);
        assert!(cfg.embedding.cache_enabled);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk_size() {
        let body = format!("{}\n[chunking]\nchunk_size = 100\nchunk_overlap = 100\n", MINIMAL);
        let f = write_config(&body);
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let body = format!("{}\n[retrieval]\nscore_threshold = 1.5\n", MINIMAL);
        let f = write_config(&body);
        assert!(load_config(f.path()).is_err());
    }
}
