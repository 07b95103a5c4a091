//! Embedding provider trait, remote client, and caching wrapper.
//!
//! The pipeline embeds with whatever implements [`EmbeddingProvider`]; the
//! shipped implementation calls a Voyage-compatible embeddings API over REST
//! with bounded retry. [`EmbeddingClient`] layers batching and an optional
//! in-memory TTL cache on top of any provider.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, Result};

/// Produces one dense vector per input text, in input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Vector dimensionality this provider produces.
    fn dims(&self) -> usize;
}

// ============ Voyage REST provider ============

pub struct VoyageProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl VoyageProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            PipelineError::permanent(
                "embedding",
                format!("{} environment variable not set", config.api_key_env),
            )
        })?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::permanent("embedding", e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            dims: config.dims,
            max_retries: config.max_retries.max(1),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for VoyageProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "input": texts,
            "model": self.model,
        });

        let mut last_error = String::new();
        for attempt in 1..=self.max_retries {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: serde_json::Value = resp.json().await.map_err(|e| {
                            PipelineError::permanent("embedding", e.to_string())
                        })?;
                        return extract_embeddings(&parsed, texts.len(), self.dims);
                    }
                    // 429 and 5xx are retryable; other 4xx are not.
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_error = format!("HTTP {}", status);
                    } else {
                        let detail = resp.text().await.unwrap_or_default();
                        return Err(PipelineError::permanent(
                            "embedding",
                            format!("HTTP {}: {}", status, detail),
                        ));
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            if attempt < self.max_retries {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::warn!(
                    attempt,
                    max = self.max_retries,
                    error = %last_error,
                    "embedding request failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(PipelineError::transient(
            "embedding",
            self.max_retries,
            last_error,
        ))
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

fn extract_embeddings(
    parsed: &serde_json::Value,
    expected: usize,
    dims: usize,
) -> Result<Vec<Vec<f32>>> {
    let data = parsed["data"]
        .as_array()
        .ok_or_else(|| PipelineError::permanent("embedding", "missing data array in response"))?;
    if data.len() != expected {
        return Err(PipelineError::permanent(
            "embedding",
            format!("expected {} embeddings, got {}", expected, data.len()),
        ));
    }
    let mut out = Vec::with_capacity(data.len());
    for item in data {
        let vec: Vec<f32> = item["embedding"]
            .as_array()
            .ok_or_else(|| PipelineError::permanent("embedding", "missing embedding field"))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        if vec.len() != dims {
            return Err(PipelineError::permanent(
                "embedding",
                format!("expected {} dims, got {}", dims, vec.len()),
            ));
        }
        out.push(vec);
    }
    Ok(out)
}

// ============ Caching / batching client ============

struct CacheEntry {
    vector: Vec<f32>,
    inserted_at: Instant,
}

/// Wraps a provider with request batching and an in-memory TTL cache keyed by
/// exact input text. The cache is a cost optimization only; on any miss the
/// provider is authoritative.
pub struct EmbeddingClient {
    provider: std::sync::Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    cache: Option<Mutex<HashMap<String, CacheEntry>>>,
    cache_ttl: Duration,
}

impl EmbeddingClient {
    pub fn new(provider: std::sync::Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            batch_size: config.batch_size.max(1),
            cache: config.cache_enabled.then(|| Mutex::new(HashMap::new())),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
        }
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Embed a single query string.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let input = [text.to_string()];
        let mut vecs = self.embed_texts(&input).await?;
        vecs.pop()
            .ok_or_else(|| PipelineError::permanent("embedding", "empty embedding response"))
    }

    /// Embed document chunk texts, each prefixed with its filename so the
    /// vector carries document identity.
    pub async fn embed_document_chunks(
        &self,
        filename: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let prefixed: Vec<String> = texts
            .iter()
            .map(|t| format!("Document: {}\n\n{}", filename, t))
            .collect();
        self.embed_texts(&prefixed).await
    }

    /// Embed texts in provider-sized batches, consulting the cache first.
    /// Output order matches input order.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<usize> = Vec::new();

        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().map_err(|_| {
                PipelineError::permanent("embedding", "cache lock poisoned")
            })?;
            for (i, text) in texts.iter().enumerate() {
                match guard.get(text) {
                    Some(entry) if entry.inserted_at.elapsed() < self.cache_ttl => {
                        results[i] = Some(entry.vector.clone());
                    }
                    _ => misses.push(i),
                }
            }
            // Expired entries are dropped lazily when looked up.
            guard.retain(|_, e| e.inserted_at.elapsed() < self.cache_ttl);
        } else {
            misses.extend(0..texts.len());
        }

        for batch in misses.chunks(self.batch_size) {
            let inputs: Vec<String> = batch.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.provider.embed(&inputs).await?;
            for (&i, vector) in batch.iter().zip(vectors) {
                if let Some(cache) = &self.cache {
                    if let Ok(mut guard) = cache.lock() {
                        guard.insert(
                            texts[i].clone(),
                            CacheEntry {
                                vector: vector.clone(),
                                inserted_at: Instant::now(),
                            },
                        );
                    }
                }
                results[i] = Some(vector);
            }
        }

        results
            .into_iter()
            .map(|v| {
                v.ok_or_else(|| PipelineError::permanent("embedding", "missing embedding in batch"))
            })
            .collect()
    }
}

/// Cosine similarity between two vectors. Returns 0.0 for mismatched lengths
/// or zero-magnitude inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}
