//! Vector index trait and Qdrant REST implementation.
//!
//! Every read and write is scoped by `session_id` through a payload filter,
//! so sessions can never observe each other's documents. Chunk text and
//! document metadata live in the point payload; there is no separate
//! document table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::IndexConfig;
use crate::error::{PipelineError, Result};
use crate::models::{Document, ScoredChunk};

/// Payload stored alongside each chunk vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub doc_id: String,
    pub session_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub page_number: Option<u32>,
    pub filename: String,
    pub document_type: String,
    pub fingerprint: String,
    pub uploaded_at: DateTime<Utc>,
}

/// One chunk ready for indexing.
#[derive(Debug, Clone)]
pub struct IndexPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

/// Session-scoped vector store for document chunks.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection and payload indexes if they do not exist.
    async fn ensure_ready(&self) -> Result<()>;

    async fn upsert(&self, points: Vec<IndexPoint>) -> Result<()>;

    /// Nearest-neighbor search within one session, optionally restricted to
    /// an allowlist of document ids.
    async fn search(
        &self,
        vector: &[f32],
        session_id: &str,
        doc_ids: Option<&[String]>,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>>;

    /// Return the doc_id of an existing document in this session with the
    /// given content fingerprint, if any.
    async fn find_fingerprint(&self, session_id: &str, fingerprint: &str)
        -> Result<Option<String>>;

    /// All documents stored for a session, reconstructed from chunk payloads.
    async fn session_documents(&self, session_id: &str) -> Result<Vec<Document>>;

    /// Delete every chunk of one document. Returns whether the document was
    /// present.
    async fn delete_document(&self, session_id: &str, doc_id: &str) -> Result<bool>;
}

// ============ Qdrant REST client ============

pub struct QdrantIndex {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    collection: String,
    dims: usize,
    upsert_batch_size: usize,
    scroll_limit: usize,
}

impl QdrantIndex {
    pub fn new(config: &IndexConfig, dims: usize) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Index(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: std::env::var(&config.api_key_env).ok(),
            collection: config.collection.clone(),
            dims,
            upsert_batch_size: config.upsert_batch_size.max(1),
            scroll_limit: config.scroll_limit.max(1),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("api-key", key);
        }
        builder
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut builder = self.request(method, path);
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| PipelineError::Index(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Index(format!("HTTP {}: {}", status, detail)));
        }
        resp.json()
            .await
            .map_err(|e| PipelineError::Index(e.to_string()))
    }

    fn session_filter(session_id: &str, extra_must: Vec<serde_json::Value>) -> serde_json::Value {
        let mut must = vec![json!({"key": "session_id", "match": {"value": session_id}})];
        must.extend(extra_must);
        json!({"must": must})
    }

    /// Scroll every payload matching the filter, following pagination.
    async fn scroll_payloads(&self, filter: serde_json::Value) -> Result<Vec<ChunkPayload>> {
        let path = format!("/collections/{}/points/scroll", self.collection);
        let mut payloads = Vec::new();
        let mut offset: Option<serde_json::Value> = None;

        loop {
            let mut body = json!({
                "filter": filter,
                "limit": self.scroll_limit,
                "with_payload": true,
                "with_vector": false,
            });
            if let Some(off) = &offset {
                body["offset"] = off.clone();
            }
            let parsed = self.send(reqwest::Method::POST, &path, Some(body)).await?;
            let points = parsed["result"]["points"]
                .as_array()
                .ok_or_else(|| PipelineError::Index("malformed scroll response".into()))?;
            for point in points {
                let payload: ChunkPayload = serde_json::from_value(point["payload"].clone())
                    .map_err(|e| PipelineError::Index(format!("bad payload: {}", e)))?;
                payloads.push(payload);
            }
            match &parsed["result"]["next_page_offset"] {
                serde_json::Value::Null => break,
                next => offset = Some(next.clone()),
            }
        }
        Ok(payloads)
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_ready(&self) -> Result<()> {
        let exists = self
            .send(
                reqwest::Method::GET,
                &format!("/collections/{}", self.collection),
                None,
            )
            .await
            .is_ok();

        if !exists {
            self.send(
                reqwest::Method::PUT,
                &format!("/collections/{}", self.collection),
                Some(json!({
                    "vectors": {"size": self.dims, "distance": "Cosine"}
                })),
            )
            .await?;
            tracing::info!(collection = %self.collection, dims = self.dims, "created collection");
        }

        // Keyword indexes make the session/doc/fingerprint filters cheap.
        for field in ["session_id", "doc_id", "fingerprint"] {
            // Creating an existing index is a no-op failure; ignore it.
            let _ = self
                .send(
                    reqwest::Method::PUT,
                    &format!("/collections/{}/index", self.collection),
                    Some(json!({"field_name": field, "field_schema": "keyword"})),
                )
                .await;
        }
        Ok(())
    }

    async fn upsert(&self, points: Vec<IndexPoint>) -> Result<()> {
        let path = format!("/collections/{}/points?wait=true", self.collection);
        for batch in points.chunks(self.upsert_batch_size) {
            let body: Vec<serde_json::Value> = batch
                .iter()
                .map(|p| {
                    json!({
                        "id": p.id,
                        "vector": p.vector,
                        "payload": p.payload,
                    })
                })
                .collect();
            self.send(
                reqwest::Method::PUT,
                &path,
                Some(json!({"points": body})),
            )
            .await?;
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        session_id: &str,
        doc_ids: Option<&[String]>,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let mut extra = Vec::new();
        if let Some(ids) = doc_ids {
            if !ids.is_empty() {
                extra.push(json!({"key": "doc_id", "match": {"any": ids}}));
            }
        }
        let body = json!({
            "vector": vector,
            "limit": top_k,
            "with_payload": true,
            "filter": Self::session_filter(session_id, extra),
        });
        let parsed = self
            .send(
                reqwest::Method::POST,
                &format!("/collections/{}/points/search", self.collection),
                Some(body),
            )
            .await?;

        let hits = parsed["result"]
            .as_array()
            .ok_or_else(|| PipelineError::Index("malformed search response".into()))?;
        let mut chunks = Vec::with_capacity(hits.len());
        for hit in hits {
            let payload: ChunkPayload = serde_json::from_value(hit["payload"].clone())
                .map_err(|e| PipelineError::Index(format!("bad payload: {}", e)))?;
            let score = hit["score"].as_f64().unwrap_or(0.0) as f32;
            chunks.push(ScoredChunk {
                doc_id: payload.doc_id,
                chunk_index: payload.chunk_index,
                text: payload.text,
                filename: payload.filename,
                page_number: payload.page_number,
                score,
            });
        }
        Ok(chunks)
    }

    async fn find_fingerprint(
        &self,
        session_id: &str,
        fingerprint: &str,
    ) -> Result<Option<String>> {
        let filter = Self::session_filter(
            session_id,
            vec![json!({"key": "fingerprint", "match": {"value": fingerprint}})],
        );
        let body = json!({
            "filter": filter,
            "limit": 1,
            "with_payload": true,
            "with_vector": false,
        });
        let parsed = self
            .send(
                reqwest::Method::POST,
                &format!("/collections/{}/points/scroll", self.collection),
                Some(body),
            )
            .await?;
        let points = parsed["result"]["points"]
            .as_array()
            .ok_or_else(|| PipelineError::Index("malformed scroll response".into()))?;
        Ok(points
            .first()
            .and_then(|p| p["payload"]["doc_id"].as_str())
            .map(|s| s.to_string()))
    }

    async fn session_documents(&self, session_id: &str) -> Result<Vec<Document>> {
        let payloads = self
            .scroll_payloads(Self::session_filter(session_id, Vec::new()))
            .await?;

        let mut by_doc: HashMap<String, Document> = HashMap::new();
        for p in payloads {
            let entry = by_doc.entry(p.doc_id.clone()).or_insert_with(|| Document {
                doc_id: p.doc_id.clone(),
                session_id: p.session_id.clone(),
                filename: p.filename.clone(),
                document_type: p.document_type.clone(),
                fingerprint: p.fingerprint.clone(),
                total_chunks: 0,
                page_count: None,
                uploaded_at: p.uploaded_at,
            });
            entry.total_chunks += 1;
            if let Some(page) = p.page_number {
                entry.page_count = Some(entry.page_count.map_or(page, |c| c.max(page)));
            }
        }

        let mut docs: Vec<Document> = by_doc.into_values().collect();
        docs.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at).then(a.doc_id.cmp(&b.doc_id)));
        Ok(docs)
    }

    async fn delete_document(&self, session_id: &str, doc_id: &str) -> Result<bool> {
        let filter = Self::session_filter(
            session_id,
            vec![json!({"key": "doc_id", "match": {"value": doc_id}})],
        );

        // Check presence first so callers can distinguish not-found.
        let probe = json!({
            "filter": filter,
            "limit": 1,
            "with_payload": false,
            "with_vector": false,
        });
        let parsed = self
            .send(
                reqwest::Method::POST,
                &format!("/collections/{}/points/scroll", self.collection),
                Some(probe),
            )
            .await?;
        let present = parsed["result"]["points"]
            .as_array()
            .map(|a| !a.is_empty())
            .unwrap_or(false);
        if !present {
            return Ok(false);
        }

        self.send(
            reqwest::Method::POST,
            &format!("/collections/{}/points/delete?wait=true", self.collection),
            Some(json!({"filter": filter})),
        )
        .await?;
        Ok(true)
    }
}
