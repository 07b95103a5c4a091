//! Retrieval: embed the query, search the index, and shape the results.
//!
//! Results are filtered by a relevance threshold, deduplicated, and ordered
//! deterministically (score descending, then doc_id, then chunk_index) so the
//! same corpus and query always produce the same evidence set.

use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::models::ScoredChunk;
use crate::vector_index::VectorIndex;

pub struct Retriever {
    embeddings: Arc<EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        embeddings: Arc<EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embeddings,
            index,
            config,
        }
    }

    /// Single-pass retrieval for one query.
    pub async fn retrieve(
        &self,
        query: &str,
        session_id: &str,
        doc_ids: Option<&[String]>,
    ) -> Result<Vec<ScoredChunk>> {
        let vector = self.embeddings.embed_query(query).await?;
        // Over-fetch so threshold filtering and dedup still leave top_k.
        let candidates = self
            .index
            .search(&vector, session_id, doc_ids, self.config.top_k * 2)
            .await?;
        Ok(rank_and_filter(
            candidates,
            self.config.score_threshold,
            self.config.top_k,
        ))
    }

    /// Decomposed retrieval: search once per sub-query plus once for the
    /// original question, then merge by chunk identity keeping each chunk's
    /// best score. The merged set is capped at twice the normal top_k.
    pub async fn retrieve_decomposed(
        &self,
        original: &str,
        sub_queries: &[String],
        session_id: &str,
        doc_ids: Option<&[String]>,
    ) -> Result<Vec<ScoredChunk>> {
        let mut queries: Vec<String> = vec![original.to_string()];
        queries.extend(sub_queries.iter().cloned());
        let vectors = self.embeddings.embed_texts(&queries).await?;

        let mut merged: Vec<ScoredChunk> = Vec::new();
        for vector in &vectors {
            let hits = self
                .index
                .search(vector, session_id, doc_ids, self.config.decomposition_top_k)
                .await?;
            for hit in hits {
                match merged
                    .iter_mut()
                    .find(|c| c.doc_id == hit.doc_id && c.chunk_index == hit.chunk_index)
                {
                    Some(existing) => {
                        if hit.score > existing.score {
                            existing.score = hit.score;
                        }
                    }
                    None => merged.push(hit),
                }
            }
        }

        Ok(rank_and_filter(
            merged,
            self.config.score_threshold,
            self.config.top_k * 2,
        ))
    }
}

/// Drop chunks below the threshold, deduplicate identical texts keeping the
/// best-scoring copy, order deterministically, and cap at `limit`.
pub fn rank_and_filter(
    mut chunks: Vec<ScoredChunk>,
    threshold: f32,
    limit: usize,
) -> Vec<ScoredChunk> {
    chunks.retain(|c| c.score >= threshold);

    chunks.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
            .then_with(|| a.chunk_index.cmp(&b.chunk_index))
    });

    // After sorting, the first occurrence of a text is its best-scoring copy.
    let mut seen_texts = std::collections::HashSet::new();
    chunks.retain(|c| seen_texts.insert(c.text.clone()));

    chunks.truncate(limit);
    chunks
}
