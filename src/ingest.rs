//! Document ingestion: extract, fingerprint, chunk, embed, index.
//!
//! Re-uploading content a session already holds short-circuits before any
//! chunking or embedding and reports the existing document. Deletion removes
//! every chunk of the document from the index in one filtered call.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::chunker::chunk_text;
use crate::config::ChunkingConfig;
use crate::embedding::EmbeddingClient;
use crate::error::{PipelineError, Result};
use crate::extract::TextExtractor;
use crate::fingerprint::content_fingerprint;
use crate::models::{Document, IngestOutcome};
use crate::vector_index::{ChunkPayload, IndexPoint, VectorIndex};

pub struct Ingestor {
    embeddings: Arc<EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    extractor: Arc<dyn TextExtractor>,
    chunking: ChunkingConfig,
}

impl Ingestor {
    pub fn new(
        embeddings: Arc<EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        extractor: Arc<dyn TextExtractor>,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            embeddings,
            index,
            extractor,
            chunking,
        }
    }

    pub async fn ingest(
        &self,
        session_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<IngestOutcome> {
        if session_id.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("session_id is required".into()));
        }
        if filename.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("filename is required".into()));
        }
        if !self.extractor.supports(filename) {
            return Err(PipelineError::InvalidRequest(format!(
                "unsupported document type: {}",
                filename
            )));
        }

        let extracted = self.extractor.extract(filename, bytes)?;
        let fingerprint = content_fingerprint(&extracted.text);

        if let Some(doc_id) = self.index.find_fingerprint(session_id, &fingerprint).await? {
            tracing::info!(session_id, filename, doc_id, "duplicate upload, skipping");
            return Ok(IngestOutcome::Duplicate { doc_id });
        }

        let chunks = chunk_text(
            &extracted.text,
            extracted.page_count,
            self.chunking.chunk_size,
            self.chunking.chunk_overlap,
        );
        if chunks.is_empty() {
            return Err(PipelineError::InvalidRequest(format!(
                "no indexable content in {}",
                filename
            )));
        }
        if chunks.len() > self.chunking.max_chunks_per_doc {
            return Err(PipelineError::InvalidRequest(format!(
                "document too large: {} chunks exceeds the {} chunk limit",
                chunks.len(),
                self.chunking.max_chunks_per_doc
            )));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embeddings.embed_document_chunks(filename, &texts).await?;

        let doc_id = Uuid::new_v4().to_string();
        let uploaded_at = Utc::now();
        let document_type = document_type_for(filename);

        let points: Vec<IndexPoint> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexPoint {
                id: Uuid::new_v4().to_string(),
                vector,
                payload: ChunkPayload {
                    doc_id: doc_id.clone(),
                    session_id: session_id.to_string(),
                    chunk_index: chunk.chunk_index,
                    text: chunk.text.clone(),
                    page_number: chunk.page_number,
                    filename: filename.to_string(),
                    document_type: document_type.clone(),
                    fingerprint: fingerprint.clone(),
                    uploaded_at,
                },
            })
            .collect();

        let total_chunks = points.len();
        self.index.upsert(points).await?;
        tracing::info!(session_id, filename, doc_id, total_chunks, "document ingested");

        Ok(IngestOutcome::Created(Document {
            doc_id,
            session_id: session_id.to_string(),
            filename: filename.to_string(),
            document_type,
            fingerprint,
            total_chunks,
            page_count: extracted.page_count,
            uploaded_at,
        }))
    }

    pub async fn list_documents(&self, session_id: &str) -> Result<Vec<Document>> {
        if session_id.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("session_id is required".into()));
        }
        self.index.session_documents(session_id).await
    }

    /// Returns whether the document existed.
    pub async fn delete_document(&self, session_id: &str, doc_id: &str) -> Result<bool> {
        if session_id.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("session_id is required".into()));
        }
        let deleted = self.index.delete_document(session_id, doc_id).await?;
        if deleted {
            tracing::info!(session_id, doc_id, "document deleted");
        }
        Ok(deleted)
    }
}

fn document_type_for(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_else(|| "text".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_type_from_extension() {
        assert_eq!(document_type_for("report.TXT"), "txt");
        assert_eq!(document_type_for("notes.md"), "md");
        assert_eq!(document_type_for("LICENSE"), "text");
    }
}
