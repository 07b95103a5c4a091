//! Core data models used throughout the pipeline.
//!
//! These types represent the documents, chunks, routed query plans, and
//! streamed answer events that flow through ingestion and question answering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata for a stored document. Immutable once ingested except for
/// deletion, which cascades to all of its chunks in the vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub session_id: String,
    pub filename: String,
    pub document_type: String,
    /// Stable hash of the normalized text content, used for duplicate
    /// detection on re-upload.
    pub fingerprint: String,
    pub total_chunks: usize,
    pub page_count: Option<u32>,
    pub uploaded_at: DateTime<Utc>,
}

/// A bounded span of a document's text, the atomic unit of embedding and
/// retrieval. Identified by `(doc_id, chunk_index)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub chunk_index: usize,
    pub text: String,
    /// Character offsets into the source text.
    pub start_char: usize,
    pub end_char: usize,
    pub page_number: Option<u32>,
}

/// A chunk returned from vector search, with its similarity score and the
/// document metadata needed to cite it.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub doc_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub filename: String,
    pub page_number: Option<u32>,
    pub score: f32,
}

/// A cited passage attached to an answer, as sent to the client in the
/// `sources` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePassage {
    /// Passage text, truncated to 500 characters for display.
    pub text: String,
    pub filename: String,
    pub page_number: Option<u32>,
    pub chunk_index: usize,
    /// Similarity score rounded to 4 decimal places.
    pub relevance_score: f32,
}

impl SourcePassage {
    pub fn from_chunk(chunk: &ScoredChunk) -> Self {
        let text = if chunk.text.chars().count() > 500 {
            let truncated: String = chunk.text.chars().take(500).collect();
            format!("{}...", truncated)
        } else {
            chunk.text.clone()
        };
        Self {
            text,
            filename: chunk.filename.clone(),
            page_number: chunk.page_number,
            chunk_index: chunk.chunk_index,
            relevance_score: (chunk.score * 10_000.0).round() / 10_000.0,
        }
    }
}

/// One turn of a conversation, as persisted in the chat store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    /// `"user"` or `"assistant"`.
    pub role: String,
    pub content: String,
}

/// The router's classification of an inbound question.
///
/// RAG-bound variants always carry a non-empty `expanded_query`: the question
/// rewritten as a self-contained query when it depended on conversation
/// context, or the original text unchanged otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    /// Small talk. Answered with a canned response, no external calls.
    Greeting,
    /// A question about the assistant itself. Answered without retrieval.
    Capabilities,
    /// A question answerable from one retrieval pass.
    SingleDocQuestion { expanded_query: String },
    /// A question spanning multiple documents, decomposed into one
    /// sub-query per referenced document.
    MultiDocQuestion {
        expanded_query: String,
        sub_queries: Vec<String>,
    },
}

impl QueryPlan {
    /// Whether this plan requires retrieval before generation.
    pub fn needs_retrieval(&self) -> bool {
        matches!(
            self,
            QueryPlan::SingleDocQuestion { .. } | QueryPlan::MultiDocQuestion { .. }
        )
    }
}

/// One event of a streamed answer.
///
/// The stream contract is: exactly one `Sources` event first (possibly with an
/// empty list), zero or more `Content` deltas, then exactly one of `Done` or
/// `Error`. A cancelled stream may end without a terminal event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerEvent {
    Sources { sources: Vec<SourcePassage> },
    Content { content: String },
    Done,
    Error { error: String },
}

/// Outcome of an ingest call. Re-uploading identical content is a
/// first-class outcome, not an error.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Created(Document),
    /// The session already holds a document with the same content
    /// fingerprint; chunking and embedding were skipped.
    Duplicate { doc_id: String },
}
