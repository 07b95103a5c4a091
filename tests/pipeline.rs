//! End-to-end pipeline tests over mock providers and an in-memory index.
//!
//! The embedding mock projects text onto a small keyword vocabulary, so
//! similarity behaves sensibly: a question about "launch" actually matches
//! chunks that mention launches.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use docq::chat_store::{ChatStore, SqliteChatStore};
use docq::config::{
    ChunkingConfig, Config, DbConfig, EmbeddingConfig, GenerationConfig, HistoryConfig,
    IndexConfig, RateLimitConfig, RetrievalConfig, ServerConfig,
};
use docq::embedding::{cosine_similarity, EmbeddingClient, EmbeddingProvider};
use docq::error::{PipelineError, Result};
use docq::extract::PlainTextExtractor;
use docq::generation::GenerationProvider;
use docq::models::{AnswerEvent, Document, IngestOutcome, ScoredChunk};
use docq::orchestrator::{AnswerStream, AskOutcome, Pipeline};
use docq::vector_index::{IndexPoint, VectorIndex};

// ============ Mock embedding provider ============

const VOCAB: &[&str] = &[
    "launch", "budget", "timeline", "alpha", "beta", "contract", "termination", "may",
];

struct KeywordEmbedder;

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let lower = text.to_lowercase();
                VOCAB
                    .iter()
                    .map(|word| lower.matches(word).count() as f32)
                    .collect()
            })
            .collect())
    }

    fn dims(&self) -> usize {
        VOCAB.len()
    }
}

// ============ Mock generation provider ============

struct MockGenerator {
    classify_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    complete_calls: AtomicUsize,
    classify_reply: Mutex<serde_json::Value>,
    fail_classify: bool,
    deltas: Vec<String>,
    endless: bool,
    stream_stopped: Arc<AtomicBool>,
}

impl MockGenerator {
    fn new() -> Self {
        Self {
            classify_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            complete_calls: AtomicUsize::new(0),
            classify_reply: Mutex::new(serde_json::json!({
                "skip_rag": false,
                "needs_decomposition": false,
                "sub_queries": [],
            })),
            fail_classify: false,
            deltas: vec!["The launch ".to_string(), "is in May.".to_string()],
            endless: false,
            stream_stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    fn set_classify_reply(&self, reply: serde_json::Value) {
        *self.classify_reply.lock().unwrap() = reply;
    }
}

#[async_trait]
impl GenerationProvider for MockGenerator {
    async fn classify(&self, _prompt: &str) -> Result<serde_json::Value> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_classify {
            return Err(PipelineError::permanent("generation", "mock classify failure"));
        }
        Ok(self.classify_reply.lock().unwrap().clone())
    }

    async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        Ok("A short summary of the conversation.".to_string())
    }

    async fn stream(&self, _system: &str, _prompt: &str) -> Result<mpsc::Receiver<Result<String>>> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(4);
        let deltas = self.deltas.clone();
        let endless = self.endless;
        let stopped = self.stream_stopped.clone();
        tokio::spawn(async move {
            if endless {
                loop {
                    if tx.send(Ok("delta ".to_string())).await.is_err() {
                        stopped.store(true, Ordering::SeqCst);
                        return;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
            }
            for delta in deltas {
                if tx.send(Ok(delta)).await.is_err() {
                    stopped.store(true, Ordering::SeqCst);
                    return;
                }
            }
        });
        Ok(rx)
    }
}

// ============ In-memory vector index ============

#[derive(Default)]
struct InMemoryIndex {
    points: Mutex<Vec<IndexPoint>>,
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn ensure_ready(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, points: Vec<IndexPoint>) -> Result<()> {
        self.points.lock().unwrap().extend(points);
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        session_id: &str,
        doc_ids: Option<&[String]>,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let points = self.points.lock().unwrap();
        let mut hits: Vec<ScoredChunk> = points
            .iter()
            .filter(|p| p.payload.session_id == session_id)
            .filter(|p| doc_ids.map_or(true, |ids| ids.contains(&p.payload.doc_id)))
            .map(|p| ScoredChunk {
                doc_id: p.payload.doc_id.clone(),
                chunk_index: p.payload.chunk_index,
                text: p.payload.text.clone(),
                filename: p.payload.filename.clone(),
                page_number: p.payload.page_number,
                score: cosine_similarity(vector, &p.vector),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn find_fingerprint(
        &self,
        session_id: &str,
        fingerprint: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .points
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.payload.session_id == session_id && p.payload.fingerprint == fingerprint)
            .map(|p| p.payload.doc_id.clone()))
    }

    async fn session_documents(&self, session_id: &str) -> Result<Vec<Document>> {
        let points = self.points.lock().unwrap();
        let mut docs: Vec<Document> = Vec::new();
        for p in points.iter().filter(|p| p.payload.session_id == session_id) {
            match docs.iter_mut().find(|d| d.doc_id == p.payload.doc_id) {
                Some(doc) => doc.total_chunks += 1,
                None => docs.push(Document {
                    doc_id: p.payload.doc_id.clone(),
                    session_id: p.payload.session_id.clone(),
                    filename: p.payload.filename.clone(),
                    document_type: p.payload.document_type.clone(),
                    fingerprint: p.payload.fingerprint.clone(),
                    total_chunks: 1,
                    page_count: None,
                    uploaded_at: p.payload.uploaded_at,
                }),
            }
        }
        Ok(docs)
    }

    async fn delete_document(&self, session_id: &str, doc_id: &str) -> Result<bool> {
        let mut points = self.points.lock().unwrap();
        let before = points.len();
        points.retain(|p| {
            !(p.payload.session_id == session_id && p.payload.doc_id == doc_id)
        });
        Ok(points.len() < before)
    }
}

// ============ Test harness ============

struct Harness {
    pipeline: Pipeline,
    generator: Arc<MockGenerator>,
    chat_store: Arc<SqliteChatStore>,
    _dir: tempfile::TempDir,
}

fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        db: DbConfig {
            path: dir.path().join("chat.sqlite"),
        },
        chunking: ChunkingConfig {
            chunk_size: 200,
            chunk_overlap: 40,
            max_chunks_per_doc: 100,
        },
        retrieval: RetrievalConfig {
            top_k: 5,
            score_threshold: 0.34,
            decomposition_top_k: 5,
        },
        embedding: EmbeddingConfig {
            base_url: "http://unused".to_string(),
            model: "keyword".to_string(),
            dims: VOCAB.len(),
            api_key_env: "UNUSED".to_string(),
            batch_size: 64,
            max_retries: 1,
            timeout_secs: 5,
            cache_enabled: false,
            cache_ttl_secs: 60,
        },
        generation: GenerationConfig {
            base_url: "http://unused".to_string(),
            model: "mock".to_string(),
            classify_model: None,
            api_key_env: "UNUSED".to_string(),
            max_tokens: 256,
            temperature: 0.0,
            max_retries: 1,
            timeout_secs: 5,
            classify_timeout_secs: 5,
            max_sub_queries: 5,
        },
        index: IndexConfig {
            url: "http://unused".to_string(),
            api_key_env: "UNUSED".to_string(),
            collection: "test".to_string(),
            upsert_batch_size: 100,
            scroll_limit: 100,
            timeout_secs: 5,
        },
        rate_limit: RateLimitConfig {
            requests_per_minute: 100,
            requests_per_hour: 1000,
        },
        history: HistoryConfig {
            context_turns: 10,
            summary_after_turns: 10,
            summary_refresh_turns: 5,
        },
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
    }
}

async fn harness_with(generator: MockGenerator, adjust: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    adjust(&mut config);

    let embeddings = Arc::new(EmbeddingClient::new(
        Arc::new(KeywordEmbedder),
        &config.embedding,
    ));
    let generator = Arc::new(generator);
    let chat_store = Arc::new(SqliteChatStore::open(&config.db.path).await.unwrap());

    let pipeline = Pipeline::new(
        embeddings,
        Arc::new(InMemoryIndex::default()),
        generator.clone(),
        chat_store.clone(),
        Arc::new(PlainTextExtractor),
        &config,
    );
    Harness {
        pipeline,
        generator,
        chat_store,
        _dir: dir,
    }
}

async fn harness() -> Harness {
    harness_with(MockGenerator::new(), |_| {}).await
}

async fn collect(mut answer: AnswerStream) -> Vec<AnswerEvent> {
    let mut events = Vec::new();
    while let Some(event) = answer.next().await {
        events.push(event);
    }
    events
}

async fn ask_events(h: &Harness, session: &str, message: &str) -> Vec<AnswerEvent> {
    match h.pipeline.ask(session, "c1", message, None).await.unwrap() {
        AskOutcome::Answer(answer) => collect(answer).await,
        AskOutcome::RateLimited { .. } => panic!("unexpected rate limit"),
    }
}

fn full_content(events: &[AnswerEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            AnswerEvent::Content { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

// ============ Tests ============

#[tokio::test]
async fn test_ingest_then_ask_streams_cited_answer() {
    let h = harness().await;
    h.pipeline
        .ingest("alice", "plan.txt", b"The launch is scheduled for May. The launch budget is approved.")
        .await
        .unwrap();

    let events = ask_events(&h, "alice", "when is the launch happening").await;

    // Contract: sources first, then content, then done.
    match &events[0] {
        AnswerEvent::Sources { sources } => {
            assert!(!sources.is_empty());
            assert_eq!(sources[0].filename, "plan.txt");
        }
        other => panic!("first event must be sources, got {:?}", other),
    }
    assert!(matches!(events.last(), Some(AnswerEvent::Done)));
    assert_eq!(full_content(&events), "The launch is in May.");
    assert_eq!(h.generator.stream_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let h = harness().await;
    h.pipeline
        .ingest("alice", "plan.txt", b"The launch is in May.")
        .await
        .unwrap();

    let events = ask_events(&h, "bob", "when is the launch happening").await;

    match &events[0] {
        AnswerEvent::Sources { sources } => assert!(sources.is_empty()),
        other => panic!("first event must be sources, got {:?}", other),
    }
    // Bob has no documents, so no retrieval or generation runs for him.
    assert!(full_content(&events).contains("haven't uploaded"));
    assert_eq!(h.generator.stream_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_duplicate_upload_is_reported_not_reindexed() {
    let h = harness().await;
    let doc_id = match h
        .pipeline
        .ingest("alice", "plan.txt", b"The launch is in May.")
        .await
        .unwrap()
    {
        IngestOutcome::Created(doc) => doc.doc_id,
        other => panic!("expected created, got {:?}", other),
    };

    // Same content, different filename and whitespace.
    match h
        .pipeline
        .ingest("alice", "copy.txt", b"  The   LAUNCH is in May.  ")
        .await
        .unwrap()
    {
        IngestOutcome::Duplicate { doc_id: existing } => assert_eq!(existing, doc_id),
        other => panic!("expected duplicate, got {:?}", other),
    }

    let docs = h.pipeline.list_documents("alice").await.unwrap();
    assert_eq!(docs.len(), 1);
}

#[tokio::test]
async fn test_irrelevant_question_degrades_without_generation() {
    let h = harness().await;
    h.pipeline
        .ingest("alice", "plan.txt", b"The launch is in May.")
        .await
        .unwrap();

    // No vocabulary overlap at all: every score is below the threshold.
    let events = ask_events(&h, "alice", "what color is the office carpet").await;

    match &events[0] {
        AnswerEvent::Sources { sources } => assert!(sources.is_empty()),
        other => panic!("first event must be sources, got {:?}", other),
    }
    assert!(full_content(&events).contains("couldn't find"));
    assert_eq!(h.generator.stream_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_greeting_answers_without_any_model_call() {
    let h = harness().await;
    let events = ask_events(&h, "alice", "hi").await;

    assert!(matches!(&events[0], AnswerEvent::Sources { sources } if sources.is_empty()));
    assert!(matches!(events.last(), Some(AnswerEvent::Done)));
    assert!(!full_content(&events).is_empty());
    assert_eq!(h.generator.classify_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.generator.stream_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_classification_failure_still_answers() {
    let mut generator = MockGenerator::new();
    generator.fail_classify = true;
    let h = harness_with(generator, |_| {}).await;

    h.pipeline
        .ingest("alice", "plan.txt", b"The launch is in May.")
        .await
        .unwrap();

    let events = ask_events(&h, "alice", "when is the launch happening exactly").await;
    assert!(matches!(&events[0], AnswerEvent::Sources { sources } if !sources.is_empty()));
    assert!(matches!(events.last(), Some(AnswerEvent::Done)));
}

#[tokio::test]
async fn test_decomposed_question_pulls_from_both_documents() {
    let h = harness().await;
    h.pipeline
        .ingest("alice", "alpha.txt", b"The alpha budget was doubled this quarter.")
        .await
        .unwrap();
    h.pipeline
        .ingest("alice", "beta.txt", b"The beta timeline slipped by two weeks.")
        .await
        .unwrap();

    h.generator.set_classify_reply(serde_json::json!({
        "skip_rag": false,
        "needs_decomposition": true,
        "sub_queries": ["alpha budget", "beta timeline"],
        "expanded_query": "compare the alpha budget and the beta timeline",
    }));

    let events = ask_events(
        &h,
        "alice",
        "compare the budget and timeline across both projects",
    )
    .await;

    match &events[0] {
        AnswerEvent::Sources { sources } => {
            let files: std::collections::HashSet<&str> =
                sources.iter().map(|s| s.filename.as_str()).collect();
            assert!(files.contains("alpha.txt"), "missing alpha source: {:?}", files);
            assert!(files.contains("beta.txt"), "missing beta source: {:?}", files);
        }
        other => panic!("first event must be sources, got {:?}", other),
    }
    assert!(matches!(events.last(), Some(AnswerEvent::Done)));
}

#[tokio::test]
async fn test_doc_id_allowlist_restricts_retrieval() {
    let h = harness().await;
    let alpha_id = match h
        .pipeline
        .ingest("alice", "alpha.txt", b"The alpha launch is in May.")
        .await
        .unwrap()
    {
        IngestOutcome::Created(doc) => doc.doc_id,
        other => panic!("expected created, got {:?}", other),
    };
    h.pipeline
        .ingest("alice", "beta.txt", b"The beta launch is in June.")
        .await
        .unwrap();

    let outcome = h
        .pipeline
        .ask(
            "alice",
            "c1",
            "when is the launch happening",
            Some(vec![alpha_id]),
        )
        .await
        .unwrap();
    let events = match outcome {
        AskOutcome::Answer(answer) => collect(answer).await,
        AskOutcome::RateLimited { .. } => panic!("unexpected rate limit"),
    };

    match &events[0] {
        AnswerEvent::Sources { sources } => {
            assert!(!sources.is_empty());
            assert!(sources.iter().all(|s| s.filename == "alpha.txt"));
        }
        other => panic!("first event must be sources, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rate_limit_denies_and_reports_retry_after() {
    let h = harness_with(MockGenerator::new(), |config| {
        config.rate_limit.requests_per_minute = 2;
    })
    .await;

    for _ in 0..2 {
        let events = ask_events(&h, "alice", "hi").await;
        assert!(matches!(events.last(), Some(AnswerEvent::Done)));
    }
    match h.pipeline.ask("alice", "c1", "hi", None).await.unwrap() {
        AskOutcome::RateLimited { retry_after } => {
            assert!(retry_after.as_secs() <= 60);
        }
        AskOutcome::Answer(_) => panic!("third request should be rate limited"),
    }
}

#[tokio::test]
async fn test_delete_document_removes_it_from_answers() {
    let h = harness().await;
    let doc_id = match h
        .pipeline
        .ingest("alice", "plan.txt", b"The launch is in May.")
        .await
        .unwrap()
    {
        IngestOutcome::Created(doc) => doc.doc_id,
        other => panic!("expected created, got {:?}", other),
    };

    assert!(h.pipeline.delete_document("alice", &doc_id).await.unwrap());
    assert!(h.pipeline.list_documents("alice").await.unwrap().is_empty());
    // Deleting again reports not-found.
    assert!(!h.pipeline.delete_document("alice", &doc_id).await.unwrap());

    let events = ask_events(&h, "alice", "when is the launch happening").await;
    assert!(full_content(&events).contains("haven't uploaded"));
}

#[tokio::test]
async fn test_cancellation_stops_generation() {
    let mut generator = MockGenerator::new();
    generator.endless = true;
    let h = harness_with(generator, |_| {}).await;

    h.pipeline
        .ingest("alice", "plan.txt", b"The launch is in May.")
        .await
        .unwrap();

    let mut answer = match h
        .pipeline
        .ask("alice", "c1", "when is the launch happening", None)
        .await
        .unwrap()
    {
        AskOutcome::Answer(answer) => answer,
        AskOutcome::RateLimited { .. } => panic!("unexpected rate limit"),
    };

    // Read the sources event and a couple of deltas, then cancel mid-answer.
    assert!(matches!(answer.next().await, Some(AnswerEvent::Sources { .. })));
    assert!(matches!(answer.next().await, Some(AnswerEvent::Content { .. })));
    answer.cancel();

    // The stream drains any buffered events and ends without Done.
    let drained = tokio::time::timeout(std::time::Duration::from_secs(5), collect(answer))
        .await
        .expect("cancelled stream must terminate");
    assert!(!drained.iter().any(|e| matches!(e, AnswerEvent::Done)));

    // The provider-side stream notices the dropped receiver and stops.
    let mut stopped = false;
    for _ in 0..100 {
        if h.generator.stream_stopped.load(Ordering::SeqCst) {
            stopped = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(stopped, "provider stream was not stopped after cancellation");

    // The partial answer made it into history before the worker unwound.
    let turns = h.chat_store.recent_turns("alice", "c1", 10).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, "user");
    assert_eq!(turns[1].role, "assistant");
    assert!(turns[1].content.contains("delta"));
}

#[tokio::test]
async fn test_long_conversation_generates_summary() {
    let h = harness().await;
    h.pipeline
        .ingest("alice", "plan.txt", b"The launch is in May. The launch budget is approved.")
        .await
        .unwrap();

    // Each answered question stores two turns; six of them crosses the
    // ten-turn summarization threshold.
    for _ in 0..6 {
        let events = ask_events(&h, "alice", "when is the launch happening").await;
        assert!(matches!(events.last(), Some(AnswerEvent::Done)));
    }

    // The worker persists and summarizes after sending Done, so give it a
    // moment to catch up.
    for _ in 0..100 {
        if h.generator.complete_calls.load(Ordering::SeqCst) >= 1 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("no summary was generated after a long conversation");
}

#[tokio::test]
async fn test_empty_message_rejected() {
    let h = harness().await;
    let err = h.pipeline.ask("alice", "c1", "   ", None).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));

    let err = h.pipeline.ask("", "c1", "question", None).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));

    let err = h.pipeline.ask("alice", "", "question", None).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_oversized_document_rejected() {
    let h = harness_with(MockGenerator::new(), |config| {
        config.chunking.max_chunks_per_doc = 2;
    })
    .await;

    let big = "The launch budget timeline. ".repeat(100);
    let err = h
        .pipeline
        .ingest("alice", "big.txt", big.as_bytes())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));
    assert!(h.pipeline.list_documents("alice").await.unwrap().is_empty());
}
