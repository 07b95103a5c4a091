//! # docq
//!
//! A session-scoped document question-answering pipeline: upload text
//! documents, ask questions about them, and get grounded, cited answers
//! streamed back token by token.
//!
//! The pipeline in one pass: extract and normalize text, fingerprint it to
//! catch duplicate uploads, chunk it on natural boundaries, embed the chunks,
//! and index them scoped to the session. Questions are routed (greeting,
//! capabilities, single- or multi-document), retrieved against the index
//! with a relevance threshold, and answered by a generation provider that is
//! instructed to use only the retrieved excerpts.
//!
//! Providers, the vector index, the chat store, and text extraction are all
//! trait seams, so any piece can be swapped or mocked.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use docq::config::load_config;
//! use docq::orchestrator::{AskOutcome, Pipeline};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = load_config(std::path::Path::new("docq.toml"))?;
//! let pipeline = Pipeline::from_config(&config).await?;
//!
//! pipeline.ingest("session-1", "notes.txt", b"The launch is in May.").await?;
//!
//! if let AskOutcome::Answer(mut answer) =
//!     pipeline.ask("session-1", "chat-1", "When is the launch?", None).await?
//! {
//!     while let Some(event) = answer.next().await {
//!         println!("{:?}", event);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod chat_store;
pub mod chunker;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod generation;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod rate_limit;
pub mod retriever;
pub mod router;
pub mod server;
pub mod vector_index;
