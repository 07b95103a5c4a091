//! # docq CLI
//!
//! Command-line interface for the docq document question-answering pipeline.
//!
//! ## Usage
//!
//! ```bash
//! docq --config ./docq.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docq serve` | Start the HTTP API server |
//! | `docq ingest <file>` | Upload a document into a session |
//! | `docq ask "<question>"` | Ask a question and stream the answer |
//! | `docq docs list` | List the session's documents |
//! | `docq docs delete <doc_id>` | Delete a document and its chunks |
//!
//! ## Examples
//!
//! ```bash
//! # Start the server
//! docq serve --config ./docq.toml
//!
//! # Upload a document
//! docq ingest ./notes.txt --session alice
//!
//! # Ask about it
//! docq ask "what does the contract say about termination?" --session alice
//!
//! # Restrict a question to one document
//! docq ask "summarize this" --session alice --doc-id 3f2a...
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;

use docq::config::load_config;
use docq::models::{AnswerEvent, IngestOutcome};
use docq::orchestrator::{AskOutcome, Pipeline};
use docq::server::run_server;

/// docq — session-scoped document Q&A with grounded, cited, streamed answers.
#[derive(Parser)]
#[command(
    name = "docq",
    about = "docq — ask questions about your documents and get cited answers",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./docq.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server.
    ///
    /// Serves the chat (SSE), document, and health endpoints on the
    /// configured bind address.
    Serve,

    /// Upload a document into a session.
    ///
    /// The file is extracted, chunked, embedded, and indexed. Uploading
    /// identical content twice reports the existing document instead of
    /// re-indexing it.
    Ingest {
        /// Path to the document file.
        file: PathBuf,

        /// Session the document belongs to.
        #[arg(long)]
        session: String,
    },

    /// Ask a question and stream the answer to stdout.
    Ask {
        /// The question.
        question: String,

        /// Session whose documents to search.
        #[arg(long)]
        session: String,

        /// Conversation thread within the session. Defaults to the session.
        #[arg(long)]
        conversation: Option<String>,

        /// Restrict retrieval to these document ids (repeatable).
        #[arg(long = "doc-id")]
        doc_ids: Vec<String>,
    },

    /// Inspect or delete the session's documents.
    Docs {
        #[command(subcommand)]
        command: DocsCommands,
    },
}

#[derive(Subcommand)]
enum DocsCommands {
    /// List the session's documents.
    List {
        #[arg(long)]
        session: String,
    },

    /// Delete a document and all of its indexed chunks.
    Delete {
        doc_id: String,

        #[arg(long)]
        session: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docq=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            run_server(&config).await?;
        }
        Commands::Ingest { file, session } => {
            let bytes = std::fs::read(&file)?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| file.display().to_string());

            let pipeline = Pipeline::from_config(&config).await?;
            match pipeline.ingest(&session, &filename, &bytes).await? {
                IngestOutcome::Created(doc) => {
                    println!(
                        "Ingested {} as {} ({} chunks)",
                        doc.filename, doc.doc_id, doc.total_chunks
                    );
                }
                IngestOutcome::Duplicate { doc_id } => {
                    println!("Already ingested as {}", doc_id);
                }
            }
        }
        Commands::Ask {
            question,
            session,
            conversation,
            doc_ids,
        } => {
            let pipeline = Pipeline::from_config(&config).await?;
            let doc_ids = (!doc_ids.is_empty()).then_some(doc_ids);
            let conversation = conversation.unwrap_or_else(|| session.clone());

            match pipeline.ask(&session, &conversation, &question, doc_ids).await? {
                AskOutcome::RateLimited { retry_after } => {
                    eprintln!("Rate limited; retry in {}s", retry_after.as_secs().max(1));
                    std::process::exit(1);
                }
                AskOutcome::Answer(mut answer) => {
                    let mut stdout = std::io::stdout();
                    while let Some(event) = answer.next().await {
                        match event {
                            AnswerEvent::Sources { sources } if !sources.is_empty() => {
                                eprintln!("Sources:");
                                for (i, s) in sources.iter().enumerate() {
                                    match s.page_number {
                                        Some(page) => eprintln!(
                                            "  [{}] {} (page {}, score {:.4})",
                                            i + 1,
                                            s.filename,
                                            page,
                                            s.relevance_score
                                        ),
                                        None => eprintln!(
                                            "  [{}] {} (score {:.4})",
                                            i + 1,
                                            s.filename,
                                            s.relevance_score
                                        ),
                                    }
                                }
                                eprintln!();
                            }
                            AnswerEvent::Sources { .. } => {}
                            AnswerEvent::Content { content } => {
                                print!("{}", content);
                                stdout.flush()?;
                            }
                            AnswerEvent::Done => {
                                println!();
                            }
                            AnswerEvent::Error { error } => {
                                println!();
                                eprintln!("Error: {}", error);
                                std::process::exit(1);
                            }
                        }
                    }
                }
            }
        }
        Commands::Docs { command } => {
            let pipeline = Pipeline::from_config(&config).await?;
            match command {
                DocsCommands::List { session } => {
                    let docs = pipeline.list_documents(&session).await?;
                    if docs.is_empty() {
                        println!("No documents in session {}", session);
                    }
                    for doc in docs {
                        println!(
                            "{}  {}  {} chunks  uploaded {}",
                            doc.doc_id,
                            doc.filename,
                            doc.total_chunks,
                            doc.uploaded_at.format("%Y-%m-%d %H:%M")
                        );
                    }
                }
                DocsCommands::Delete { doc_id, session } => {
                    if pipeline.delete_document(&session, &doc_id).await? {
                        println!("Deleted {}", doc_id);
                    } else {
                        eprintln!("Document {} not found", doc_id);
                        std::process::exit(1);
                    }
                }
            }
        }
    }

    Ok(())
}
