//! Conversation persistence.
//!
//! Chat history lives in SQLite; the vector index never sees it. The store
//! is a best-effort collaborator: the orchestrator logs and swallows its
//! failures rather than failing an answer over history bookkeeping.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;

use crate::models::ChatTurn;

/// A cached conversation summary, with the turn count it was generated at so
/// callers can decide when it is stale.
#[derive(Debug, Clone)]
pub struct StoredSummary {
    pub summary: String,
    pub at_turn_count: u64,
}

/// A session can hold several conversations; turns and summaries are keyed
/// by both.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn append_turn(
        &self,
        session_id: &str,
        conversation_id: &str,
        role: &str,
        content: &str,
    ) -> Result<()>;

    /// The last `limit` turns in chronological order.
    async fn recent_turns(
        &self,
        session_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatTurn>>;

    async fn turn_count(&self, session_id: &str, conversation_id: &str) -> Result<u64>;

    async fn summary(
        &self,
        session_id: &str,
        conversation_id: &str,
    ) -> Result<Option<StoredSummary>>;

    async fn save_summary(
        &self,
        session_id: &str,
        conversation_id: &str,
        summary: &str,
        at_turn_count: u64,
    ) -> Result<()>;
}

// ============ SQLite implementation ============

pub struct SqliteChatStore {
    pool: SqlitePool,
}

impl SqliteChatStore {
    /// Open (creating if missing) the database at `path` and apply the
    /// schema. Idempotent.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_turns_conversation \
             ON turns(session_id, conversation_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS summaries (
                session_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                summary TEXT NOT NULL,
                at_turn_count INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (session_id, conversation_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn append_turn(
        &self,
        session_id: &str,
        conversation_id: &str,
        role: &str,
        content: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO turns (session_id, conversation_id, role, content, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(conversation_id)
        .bind(role)
        .bind(content)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_turns(
        &self,
        session_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatTurn>> {
        let rows = sqlx::query(
            "SELECT role, content FROM turns \
             WHERE session_id = ? AND conversation_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut turns: Vec<ChatTurn> = rows
            .into_iter()
            .map(|row| ChatTurn {
                role: row.get("role"),
                content: row.get("content"),
            })
            .collect();
        turns.reverse();
        Ok(turns)
    }

    async fn turn_count(&self, session_id: &str, conversation_id: &str) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM turns WHERE session_id = ? AND conversation_id = ?",
        )
        .bind(session_id)
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    async fn summary(
        &self,
        session_id: &str,
        conversation_id: &str,
    ) -> Result<Option<StoredSummary>> {
        let row = sqlx::query(
            "SELECT summary, at_turn_count FROM summaries \
             WHERE session_id = ? AND conversation_id = ?",
        )
        .bind(session_id)
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let at: i64 = row.get("at_turn_count");
            StoredSummary {
                summary: row.get("summary"),
                at_turn_count: at as u64,
            }
        }))
    }

    async fn save_summary(
        &self,
        session_id: &str,
        conversation_id: &str,
        summary: &str,
        at_turn_count: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO summaries (session_id, conversation_id, summary, at_turn_count, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(session_id, conversation_id) DO UPDATE SET
                summary = excluded.summary,
                at_turn_count = excluded.at_turn_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(conversation_id)
        .bind(summary)
        .bind(at_turn_count as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Render history for inclusion in a prompt: optional summary of older
/// turns, then the recent turns verbatim.
pub fn build_history_context(summary: Option<&str>, turns: &[ChatTurn]) -> String {
    let mut out = String::new();
    if let Some(summary) = summary {
        out.push_str("Summary of the earlier conversation:\n");
        out.push_str(summary);
        out.push_str("\n\n");
    }
    for turn in turns {
        let label = if turn.role == "assistant" {
            "Assistant"
        } else {
            "User"
        };
        out.push_str(label);
        out.push_str(": ");
        out.push_str(&turn.content);
        out.push('\n');
    }
    out.trim_end().to_string()
}
