//! Query routing: decide how to answer before spending money on retrieval.
//!
//! Cheap local fast paths catch greetings and trivially short questions
//! without any model call. Everything else goes through a classification
//! call with a hard timeout; on any failure the router falls back to plain
//! single-pass retrieval, so routing can degrade but never break a request.

use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::generation::GenerationProvider;
use crate::models::QueryPlan;

/// Messages of at most two words matching these are answered as small talk.
const GREETINGS: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "thanks",
    "thank you",
    "good morning",
    "good afternoon",
    "good evening",
];

/// Short cries for help route to the capabilities answer.
const HELP_WORDS: &[&str] = &["help", "?"];

/// Questions under this many words are too thin to decompose or expand;
/// they go straight to retrieval.
const MIN_WORDS_FOR_CLASSIFICATION: usize = 4;

const MAX_SUB_QUERY_CHARS: usize = 500;

const CLASSIFY_PROMPT: &str = r#"You are a query router for a document question-answering system. Classify the user's message and reply with a single JSON object, nothing else:

{
  "skip_rag": <true if the message is about the assistant itself (what it can do, how to use it) rather than about document content>,
  "needs_decomposition": <true only if the message asks about several distinct documents or topics that need separate searches>,
  "sub_queries": [<if decomposing, one self-contained search query per document or topic, otherwise empty>],
  "expanded_query": "<the message rewritten as a self-contained search query, resolving pronouns and references using the conversation; use the message unchanged if it already stands alone>",
  "reasoning": "<one short sentence>"
}
"#;

#[derive(Clone)]
pub struct Router {
    provider: Arc<dyn GenerationProvider>,
    classify_timeout: Duration,
    max_sub_queries: usize,
}

impl Router {
    pub fn new(provider: Arc<dyn GenerationProvider>, config: &GenerationConfig) -> Self {
        Self {
            provider,
            classify_timeout: Duration::from_secs(config.classify_timeout_secs),
            max_sub_queries: config.max_sub_queries,
        }
    }

    /// Route a message. Infallible: classification problems degrade to
    /// single-pass retrieval with the original text.
    pub async fn route(&self, message: &str, history_context: &str) -> QueryPlan {
        if let Some(plan) = fast_path(message) {
            return plan;
        }

        if word_count(message) < MIN_WORDS_FOR_CLASSIFICATION {
            return QueryPlan::SingleDocQuestion {
                expanded_query: message.trim().to_string(),
            };
        }

        let prompt = if history_context.is_empty() {
            format!("{}\nMessage: {}", CLASSIFY_PROMPT, message.trim())
        } else {
            format!(
                "{}\nConversation so far:\n{}\n\nMessage: {}",
                CLASSIFY_PROMPT,
                history_context,
                message.trim()
            )
        };

        let decision =
            tokio::time::timeout(self.classify_timeout, self.provider.classify(&prompt)).await;

        match decision {
            Ok(Ok(json)) => self.plan_from_decision(message, &json),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "query classification failed, using plain retrieval");
                QueryPlan::SingleDocQuestion {
                    expanded_query: message.trim().to_string(),
                }
            }
            Err(_) => {
                tracing::warn!("query classification timed out, using plain retrieval");
                QueryPlan::SingleDocQuestion {
                    expanded_query: message.trim().to_string(),
                }
            }
        }
    }

    fn plan_from_decision(&self, message: &str, decision: &serde_json::Value) -> QueryPlan {
        if decision["skip_rag"].as_bool().unwrap_or(false) {
            return QueryPlan::Capabilities;
        }

        let expanded_query = decision["expanded_query"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(message.trim())
            .to_string();

        if decision["needs_decomposition"].as_bool().unwrap_or(false) {
            let sub_queries = sanitize_sub_queries(&decision["sub_queries"], self.max_sub_queries);
            // A single surviving sub-query is just the question again.
            if sub_queries.len() >= 2 {
                return QueryPlan::MultiDocQuestion {
                    expanded_query,
                    sub_queries,
                };
            }
        }

        QueryPlan::SingleDocQuestion { expanded_query }
    }
}

fn word_count(message: &str) -> usize {
    message.split_whitespace().count()
}

/// Local routing that never touches a model.
fn fast_path(message: &str) -> Option<QueryPlan> {
    if word_count(message) > 2 {
        return None;
    }
    let normalized: String = message
        .trim()
        .to_lowercase()
        .trim_end_matches(['!', '.', ','])
        .to_string();
    if GREETINGS.contains(&normalized.as_str()) {
        return Some(QueryPlan::Greeting);
    }
    if HELP_WORDS.contains(&normalized.as_str()) {
        return Some(QueryPlan::Capabilities);
    }
    None
}

fn sanitize_sub_queries(raw: &serde_json::Value, max: usize) -> Vec<String> {
    let Some(items) = raw.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.chars().take(MAX_SUB_QUERY_CHARS).collect::<String>())
        .take(max)
        .collect()
}
