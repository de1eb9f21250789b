//! LLM provider trait and common types.
//!
//! The gateway consumes exactly one provider shape: a list of chat messages
//! in, and either a text answer or a `query` tool call out. Vendor protocol
//! details live behind [`LlmProvider`] implementations; the orchestrator
//! only sees [`LlmReply`]. Transient failures (5xx, network) are retried
//! with exponential backoff bounded by the request's remaining budget.

pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Base delay for the retry backoff; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Maximum retries for transient provider failures.
const MAX_RETRIES: u32 = 2;

/// Role of a message in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the conversation sent to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
        }
    }
}

/// A request to the provider.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Whether the `query` tool schema is offered to the model.
    pub allow_tool_calls: bool,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

/// What the model returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmReply {
    /// A final text answer.
    Answer { text: String },
    /// A request to run a data query before continuing:
    /// `{tool: "query", arguments: {question, source}}`.
    ToolCall { question: String, source: String },
}

/// Trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<LlmReply, ProviderError>;
}

/// Call the provider, retrying transient failures.
///
/// Up to two retries with exponential backoff; a retry is skipped when the
/// backoff would not fit in `remaining_budget`. Non-transient errors return
/// immediately.
pub async fn complete_with_retry(
    provider: &dyn LlmProvider,
    request: CompletionRequest,
    remaining_budget: Duration,
) -> Result<LlmReply, ProviderError> {
    let started = tokio::time::Instant::now();
    let mut attempt: u32 = 0;

    loop {
        match provider.complete(request.clone()).await {
            Ok(reply) => return Ok(reply),
            Err(err) if err.is_transient() && attempt < MAX_RETRIES => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                let elapsed = started.elapsed();
                if elapsed + delay >= remaining_budget {
                    return Err(err);
                }
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying provider call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
