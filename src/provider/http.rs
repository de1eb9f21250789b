//! HTTP chat-completions provider.
//!
//! Speaks the common `/v1/chat/completions` JSON shape (non-streaming) and
//! maps the response to [`LlmReply`]: plain message content becomes an
//! answer, a `query` tool call becomes [`LlmReply::ToolCall`]. Status codes
//! classify failures: 5xx and transport errors are transient, everything
//! else is fatal for the request.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ProviderError;

use super::{ChatRole, CompletionRequest, LlmProvider, LlmReply};

/// JSON schema for the single tool the gateway offers to models.
pub fn query_tool_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": "query",
            "description": "Look up data from an approved data source. \
                            Ask in natural language; name the source.",
            "parameters": {
                "type": "object",
                "properties": {
                    "question": { "type": "string" },
                    "source": { "type": "string" }
                },
                "required": ["question", "source"]
            }
        }
    })
}

/// Chat-completions HTTP provider.
#[derive(Debug)]
pub struct HttpProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl HttpProvider {
    pub fn new(api_key: String, base_url: String) -> Result<Self, ProviderError> {
        if api_key.trim().is_empty() {
            return Err(ProviderError::Fatal("API key must not be empty".into()));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| ProviderError::Fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Build the JSON body for the chat-completions endpoint.
    fn build_body(&self, request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                    ChatRole::Tool => "tool",
                };
                json!({ "role": role, "content": msg.content })
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
        });

        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if request.allow_tool_calls {
            body["tools"] = json!([query_tool_schema()]);
        }

        body
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<LlmReply, ProviderError> {
        let body = self.build_body(&request);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable>".to_string());
            let message = format!("API returned {status}: {body}");
            return if status.is_server_error() {
                Err(ProviderError::Transient(message))
            } else {
                Err(ProviderError::Fatal(message))
            };
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("malformed response body: {e}")))?;
        parse_reply(&parsed)
    }
}

/// Map a chat-completions response to an [`LlmReply`].
fn parse_reply(parsed: &Value) -> Result<LlmReply, ProviderError> {
    let message = &parsed["choices"][0]["message"];
    if message.is_null() {
        return Err(ProviderError::Fatal(format!(
            "response missing choices[0].message: {parsed}"
        )));
    }

    if let Some(call) = message["tool_calls"][0]["function"].as_object() {
        let name = call.get("name").and_then(Value::as_str).unwrap_or("");
        if name != "query" {
            return Err(ProviderError::Fatal(format!("unknown tool call: {name}")));
        }
        let raw_args = call
            .get("arguments")
            .and_then(Value::as_str)
            .unwrap_or("{}");
        let args: Value = serde_json::from_str(raw_args)
            .map_err(|e| ProviderError::Fatal(format!("bad tool arguments: {e}")))?;
        return Ok(LlmReply::ToolCall {
            question: args["question"].as_str().unwrap_or("").to_string(),
            source: args["source"].as_str().unwrap_or("").to_string(),
        });
    }

    let text = message["content"].as_str().unwrap_or("").to_string();
    Ok(LlmReply::Answer { text })
}
