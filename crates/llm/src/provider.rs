use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    /// Plain text content (concatenation of Text blocks).
    pub content: String,
    /// Structured content blocks (tool calls / tool results).
    /// Empty means the message is plain text only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_blocks: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), content_blocks: vec![] }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), content_blocks: vec![] }
    }

    /// Build a message from structured content blocks.
    pub fn from_content_blocks(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self { role, content: join_text(&blocks), content_blocks: blocks }
    }

    /// Build a User message carrying tool results.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self { role: Role::User, content: String::new(), content_blocks: results }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    System,
    User,
    Assistant,
}

// ── Tool use types ──

/// Tool definition sent in requests (name + description + JSON Schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A content block in a message: text, tool use or tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult { tool_use_id: String, content: String, is_error: bool },
}

/// A tool call requested by the model, flattened out of the content blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// LLM completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// Overrides the backend's configured limit when set.
    pub max_tokens: Option<u32>,
    /// Overrides the backend's configured temperature when set.
    pub temperature: Option<f32>,
    /// Tool definitions for native tool use (empty = no tools).
    pub tools: Vec<ToolDefinition>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages, ..Self::default() }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// LLM completion response.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    /// Concatenation of all Text blocks.
    pub content: String,
    /// Structured content blocks from the model.
    pub content_blocks: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl CompletionResponse {
    /// Plain-text response without tool calls.
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            content: text.clone(),
            content_blocks: vec![ContentBlock::Text { text }],
            ..Self::default()
        }
    }

    /// Response carrying native tool calls as `(name, arguments)` pairs.
    pub fn with_tool_calls(calls: Vec<(&str, serde_json::Value)>) -> Self {
        let blocks = calls
            .into_iter()
            .enumerate()
            .map(|(i, (name, input))| ContentBlock::ToolUse {
                id: format!("call_{i}"),
                name: name.to_owned(),
                input,
            })
            .collect();
        Self {
            content: String::new(),
            content_blocks: blocks,
            stop_reason: StopReason::ToolUse,
            ..Self::default()
        }
    }

    /// Tool calls in the order the model emitted them.
    pub fn tool_calls(&self) -> Vec<ToolCallRequest> {
        self.content_blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCallRequest {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Error type for LLM operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited")]
    RateLimited,
    #[error("request failed: {0}")]
    RequestFailed(String),
    /// Cooperative cancellation. Never retried.
    #[error("request aborted")]
    Aborted,
    #[error("all {attempts} attempts failed, last error: {last}")]
    Exhausted { attempts: usize, last: String },
}

/// Trait for LLM backends (OpenAI-compatible endpoints, test doubles, ...).
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>>;
}

fn join_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

/// Scripted provider for testing. Pops one queued outcome per call and
/// records every request it receives. An exhausted script answers with
/// an empty text response.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<CompletionResponse, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn then(self, outcome: Result<CompletionResponse, LlmError>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
        self
    }

    pub fn then_text(self, text: &str) -> Self {
        self.then(Ok(CompletionResponse::text(text)))
    }

    pub fn then_tools(self, calls: Vec<(&str, serde_json::Value)>) -> Self {
        self.then(Ok(CompletionResponse::with_tool_calls(calls)))
    }

    pub fn then_error(self, error: LlmError) -> Self {
        self.then(Err(error))
    }

    /// Sleep before answering, so callers can race cancellation against it.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let next = self
            .script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| Ok(CompletionResponse::text("")));
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            next
        })
    }
}
