//! HTTP-based LLM backend for OpenAI-compatible chat completion APIs
//! (OpenAI, DeepSeek, Gemini's compatibility endpoint, local gateways, ...).

use crate::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, ContentBlock, LlmError, LlmProvider, Role,
    StopReason, ToolDefinition,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MAX_TOKENS: u32 = 8000;
const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Connection settings for one backend in a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCfg {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

impl BackendCfg {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_owned()),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    /// o1/o3 reasoning models take `max_completion_tokens` and reject `temperature`.
    fn is_reasoning_model(&self) -> bool {
        let m = self.model.to_lowercase();
        m.starts_with("o1") || m.starts_with("o3")
    }
}

// ── OpenAI-compatible request/response types ──

#[derive(Serialize)]
struct OaiRequest {
    model: String,
    messages: Vec<OaiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OaiTool>,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OaiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct OaiTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OaiFunctionDef,
}

#[derive(Serialize)]
struct OaiFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

impl From<&ToolDefinition> for OaiTool {
    fn from(td: &ToolDefinition) -> Self {
        Self {
            kind: "function",
            function: OaiFunctionDef {
                name: td.name.clone(),
                description: td.description.clone(),
                parameters: td.input_schema.clone(),
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
struct OaiToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: OaiFunctionCall,
}

fn function_kind() -> String {
    "function".to_owned()
}

#[derive(Serialize, Deserialize)]
struct OaiFunctionCall {
    name: String,
    /// JSON-encoded argument object.
    arguments: String,
}

#[derive(Deserialize)]
struct OaiResponse {
    choices: Vec<OaiChoice>,
    usage: Option<OaiUsage>,
}

#[derive(Deserialize)]
struct OaiChoice {
    message: OaiChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OaiChoiceMessage {
    content: Option<String>,
    reasoning: Option<String>,
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OaiToolCall>,
}

#[derive(Deserialize)]
struct OaiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

// ── Provider ──

/// HTTP backend speaking the OpenAI chat completions protocol.
pub struct HttpProvider {
    cfg: BackendCfg,
    client: reqwest::Client,
    base_url: String,
}

impl HttpProvider {
    pub fn new(cfg: BackendCfg) -> Self {
        let base_url = cfg.base_url.trim_end_matches('/').to_owned();
        Self { cfg, client: reqwest::Client::new(), base_url }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body(&self, request: &CompletionRequest) -> OaiRequest {
        let max_tokens = request.max_tokens.unwrap_or(self.cfg.max_tokens);
        let reasoning = self.cfg.is_reasoning_model();
        OaiRequest {
            model: self.cfg.model.clone(),
            messages: to_oai_messages(&request.messages),
            max_tokens: (!reasoning).then_some(max_tokens),
            max_completion_tokens: reasoning.then_some(max_tokens),
            temperature: (!reasoning).then(|| request.temperature.unwrap_or(self.cfg.temperature)),
            tools: request.tools.iter().map(OaiTool::from).collect(),
        }
    }

    async fn complete_openai(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = self.build_body(&request);

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(check_error(status, text));
        }

        let api: OaiResponse = resp.json().await.map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        parse_response(api)
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Flatten our block-structured messages into OpenAI's shape: assistant tool
/// calls ride on the assistant message, each tool result becomes its own
/// `tool` role message.
fn to_oai_messages(messages: &[ChatMessage]) -> Vec<OaiMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        if m.content_blocks.is_empty() {
            out.push(OaiMessage {
                role: role_str(m.role),
                content: Some(m.content.clone()),
                tool_calls: vec![],
                tool_call_id: None,
            });
            continue;
        }

        let mut tool_calls = Vec::new();
        for block in &m.content_blocks {
            match block {
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(OaiToolCall {
                    id: id.clone(),
                    kind: function_kind(),
                    function: OaiFunctionCall { name: name.clone(), arguments: input.to_string() },
                }),
                ContentBlock::ToolResult { tool_use_id, content, .. } => out.push(OaiMessage {
                    role: "tool",
                    content: Some(content.clone()),
                    tool_calls: vec![],
                    tool_call_id: Some(tool_use_id.clone()),
                }),
                ContentBlock::Text { .. } => {}
            }
        }

        if !tool_calls.is_empty() || !m.content.is_empty() {
            out.push(OaiMessage {
                role: role_str(m.role),
                content: (!m.content.is_empty()).then(|| m.content.clone()),
                tool_calls,
                tool_call_id: None,
            });
        }
    }
    out
}

fn parse_response(api: OaiResponse) -> Result<CompletionResponse, LlmError> {
    let (input_tokens, output_tokens) =
        api.usage.map(|u| (u.prompt_tokens, u.completion_tokens)).unwrap_or((0, 0));
    let choice = api
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::RequestFailed("response has no choices".into()))?;

    // Reasoning text is kept in front of the answer so text-mode tool tags
    // emitted while reasoning are still visible to the caller.
    let message = choice.message;
    let content = format!(
        "{}{}",
        message.reasoning.or(message.reasoning_content).unwrap_or_default(),
        message.content.unwrap_or_default()
    );

    let mut content_blocks = Vec::new();
    if !content.is_empty() {
        content_blocks.push(ContentBlock::Text { text: content.clone() });
    }
    for call in message.tool_calls {
        let input = serde_json::from_str(&call.function.arguments)
            .unwrap_or(serde_json::Value::String(call.function.arguments));
        content_blocks.push(ContentBlock::ToolUse { id: call.id, name: call.function.name, input });
    }

    let has_tools = content_blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. }));
    let stop_reason = match choice.finish_reason.as_deref() {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ if has_tools => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    };

    Ok(CompletionResponse { content, content_blocks, stop_reason, input_tokens, output_tokens })
}

/// Parse error response, returning RateLimited for 429.
fn check_error(status: reqwest::StatusCode, body: String) -> LlmError {
    if status.as_u16() == 429 {
        LlmError::RateLimited
    } else {
        LlmError::RequestFailed(format!("{status}: {body}"))
    }
}

impl LlmProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.cfg.model
    }

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        Box::pin(self.complete_openai(request))
    }
}

/// Build a backend pool from environment variables.
/// `<model_env_key>` holds one or more comma-separated model names sharing
/// `KUUKI_LLM_API_KEY` and the optional `KUUKI_LLM_BASE_URL`.
/// Returns an empty pool if the model or key is not set.
pub fn pool_from_env(model_env_key: &str) -> Vec<HttpProvider> {
    let (Ok(models), Ok(api_key)) =
        (std::env::var(model_env_key), std::env::var("KUUKI_LLM_API_KEY"))
    else {
        return Vec::new();
    };
    let base_url = std::env::var("KUUKI_LLM_BASE_URL").ok();
    models
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(|m| HttpProvider::new(BackendCfg::new(m, api_key.clone(), base_url.clone())))
        .collect()
}

/// Main action backends, from `KUUKI_LLM_MODEL`.
pub fn from_env() -> Vec<HttpProvider> {
    pool_from_env("KUUKI_LLM_MODEL")
}

/// Lightweight deliberation backends, from `KUUKI_LITE_MODEL`.
pub fn lite_from_env() -> Vec<HttpProvider> {
    pool_from_env("KUUKI_LITE_MODEL")
}
