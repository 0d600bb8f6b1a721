//! Tool execution seam. Delivery, notes, memories and web access all go
//! through a [`ToolInvoker`]; the core never talks to the transport itself.

use std::sync::Mutex;

use serde_json::Value;

use crate::types::ChatId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("tool {tool} failed: {cause}")]
    Failed { tool: String, cause: String },
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
}

impl ToolError {
    pub fn failed(tool: &str, cause: impl std::fmt::Display) -> Self {
        Self::Failed { tool: tool.to_owned(), cause: cause.to_string() }
    }
}

#[async_trait::async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn execute(&self, chat_id: ChatId, name: &str, args: Value) -> Result<Value, ToolError>;
}

/// One call seen by a [`RecordingToolInvoker`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub chat_id: ChatId,
    pub name: String,
    pub args: Value,
}

/// Test double: records every call and answers from a fixed table.
/// Tools without a canned answer succeed with `{"ok": true}`.
#[derive(Debug, Default)]
pub struct RecordingToolInvoker {
    calls: Mutex<Vec<RecordedCall>>,
    answers: Vec<(String, Result<Value, ToolError>)>,
}

impl RecordingToolInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(mut self, tool: &str, value: Value) -> Self {
        self.answers.push((tool.to_owned(), Ok(value)));
        self
    }

    pub fn fail(mut self, tool: &str, cause: &str) -> Self {
        self.answers.push((tool.to_owned(), Err(ToolError::failed(tool, cause))));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_named(&self, name: &str) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.name == name).collect()
    }
}

#[async_trait::async_trait]
impl ToolInvoker for RecordingToolInvoker {
    async fn execute(&self, chat_id: ChatId, name: &str, args: Value) -> Result<Value, ToolError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall { chat_id, name: name.to_owned(), args });
        }
        self.answers
            .iter()
            .find(|(tool, _)| tool == name)
            .map(|(_, answer)| answer.clone())
            .unwrap_or_else(|| Ok(serde_json::json!({ "ok": true })))
    }
}
