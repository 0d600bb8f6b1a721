//! Closed tool catalogue: schemas offered to the model, validation of the
//! calls it makes, and the tagged-text fallback format.

use std::sync::LazyLock;

use kuuki_llm::provider::{CompletionResponse, ToolDefinition};
use regex::Regex;
use serde_json::{Value, json};

use crate::types::{DecisionKind, MessageId, UserId};

static OPEN_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<([a-z_]+)>").expect("valid regex"));
static PARAM_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<([a-z_]+)>(.*?)</([a-z_]+)>").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    Skip,
    SendText,
    Reply,
    Note,
    SearchHistory,
    SearchWeb,
    FetchUrl,
    UpdateMemory,
    RecallHistory,
    WebAnswer,
    Join,
}

const ALL_TOOLS: [ToolName; 11] = [
    ToolName::Skip,
    ToolName::SendText,
    ToolName::Reply,
    ToolName::Note,
    ToolName::SearchHistory,
    ToolName::SearchWeb,
    ToolName::FetchUrl,
    ToolName::UpdateMemory,
    ToolName::RecallHistory,
    ToolName::WebAnswer,
    ToolName::Join,
];

impl ToolName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::SendText => "send_text",
            Self::Reply => "reply",
            Self::Note => "note",
            Self::SearchHistory => "search_history",
            Self::SearchWeb => "search_web",
            Self::FetchUrl => "fetch_url",
            Self::UpdateMemory => "update_memory",
            Self::RecallHistory => "recall_history",
            Self::WebAnswer => "web_answer",
            Self::Join => "join",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        ALL_TOOLS.into_iter().find(|t| t.as_str() == name)
    }

    /// Tools whose result feeds another model round.
    pub fn is_follow_up(self) -> bool {
        matches!(self, Self::SearchHistory | Self::SearchWeb | Self::FetchUrl)
    }

    fn description(self) -> &'static str {
        match self {
            Self::Skip => "Stay silent this time. Use when the conversation does not need you.",
            Self::SendText => "Send a message to the chat.",
            Self::Reply => "Reply to a specific message in the chat.",
            Self::Note => "Write a private note about the conversation for later turns.",
            Self::SearchHistory => "Search older chat history. Results arrive in the next round.",
            Self::SearchWeb => "Search the web. Results arrive in the next round.",
            Self::FetchUrl => "Open a web page and read its content. The page arrives in the next round.",
            Self::UpdateMemory => "Rewrite what you remember about a user. Replaces the previous memory.",
            Self::RecallHistory => "Recall notes written in earlier turns.",
            Self::WebAnswer => "Ask a web search engine for a direct answer.",
            Self::Join => "Let the bot join the conversation.",
        }
    }

    /// `(argument, type, description)` triples, all required.
    fn params(self) -> &'static [(&'static str, &'static str, &'static str)] {
        match self {
            Self::Skip | Self::Join => &[],
            Self::SendText => &[("message", "string", "Message text")],
            Self::Reply => &[
                ("message_id", "integer", "Id of the message to reply to"),
                ("message", "string", "Reply text"),
            ],
            Self::Note => &[("content", "string", "Note text")],
            Self::SearchHistory | Self::RecallHistory => {
                &[("query", "string", "Keywords to search for")]
            }
            Self::SearchWeb | Self::WebAnswer => &[("query", "string", "Search query")],
            Self::FetchUrl => &[("url", "string", "Page URL")],
            Self::UpdateMemory => &[
                ("user_id", "integer", "Id of the user"),
                ("memories", "string", "Everything worth remembering about the user"),
            ],
        }
    }

    pub fn definition(self) -> ToolDefinition {
        let mut properties = serde_json::Map::new();
        for (name, ty, desc) in self.params() {
            properties.insert((*name).into(), json!({ "type": ty, "description": desc }));
        }
        let required: Vec<&str> = self.params().iter().map(|(n, _, _)| *n).collect();
        ToolDefinition {
            name: self.as_str().into(),
            description: self.description().into(),
            input_schema: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }

    /// Tagged-text form of the tool, as shown in the prompt catalogue.
    fn tagged_usage(self) -> String {
        let mut out = format!("# {}\n<{}>\n", self.description(), self.as_str());
        for (name, _, desc) in self.params() {
            out.push_str(&format!("<{name}>{desc}</{name}>\n"));
        }
        out.push_str(&format!("</{}>", self.as_str()));
        out
    }
}

/// A validated tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Skip,
    SendText { message: String },
    Reply { message_id: MessageId, message: String },
    Note { content: String },
    SearchHistory { query: String },
    SearchWeb { query: String },
    FetchUrl { url: String },
    UpdateMemory { user_id: UserId, memories: String },
    RecallHistory { query: String },
    WebAnswer { query: String },
    Join,
}

impl Action {
    pub fn tool(&self) -> ToolName {
        match self {
            Self::Skip => ToolName::Skip,
            Self::SendText { .. } => ToolName::SendText,
            Self::Reply { .. } => ToolName::Reply,
            Self::Note { .. } => ToolName::Note,
            Self::SearchHistory { .. } => ToolName::SearchHistory,
            Self::SearchWeb { .. } => ToolName::SearchWeb,
            Self::FetchUrl { .. } => ToolName::FetchUrl,
            Self::UpdateMemory { .. } => ToolName::UpdateMemory,
            Self::RecallHistory { .. } => ToolName::RecallHistory,
            Self::WebAnswer { .. } => ToolName::WebAnswer,
            Self::Join => ToolName::Join,
        }
    }

    pub fn is_follow_up(&self) -> bool {
        self.tool().is_follow_up()
    }

    /// Arguments in the shape handed to the tool invoker.
    pub fn arguments(&self) -> Value {
        match self {
            Self::Skip | Self::Join => json!({}),
            Self::SendText { message } => json!({ "message": message }),
            Self::Reply { message_id, message } => {
                json!({ "message_id": message_id, "message": message })
            }
            Self::Note { content } => json!({ "content": content }),
            Self::SearchHistory { query }
            | Self::SearchWeb { query }
            | Self::RecallHistory { query }
            | Self::WebAnswer { query } => json!({ "query": query }),
            Self::FetchUrl { url } => json!({ "url": url }),
            Self::UpdateMemory { user_id, memories } => {
                json!({ "user_id": user_id, "memories": memories })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidCall {
    #[error("unknown tool {0}")]
    Unknown(String),
    #[error("tool {0} is not offered in this stage")]
    NotOffered(String),
    #[error("tool {tool}: missing or empty argument {arg}")]
    MissingArgument { tool: &'static str, arg: &'static str },
    #[error("tool {tool}: argument {arg} is not an integer")]
    NotAnInteger { tool: &'static str, arg: &'static str },
}

/// The set of tools offered to the model in one stage.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: Vec<ToolName>,
    /// Follow-up calls end the round and feed the next one. Single-round
    /// stages run every call instead.
    chains_follow_ups: bool,
}

impl ToolRegistry {
    /// Action-loop catalogue. `skip` is only offered to randomly triggered
    /// turns; when the bot was addressed it must say something.
    pub fn for_actions(kind: DecisionKind) -> Self {
        let mut tools = Vec::with_capacity(8);
        if kind == DecisionKind::Random {
            tools.push(ToolName::Skip);
        }
        tools.extend([
            ToolName::SendText,
            ToolName::Reply,
            ToolName::Note,
            ToolName::SearchHistory,
            ToolName::SearchWeb,
            ToolName::FetchUrl,
            ToolName::UpdateMemory,
        ]);
        Self { tools, chains_follow_ups: true }
    }

    /// Read-only deliberation catalogue.
    pub fn for_deliberation() -> Self {
        Self {
            tools: vec![
                ToolName::Skip,
                ToolName::RecallHistory,
                ToolName::WebAnswer,
                ToolName::FetchUrl,
                ToolName::Join,
            ],
            chains_follow_ups: false,
        }
    }

    /// Whether `action` ends the round and feeds another one.
    pub fn is_follow_up(&self, action: &Action) -> bool {
        self.chains_follow_ups && action.is_follow_up()
    }

    pub fn contains(&self, tool: ToolName) -> bool {
        self.tools.contains(&tool)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Prompt section listing every offered tool in tagged-text form.
    pub fn catalogue(&self) -> String {
        self.tools
            .iter()
            .map(|t| t.tagged_usage())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn validate(&self, name: &str, args: &Value) -> Result<Action, InvalidCall> {
        let tool = ToolName::parse(name).ok_or_else(|| InvalidCall::Unknown(name.to_owned()))?;
        if !self.contains(tool) {
            return Err(InvalidCall::NotOffered(name.to_owned()));
        }
        let t = tool.as_str();
        let text = |arg: &'static str| -> Result<String, InvalidCall> {
            args.get(arg)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .ok_or(InvalidCall::MissingArgument { tool: t, arg })
        };
        let int = |arg: &'static str| -> Result<i64, InvalidCall> {
            match args.get(arg) {
                None | Some(Value::Null) => Err(InvalidCall::MissingArgument { tool: t, arg }),
                Some(Value::String(s)) => {
                    s.trim().parse().map_err(|_| InvalidCall::NotAnInteger { tool: t, arg })
                }
                Some(v) => v.as_i64().ok_or(InvalidCall::NotAnInteger { tool: t, arg }),
            }
        };

        Ok(match tool {
            ToolName::Skip => Action::Skip,
            ToolName::Join => Action::Join,
            ToolName::SendText => Action::SendText { message: text("message")? },
            ToolName::Reply => Action::Reply { message_id: int("message_id")?, message: text("message")? },
            ToolName::Note => Action::Note { content: text("content")? },
            ToolName::SearchHistory => Action::SearchHistory { query: text("query")? },
            ToolName::SearchWeb => Action::SearchWeb { query: text("query")? },
            ToolName::FetchUrl => Action::FetchUrl { url: text("url")? },
            ToolName::UpdateMemory => Action::UpdateMemory {
                user_id: int("user_id")?,
                memories: text("memories")?,
            },
            ToolName::RecallHistory => Action::RecallHistory { query: text("query")? },
            ToolName::WebAnswer => Action::WebAnswer { query: text("query")? },
        })
    }

    /// Tagged-text tool calls in `text`, in order, as `(name, arguments)`.
    /// Only tags naming an offered tool are considered.
    pub fn parse_tagged(&self, text: &str) -> Vec<(String, Value)> {
        let mut calls = Vec::new();
        let mut pos = 0;
        while let Some(caps) = OPEN_TAG.captures_at(text, pos) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                break;
            };
            pos = whole.end();
            let Some(tool) = ToolName::parse(name.as_str()).filter(|t| self.contains(*t)) else {
                continue;
            };
            let close = format!("</{}>", tool.as_str());
            let Some(rel_end) = text[pos..].find(&close) else {
                continue;
            };
            let body = &text[pos..pos + rel_end];
            calls.push((tool.as_str().to_owned(), parse_params(body)));
            pos += rel_end + close.len();
        }
        calls
    }
}

/// `<name>value</name>` pairs inside one tagged call.
fn parse_params(body: &str) -> Value {
    let mut params = serde_json::Map::new();
    for caps in PARAM_TAG.captures_iter(body) {
        if let (Some(open), Some(value), Some(close)) = (caps.get(1), caps.get(2), caps.get(3))
            && open.as_str() == close.as_str()
        {
            params.insert(open.as_str().to_owned(), Value::String(value.as_str().trim().to_owned()));
        }
    }
    Value::Object(params)
}

/// Validated actions from a model response: native tool calls, or tagged
/// text when there are none. Invalid calls are logged and dropped. In a
/// registry that chains follow-ups, nothing after the first one survives.
pub fn extract_actions(registry: &ToolRegistry, response: &CompletionResponse) -> Vec<Action> {
    let native = response.tool_calls();
    let raw: Vec<(String, Value)> = if native.is_empty() {
        registry.parse_tagged(&response.content)
    } else {
        native.into_iter().map(|c| (c.name, c.arguments)).collect()
    };

    let mut actions = Vec::with_capacity(raw.len());
    for (name, args) in raw {
        match registry.validate(&name, &args) {
            Ok(action) => {
                let follow_up = registry.is_follow_up(&action);
                actions.push(action);
                if follow_up {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "invalid tool call dropped");
            }
        }
    }
    actions
}
