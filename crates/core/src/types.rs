use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ChatId = i64;
pub type MessageId = i64;
pub type UserId = i64;

/// Private one-to-one chat or multi-member group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,
    pub display_name: String,
}

impl Author {
    pub fn new(id: UserId, display_name: impl Into<String>) -> Self {
        Self { id, display_name: display_name.into() }
    }
}

/// The message an inbound message replies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub message_id: MessageId,
    pub author: Author,
    /// `None` for media without a caption.
    pub text: Option<String>,
}

/// Normalized inbound chat message, as handed over by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub chat_kind: ChatKind,
    pub text: String,
    pub author: Author,
    pub reply_to: Option<ReplyRef>,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn group(chat_id: ChatId, id: MessageId, author: Author, text: impl Into<String>) -> Self {
        Self {
            id,
            chat_id,
            chat_kind: ChatKind::Group,
            text: text.into(),
            author,
            reply_to: None,
            sent_at: Utc::now(),
        }
    }

    pub fn private(chat_id: ChatId, id: MessageId, author: Author, text: impl Into<String>) -> Self {
        Self { chat_kind: ChatKind::Private, ..Self::group(chat_id, id, author, text) }
    }

    pub fn replying_to(mut self, reply: ReplyRef) -> Self {
        self.reply_to = Some(reply);
        self
    }

    pub fn at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = sent_at;
        self
    }
}

// ── Decision types ──────────────────────────────────────────────

/// Why a decision was (or was not) made to act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionKind {
    Private,
    Mention,
    FollowUp,
    Trigger,
    Random,
    /// Deliberation vetoed acting.
    Skip,
    /// No rule fired.
    Normal,
}

impl DecisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Mention => "mention",
            Self::FollowUp => "follow-up",
            Self::Trigger => "trigger",
            Self::Random => "random",
            Self::Skip => "skip",
            Self::Normal => "normal",
        }
    }
}

/// Per-message verdict, passed by value through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub should_act: bool,
    pub kind: DecisionKind,
    /// Human-readable justification, injected into the prompt.
    pub scene: String,
    /// Extra context gathered during deliberation.
    pub related_context: Vec<ContextItem>,
}

impl Decision {
    pub fn act(kind: DecisionKind, scene: impl Into<String>) -> Self {
        Self { should_act: true, kind, scene: scene.into(), related_context: Vec::new() }
    }

    pub fn pass(scene: impl Into<String>) -> Self {
        Self {
            should_act: false,
            kind: DecisionKind::Normal,
            scene: scene.into(),
            related_context: Vec::new(),
        }
    }
}

// ── Transcript ──────────────────────────────────────────────────

/// Stored content categories, used to filter similarity searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Message,
    Reply,
    Text,
    Note,
    Skip,
}

/// One entry of the transcript fed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextItem {
    Message {
        message_id: MessageId,
        author: Author,
        text: String,
        reply_to: Option<ReplyRef>,
        at: Option<DateTime<Utc>>,
    },
    BotReply {
        text: String,
        reply_to_message_id: Option<MessageId>,
        at: Option<DateTime<Utc>>,
    },
    BotText {
        text: String,
        at: Option<DateTime<Utc>>,
    },
    BotNote {
        text: String,
        at: Option<DateTime<Utc>>,
    },
    BotSkip {
        at: Option<DateTime<Utc>>,
    },
    SearchResult {
        text: String,
    },
    WebResult {
        text: String,
    },
    ToolCalled {
        tool: String,
        arguments: String,
        error: Option<String>,
    },
}

impl ContextItem {
    pub fn from_message(msg: &ChatMessage) -> Self {
        Self::Message {
            message_id: msg.id,
            author: msg.author.clone(),
            text: msg.text.clone(),
            reply_to: msg.reply_to.clone(),
            at: Some(msg.sent_at),
        }
    }

    pub fn content_kind(&self) -> Option<ContentKind> {
        match self {
            Self::Message { .. } => Some(ContentKind::Message),
            Self::BotReply { .. } => Some(ContentKind::Reply),
            Self::BotText { .. } => Some(ContentKind::Text),
            Self::BotNote { .. } => Some(ContentKind::Note),
            Self::BotSkip { .. } => Some(ContentKind::Skip),
            _ => None,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Message { text, .. }
            | Self::BotReply { text, .. }
            | Self::BotText { text, .. }
            | Self::BotNote { text, .. }
            | Self::SearchResult { text }
            | Self::WebResult { text } => text,
            Self::ToolCalled { arguments, .. } => arguments,
            Self::BotSkip { .. } => "",
        }
    }

    pub fn at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Message { at, .. }
            | Self::BotReply { at, .. }
            | Self::BotText { at, .. }
            | Self::BotNote { at, .. }
            | Self::BotSkip { at } => *at,
            _ => None,
        }
    }

    /// Text the bot already sent, for duplicate suppression.
    pub fn sent_text(&self) -> Option<&str> {
        match self {
            Self::BotReply { text, .. } | Self::BotText { text, .. } => Some(text),
            _ => None,
        }
    }
}

// ── Turns ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub Uuid);

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Unit of work serialized by a conversation's scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    pub id: TurnId,
    pub chat_id: ChatId,
    pub message: ChatMessage,
    pub decision: Decision,
}

impl TurnRequest {
    pub fn new(message: ChatMessage, decision: Decision) -> Self {
        Self { id: TurnId(Uuid::new_v4()), chat_id: message.chat_id, message, decision }
    }
}

/// One executed (or failed) tool call within a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: serde_json::Value,
    pub outcome: Result<serde_json::Value, String>,
}

/// Summary of one action loop run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnReport {
    /// Model round-trips performed.
    pub rounds: u32,
    /// Follow-up tool rounds executed.
    pub follow_ups: u32,
    pub delivered: u32,
    pub suppressed: u32,
    /// Follow-up calls dropped by the depth bound.
    pub dropped: u32,
    pub calls: Vec<ToolCallRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&DecisionKind::FollowUp).unwrap();
        assert_eq!(json, "\"follow-up\"");
        assert_eq!(DecisionKind::FollowUp.as_str(), "follow-up");
    }

    #[test]
    fn context_item_round_trips_tagged() {
        let item = ContextItem::BotReply {
            text: "hi".into(),
            reply_to_message_id: Some(7),
            at: None,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["kind"], "bot_reply");
        let back: ContextItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn only_sends_count_as_sent_text() {
        assert_eq!(ContextItem::BotText { text: "a".into(), at: None }.sent_text(), Some("a"));
        assert_eq!(ContextItem::BotNote { text: "a".into(), at: None }.sent_text(), None);
        let msg = ChatMessage::group(1, 2, Author::new(3, "ann"), "hello");
        assert_eq!(ContextItem::from_message(&msg).sent_text(), None);
    }

    #[test]
    fn private_builder_sets_kind() {
        let msg = ChatMessage::private(5, 1, Author::new(5, "bo"), "yo");
        assert_eq!(msg.chat_kind, ChatKind::Private);
        assert_eq!(msg.chat_id, 5);
    }
}
