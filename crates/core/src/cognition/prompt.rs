//! Prompt assembly for the deliberation and action stages.

use chrono::{DateTime, FixedOffset, Offset, Utc};
use kuuki_llm::provider::ChatMessage as LlmMessage;
use serde_json::Value;

use crate::cognition::text::preview;
use crate::cognition::tools::ToolRegistry;
use crate::config::ChatCfg;
use crate::types::{Author, ContextItem, Decision, UserId};

/// Fetched page content shown to the model is cut to this many chars.
const PAGE_PREVIEW_CHARS: usize = 4000;

/// Suggestion carried into the round after a web search.
pub const WEB_SEARCH_TIP: &str = "The search results only show snippets. If one of them \
looks useful, call fetch_url on its URL to read the full page before answering.";

#[derive(Debug, Clone, Copy)]
pub struct RenderOptions<'a> {
    pub now: DateTime<Utc>,
    pub with_time: bool,
    /// Mark a trailing bot reply as the latest one.
    pub emphasize_last_reply: bool,
    pub blacklist: &'a [UserId],
}

/// Transcript items as tagged lines. Items by blacklisted users are left out.
pub fn render_items(items: &[ContextItem], opts: RenderOptions<'_>) -> String {
    let last = items.len().saturating_sub(1);
    items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| render_item(item, i == last, opts))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_item(item: &ContextItem, is_last: bool, opts: RenderOptions<'_>) -> Option<String> {
    let time = |at: &Option<DateTime<Utc>>| match at {
        Some(at) if opts.with_time => format!(" time=\"{}\"", relative_time(*at, opts.now)),
        _ => String::new(),
    };
    let line = match item {
        ContextItem::Message { message_id, author, text, reply_to, at } => {
            if opts.blacklist.contains(&author.id) {
                return None;
            }
            let quoted = reply_to
                .as_ref()
                .map(|r| {
                    let text = r.text.as_deref().unwrap_or("[media]");
                    format!("<reply_to user=\"{}\">{}</reply_to>", r.author.display_name, preview(text, 80))
                })
                .unwrap_or_default();
            format!(
                "<message id=\"{message_id}\" user=\"{}\" user_id=\"{}\"{}>{quoted}{text}</message>",
                author.display_name,
                author.id,
                time(at)
            )
        }
        ContextItem::BotReply { text, reply_to_message_id, at } => {
            let tag = if is_last && opts.emphasize_last_reply { "bot_latest_reply" } else { "bot_reply" };
            let target = reply_to_message_id
                .map(|id| format!(" reply_to=\"{id}\""))
                .unwrap_or_default();
            format!("<{tag}{target}{}>{text}</{tag}>", time(at))
        }
        ContextItem::BotText { text, at } => format!("<bot_text{}>{text}</bot_text>", time(at)),
        ContextItem::BotNote { text, at } => format!("<bot_note{}>{text}</bot_note>", time(at)),
        ContextItem::BotSkip { at } => format!("<bot_skip{}></bot_skip>", time(at)),
        ContextItem::SearchResult { text } => format!("<bot_search_result>\n{text}\n</bot_search_result>"),
        ContextItem::WebResult { text } => format!("<bot_web_result>\n{text}\n</bot_web_result>"),
        ContextItem::ToolCalled { tool, arguments, error } => match error {
            Some(error) => format!(
                "<bot_tool_called name=\"{tool}\">{arguments}<error>{error}</error></bot_tool_called>"
            ),
            None => format!("<bot_tool_called name=\"{tool}\">{arguments}</bot_tool_called>"),
        },
    };
    Some(line)
}

pub fn relative_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = (now - at).num_minutes();
    match minutes {
        m if m < 1 => "just now".into(),
        m if m < 60 => format!("{m} minutes ago"),
        m if m < 60 * 24 => format!("{} hours ago", m / 60),
        m => format!("{} days ago", m / (60 * 24)),
    }
}

/// Web search hits (`[{title, url|link, snippet}]`) as numbered results.
pub fn render_web_hits(value: &Value) -> String {
    let Some(hits) = value.as_array() else {
        return value.to_string();
    };
    if hits.is_empty() {
        return "No results.".into();
    }
    hits.iter()
        .enumerate()
        .map(|(i, hit)| {
            let field = |keys: &[&str]| {
                keys.iter()
                    .find_map(|k| hit.get(*k).and_then(Value::as_str))
                    .unwrap_or("")
                    .to_owned()
            };
            format!(
                "<result index=\"{}\">\n<title>{}</title>\n<url>{}</url>\n<snippet>{}</snippet>\n</result>",
                i + 1,
                field(&["title"]),
                field(&["url", "link"]),
                field(&["snippet", "description"]),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fetched page (`{title, content, success}`).
pub fn render_page(value: &Value) -> String {
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        return "Could not open the page.".into();
    }
    let title = value.get("title").and_then(Value::as_str).unwrap_or("");
    let content = match value.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => value.to_string(),
    };
    format!("<title>{title}</title>\n<content>\n{}\n</content>", preview(&content, PAGE_PREVIEW_CHARS))
}

/// Direct answer (`{answer}` or plain string).
pub fn render_answer(value: &Value) -> String {
    match value.get("answer").and_then(Value::as_str).or_else(|| value.as_str()) {
        Some(answer) => answer.to_owned(),
        None => value.to_string(),
    }
}

fn facts(cfg: &ChatCfg, scene: &str, now: DateTime<Utc>) -> String {
    let offset = FixedOffset::east_opt(cfg.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
    let local = now.with_timezone(&offset);
    format!(
        "<facts>\nThe current time is {}.\nWhy you are looking at the chat: {scene}.\n</facts>",
        local.format("%Y-%m-%d %H:%M (%:z)")
    )
}

fn section(name: &str, body: &str) -> String {
    format!("<{name}>\n{body}\n</{name}>")
}

/// Everything the action stage shows the model in one round.
pub struct ActionPrompt<'a> {
    pub cfg: &'a ChatCfg,
    pub decision: &'a Decision,
    pub transcript: &'a [ContextItem],
    pub notes: &'a [ContextItem],
    pub memories: &'a [(Author, String)],
    pub registry: &'a ToolRegistry,
    pub tip: Option<&'a str>,
    pub now: DateTime<Utc>,
}

impl ActionPrompt<'_> {
    pub fn build(&self) -> Vec<LlmMessage> {
        let cfg = self.cfg;
        let plain = RenderOptions {
            now: self.now,
            with_time: false,
            emphasize_last_reply: false,
            blacklist: &cfg.blacklist_users,
        };
        let timed = RenderOptions { with_time: true, emphasize_last_reply: true, ..plain };

        let system = format!("{}\n\n{}", cfg.system_prompt, facts(cfg, &self.decision.scene, self.now));

        let mut parts = Vec::new();
        if !self.notes.is_empty() {
            parts.push(section("related_notes", &render_items(self.notes, plain)));
        }
        if !self.decision.related_context.is_empty() {
            parts.push(section("related_context", &render_items(&self.decision.related_context, plain)));
        }
        for (author, memory) in self.memories {
            parts.push(format!(
                "<user_memories for=\"{}\" user_id=\"{}\">\n{memory}\n</user_memories>",
                author.display_name, author.id
            ));
        }
        parts.push(section("tools", &self.registry.catalogue()));
        parts.push(section("chat_history", &render_items(self.transcript, timed)));
        parts.push(cfg.task_prompt.clone());
        if let Some(tip) = self.tip {
            parts.push(section("tip", tip));
        }
        if !cfg.jailbreak_prompt.is_empty() {
            parts.push(cfg.jailbreak_prompt.clone());
        }

        vec![LlmMessage::system(system), LlmMessage::user(parts.join("\n\n"))]
    }
}

pub fn deliberation_prompt(
    cfg: &ChatCfg,
    decision: &Decision,
    history: &[ContextItem],
    registry: &ToolRegistry,
    now: DateTime<Utc>,
) -> Vec<LlmMessage> {
    let opts = RenderOptions {
        now,
        with_time: true,
        emphasize_last_reply: true,
        blacklist: &cfg.blacklist_users,
    };
    let system = format!(
        "{}\n\n{}\n\n<persona>\n{}\n</persona>",
        cfg.deliberation_system_prompt,
        facts(cfg, &decision.scene, now),
        cfg.system_prompt
    );
    let user = [
        section("tools", &registry.catalogue()),
        section("chat_history", &render_items(history, opts)),
        cfg.deliberation_task_prompt.clone(),
    ]
    .join("\n\n");
    vec![LlmMessage::system(system), LlmMessage::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, DecisionKind, ReplyRef};
    use chrono::Duration;
    use serde_json::json;

    fn opts(now: DateTime<Utc>, blacklist: &[UserId]) -> RenderOptions<'_> {
        RenderOptions { now, with_time: true, emphasize_last_reply: true, blacklist }
    }

    #[test]
    fn relative_times() {
        let now = Utc::now();
        assert_eq!(relative_time(now, now), "just now");
        assert_eq!(relative_time(now - Duration::minutes(5), now), "5 minutes ago");
        assert_eq!(relative_time(now - Duration::hours(3), now), "3 hours ago");
        assert_eq!(relative_time(now - Duration::days(2), now), "2 days ago");
    }

    #[test]
    fn blacklisted_authors_are_hidden() {
        let now = Utc::now();
        let items = vec![
            ContextItem::from_message(&ChatMessage::group(1, 1, Author::new(5, "spam"), "buy now")),
            ContextItem::from_message(&ChatMessage::group(1, 2, Author::new(6, "ann"), "hi")),
        ];
        let out = render_items(&items, opts(now, &[5]));
        assert!(!out.contains("buy now"));
        assert!(out.contains("user=\"ann\""));
    }

    #[test]
    fn last_bot_reply_is_emphasized() {
        let now = Utc::now();
        let reply = ContextItem::BotReply { text: "yes".into(), reply_to_message_id: Some(1), at: None };
        let earlier = render_items(&[reply.clone(), ContextItem::BotText { text: "x".into(), at: None }], opts(now, &[]));
        assert!(earlier.contains("<bot_reply reply_to=\"1\">yes</bot_reply>"));
        let last = render_items(&[reply], opts(now, &[]));
        assert!(last.contains("<bot_latest_reply reply_to=\"1\">yes</bot_latest_reply>"));
    }

    #[test]
    fn quoted_media_has_placeholder() {
        let now = Utc::now();
        let msg = ChatMessage::group(1, 2, Author::new(6, "ann"), "lol").replying_to(ReplyRef {
            message_id: 1,
            author: Author::new(7, "bo"),
            text: None,
        });
        let out = render_items(&[ContextItem::from_message(&msg)], opts(now, &[]));
        assert!(out.contains("<reply_to user=\"bo\">[media]</reply_to>lol"));
    }

    #[test]
    fn web_results_render() {
        let hits = json!([{"title": "Rust", "link": "https://rust-lang.org", "snippet": "fast"}]);
        let out = render_web_hits(&hits);
        assert!(out.contains("<url>https://rust-lang.org</url>"));
        assert_eq!(render_web_hits(&json!([])), "No results.");
        assert_eq!(render_page(&json!({"success": false})), "Could not open the page.");
        assert!(render_page(&json!({"title": "t", "content": "body"})).contains("body"));
        assert_eq!(render_answer(&json!({"answer": "42"})), "42");
    }

    #[test]
    fn action_prompt_contains_sections_in_order() {
        let cfg = ChatCfg::default();
        let decision = Decision::act(DecisionKind::Mention, "ann mentioned you");
        let transcript = vec![ContextItem::from_message(&ChatMessage::group(1, 1, Author::new(6, "ann"), "hey bot"))];
        let memories = vec![(Author::new(6, "ann"), "likes tea".to_string())];
        let registry = ToolRegistry::for_actions(decision.kind);
        let prompt = ActionPrompt {
            cfg: &cfg,
            decision: &decision,
            transcript: &transcript,
            notes: &[],
            memories: &memories,
            registry: &registry,
            tip: Some(WEB_SEARCH_TIP),
            now: Utc::now(),
        }
        .build();

        assert_eq!(prompt.len(), 2);
        assert!(prompt[0].content.contains("ann mentioned you"));
        let user = &prompt[1].content;
        let mem = user.find("<user_memories").unwrap();
        let tools = user.find("<tools>").unwrap();
        let history = user.find("<chat_history>").unwrap();
        let tip = user.find("<tip>").unwrap();
        assert!(mem < tools && tools < history && history < tip);
        assert!(!user.contains("<related_notes>"));
    }
}
