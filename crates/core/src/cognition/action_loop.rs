//! Bounded tool loop that turns a decision into chat actions.

use chrono::Utc;
use kuuki_llm::invoker::ModelInvoker;
use kuuki_llm::provider::CompletionRequest;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::cognition::TurnError;
use crate::cognition::prompt::{self, ActionPrompt, RenderOptions, WEB_SEARCH_TIP};
use crate::cognition::text::{is_duplicate, normalize_punctuation, preview};
use crate::cognition::tools::{Action, ToolRegistry, extract_actions};
use crate::config::ChatCfg;
use crate::decision::SharedRate;
use crate::io::{RetrievalStore, SearchOptions, ToolInvoker};
use crate::types::{
    Author, ContentKind, ContextItem, Decision, ToolCallRecord, TurnReport, TurnRequest,
};

/// Context fetched before the first round.
#[derive(Debug, Clone, Default)]
pub struct TurnContext {
    pub history: Vec<ContextItem>,
    pub notes: Vec<ContextItem>,
}

pub struct ActionLoop<'a> {
    pub cfg: &'a ChatCfg,
    pub invoker: &'a ModelInvoker,
    pub tools: &'a dyn ToolInvoker,
    pub store: &'a dyn RetrievalStore,
    pub rate: &'a SharedRate,
}

impl ActionLoop<'_> {
    /// Run rounds until one has no follow-up call, the depth bound drops a
    /// follow-up, or `cancel` fires.
    ///
    /// Depth starts at 1; a follow-up requested at depth `d` runs only while
    /// `d <= max_stack_depth`.
    pub async fn run(
        &self,
        turn: &TurnRequest,
        decision: &Decision,
        ctx: TurnContext,
        cancel: &CancellationToken,
    ) -> Result<TurnReport, TurnError> {
        let registry = ToolRegistry::for_actions(decision.kind);
        let memories = self.load_memories(&ctx.history).await;
        let mut transcript = ctx.history;
        let mut notes = ctx.notes;
        let mut report = TurnReport::default();
        let mut tip: Option<&str> = None;
        let mut depth: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(TurnError::Cancelled);
            }
            let messages = ActionPrompt {
                cfg: self.cfg,
                decision,
                transcript: &transcript,
                notes: &notes,
                memories: &memories,
                registry: &registry,
                tip,
                now: Utc::now(),
            }
            .build();
            let request = CompletionRequest::new(messages).with_tools(registry.definitions());
            let response = self.invoker.invoke(request, Some(cancel)).await?;
            if cancel.is_cancelled() {
                return Err(TurnError::Cancelled);
            }
            report.rounds += 1;
            tip = None;

            let actions = extract_actions(&registry, &response);
            tracing::debug!(
                chat_id = turn.chat_id,
                turn_id = %turn.id,
                depth,
                actions = actions.len(),
                "model round parsed"
            );

            let mut follow_up = None;
            for action in actions {
                if cancel.is_cancelled() {
                    return Err(TurnError::Cancelled);
                }
                if registry.is_follow_up(&action) {
                    follow_up = Some(action);
                    break;
                }
                self.apply(turn, action, &mut transcript, &mut report).await;
            }

            let Some(action) = follow_up else {
                break;
            };
            if depth > self.cfg.max_stack_depth {
                tracing::warn!(
                    chat_id = turn.chat_id,
                    turn_id = %turn.id,
                    tool = action.tool().as_str(),
                    depth,
                    max_stack_depth = self.cfg.max_stack_depth,
                    "follow-up dropped: depth bound reached"
                );
                report.dropped += 1;
                break;
            }

            tracing::info!(
                chat_id = turn.chat_id,
                turn_id = %turn.id,
                tool = action.tool().as_str(),
                depth,
                "follow-up tool"
            );
            if matches!(action, Action::SearchWeb { .. }) {
                tip = Some(WEB_SEARCH_TIP);
            }
            self.follow(turn, action, &mut transcript, &mut report).await;
            notes.clear();
            report.follow_ups += 1;
            depth += 1;
        }

        Ok(report)
    }

    /// Stored memories of every distinct author in the transcript. Missing
    /// or unreadable memories are skipped.
    async fn load_memories(&self, history: &[ContextItem]) -> Vec<(Author, String)> {
        let mut authors: Vec<&Author> = Vec::new();
        for item in history {
            if let ContextItem::Message { author, .. } = item
                && !authors.iter().any(|a| a.id == author.id)
                && !self.cfg.blacklist_users.contains(&author.id)
            {
                authors.push(author);
            }
        }

        let mut memories = Vec::new();
        for author in authors {
            match self.store.get_user_memory(author.id).await {
                Ok(Some(memory)) if !memory.trim().is_empty() => {
                    memories.push((author.clone(), memory));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(user_id = author.id, error = %e, "user memory lookup failed");
                }
            }
        }
        memories
    }

    /// Execute one terminal action.
    async fn apply(
        &self,
        turn: &TurnRequest,
        action: Action,
        transcript: &mut Vec<ContextItem>,
        report: &mut TurnReport,
    ) {
        let chat_id = turn.chat_id;
        let name = action.tool().as_str();
        match action {
            Action::SendText { ref message } | Action::Reply { ref message, .. } => {
                let text = normalize_punctuation(message);
                if is_duplicate(&text, transcript, self.cfg.max_allowed_diff) {
                    tracing::debug!(chat_id, turn_id = %turn.id, text = %preview(&text, 60), "duplicate message suppressed");
                    report.suppressed += 1;
                    return;
                }
                let reply_to = match action {
                    Action::Reply { message_id, .. } => Some(message_id),
                    _ => None,
                };
                let args = match reply_to {
                    Some(id) => json!({ "message_id": id, "message": text }),
                    None => json!({ "message": text }),
                };
                let outcome = self.tools.execute(chat_id, name, args.clone()).await;
                match &outcome {
                    Ok(_) => {
                        if let Err(e) = self.rate.boost(self.cfg.reply_rate_boost) {
                            tracing::warn!(chat_id, error = %e, "rate boost failed");
                        }
                        let at = Some(Utc::now());
                        transcript.push(match reply_to {
                            Some(id) => ContextItem::BotReply { text, reply_to_message_id: Some(id), at },
                            None => ContextItem::BotText { text, at },
                        });
                        report.delivered += 1;
                        tracing::info!(chat_id, turn_id = %turn.id, tool = name, "message delivered");
                    }
                    Err(e) => self.record_failure(name, &args, e, transcript),
                }
                record(report, name, args, outcome);
            }
            Action::Skip => {
                let outcome = self.tools.execute(chat_id, name, json!({})).await;
                if let Err(e) = self.rate.decay_by(self.cfg.skip_rate_decay) {
                    tracing::warn!(chat_id, error = %e, "rate decay failed");
                }
                transcript.push(ContextItem::BotSkip { at: Some(Utc::now()) });
                tracing::info!(chat_id, turn_id = %turn.id, "turn skipped by model");
                record(report, name, json!({}), outcome);
            }
            Action::Note { ref content } => {
                let args = action.arguments();
                let outcome = self.tools.execute(chat_id, name, args.clone()).await;
                match &outcome {
                    Ok(_) => transcript.push(ContextItem::BotNote { text: content.clone(), at: Some(Utc::now()) }),
                    Err(e) => self.record_failure(name, &args, e, transcript),
                }
                record(report, name, args, outcome);
            }
            Action::UpdateMemory { .. } => {
                let args = action.arguments();
                let outcome = self.tools.execute(chat_id, name, args.clone()).await;
                if let Err(e) = &outcome {
                    self.record_failure(name, &args, e, transcript);
                }
                record(report, name, args, outcome);
            }
            other => {
                tracing::warn!(chat_id, tool = other.tool().as_str(), "tool not executable in action stage");
            }
        }
    }

    /// Execute one follow-up action and append its result to the transcript.
    async fn follow(
        &self,
        turn: &TurnRequest,
        action: Action,
        transcript: &mut Vec<ContextItem>,
        report: &mut TurnReport,
    ) {
        let chat_id = turn.chat_id;
        let name = action.tool().as_str();
        let args = action.arguments();
        let result: Result<(Value, ContextItem), String> = match &action {
            Action::SearchHistory { query } => {
                let opts = SearchOptions::new(self.cfg.history_search_limit).kinds(&[
                    ContentKind::Message,
                    ContentKind::Reply,
                    ContentKind::Note,
                ]);
                match self.store.search_similar(chat_id, query, opts).await {
                    Ok(items) => {
                        let text = if items.is_empty() {
                            "Nothing found.".to_owned()
                        } else {
                            prompt::render_items(
                                &items,
                                RenderOptions {
                                    now: Utc::now(),
                                    with_time: true,
                                    emphasize_last_reply: false,
                                    blacklist: &self.cfg.blacklist_users,
                                },
                            )
                        };
                        Ok((json!({ "hits": items.len() }), ContextItem::SearchResult { text }))
                    }
                    Err(e) => Err(e.to_string()),
                }
            }
            Action::SearchWeb { .. } => match self.tools.execute(chat_id, name, args.clone()).await {
                Ok(v) => {
                    let text = prompt::render_web_hits(&v);
                    Ok((v, ContextItem::WebResult { text }))
                }
                Err(e) => Err(e.to_string()),
            },
            Action::FetchUrl { .. } => match self.tools.execute(chat_id, name, args.clone()).await {
                Ok(v) => {
                    let text = prompt::render_page(&v);
                    Ok((v, ContextItem::WebResult { text }))
                }
                Err(e) => Err(e.to_string()),
            },
            other => Err(format!("{} is not a follow-up tool", other.tool().as_str())),
        };

        match result {
            Ok((value, item)) => {
                transcript.push(ContextItem::ToolCalled {
                    tool: name.to_owned(),
                    arguments: args.to_string(),
                    error: None,
                });
                transcript.push(item);
                report.calls.push(ToolCallRecord { name: name.to_owned(), arguments: args, outcome: Ok(value) });
            }
            Err(cause) => {
                tracing::warn!(chat_id, turn_id = %turn.id, tool = name, error = %cause, "follow-up tool failed");
                transcript.push(ContextItem::ToolCalled {
                    tool: name.to_owned(),
                    arguments: args.to_string(),
                    error: Some(cause.clone()),
                });
                report.calls.push(ToolCallRecord { name: name.to_owned(), arguments: args, outcome: Err(cause) });
            }
        }
    }

    fn record_failure(
        &self,
        name: &str,
        args: &Value,
        error: &crate::io::ToolError,
        transcript: &mut Vec<ContextItem>,
    ) {
        tracing::warn!(tool = name, error = %error, "tool call failed");
        transcript.push(ContextItem::ToolCalled {
            tool: name.to_owned(),
            arguments: args.to_string(),
            error: Some(error.to_string()),
        });
    }
}

fn record(
    report: &mut TurnReport,
    name: &str,
    arguments: Value,
    outcome: Result<Value, crate::io::ToolError>,
) {
    report.calls.push(ToolCallRecord {
        name: name.to_owned(),
        arguments,
        outcome: outcome.map_err(|e| e.to_string()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::ResponseRateModel;
    use crate::io::{InMemoryStore, RecordingToolInvoker};
    use crate::types::{ChatMessage, DecisionKind};
    use kuuki_llm::provider::{LlmError, LlmProvider, ScriptedProvider};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        cfg: ChatCfg,
        store: InMemoryStore,
        tools: RecordingToolInvoker,
        rate: SharedRate,
    }

    impl Fixture {
        fn new() -> Self {
            let cfg = ChatCfg::default();
            let rate = SharedRate::new(ResponseRateModel::new(
                crate::decision::RateParams::from_cfg(&cfg),
                0.3,
                Utc::now(),
            ));
            Self { cfg, store: InMemoryStore::new(), tools: RecordingToolInvoker::new(), rate }
        }

        async fn run(
            &self,
            provider: Arc<ScriptedProvider>,
            kind: DecisionKind,
            history: Vec<ContextItem>,
            cancel: &CancellationToken,
        ) -> Result<TurnReport, TurnError> {
            let invoker = ModelInvoker::new(vec![provider as Arc<dyn LlmProvider>], 1).with_backoff(Duration::from_millis(1));
            let msg = ChatMessage::group(1, 10, Author::new(5, "ann"), "hey");
            let decision = Decision::act(kind, "test");
            let turn = TurnRequest::new(msg, decision.clone());
            let action_loop = ActionLoop {
                cfg: &self.cfg,
                invoker: &invoker,
                tools: &self.tools,
                store: &self.store,
                rate: &self.rate,
            };
            action_loop
                .run(&turn, &decision, TurnContext { history, notes: vec![] }, cancel)
                .await
        }
    }

    #[tokio::test]
    async fn send_text_is_normalized_delivered_and_boosts_rate() {
        let fx = Fixture::new();
        let provider = Arc::new(ScriptedProvider::new("m").then_tools(vec![(
            "send_text",
            json!({"message": "ok, \"sure\""}),
        )]));
        let report = fx
            .run(provider.clone(), DecisionKind::Mention, vec![], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.rounds, 1);
        let sent = fx.tools.calls_named("send_text");
        assert_eq!(sent[0].args["message"], "ok， “sure”");
        assert!((fx.rate.current().unwrap() - 0.4).abs() < 1e-9);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_of_earlier_bot_text_is_suppressed() {
        let fx = Fixture::new();
        let history = vec![ContextItem::BotText { text: "今天天气不错".into(), at: None }];
        let provider = Arc::new(ScriptedProvider::new("m").then_tools(vec![
            ("send_text", json!({"message": "今天天气很好"})),
            ("send_text", json!({"message": "要不要出去玩"})),
        ]));
        let report = fx
            .run(provider, DecisionKind::Mention, history, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.suppressed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(fx.tools.calls_named("send_text").len(), 1);
    }

    #[tokio::test]
    async fn repeated_sends_in_one_round_are_deduplicated() {
        let fx = Fixture::new();
        let provider = Arc::new(ScriptedProvider::new("m").then_tools(vec![
            ("send_text", json!({"message": "hello there"})),
            ("send_text", json!({"message": "hello there!"})),
        ]));
        let report = fx
            .run(provider, DecisionKind::Mention, vec![], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.suppressed, 1);
    }

    #[tokio::test]
    async fn skip_decays_rate() {
        let fx = Fixture::new();
        let provider = Arc::new(ScriptedProvider::new("m").then_tools(vec![("skip", json!({}))]));
        fx.run(provider, DecisionKind::Random, vec![], &CancellationToken::new())
            .await
            .unwrap();
        assert!((fx.rate.current().unwrap() - 0.1).abs() < 1e-9);
        assert_eq!(fx.tools.calls_named("skip").len(), 1);
    }

    #[tokio::test]
    async fn skip_is_rejected_for_addressed_turns() {
        let fx = Fixture::new();
        let provider = Arc::new(ScriptedProvider::new("m").then_tools(vec![("skip", json!({}))]));
        let report = fx
            .run(provider, DecisionKind::Mention, vec![], &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.calls.is_empty());
        assert!((fx.rate.current().unwrap() - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn search_feeds_next_round_and_depth_is_bounded() {
        let mut fx = Fixture::new();
        fx.cfg.max_stack_depth = 2;
        let search = || vec![("search_history", json!({"query": "tea"}))];
        let provider = Arc::new(
            ScriptedProvider::new("m")
                .then_tools(search())
                .then_tools(search())
                .then_tools(search()),
        );
        let report = fx
            .run(provider.clone(), DecisionKind::Mention, vec![], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.follow_ups, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.rounds, 3);
        assert_eq!(provider.call_count(), 3);
        let last_prompt = &provider.requests()[2].messages[1].content;
        assert!(last_prompt.contains("<bot_tool_called name=\"search_history\">"));
    }

    #[tokio::test]
    async fn web_search_adds_fetch_tip_for_next_round() {
        let mut fx = Fixture::new();
        fx.tools = RecordingToolInvoker::new()
            .answer("search_web", json!([{"title": "Tea", "url": "https://tea.example", "snippet": "hot"}]));
        let provider = Arc::new(
            ScriptedProvider::new("m")
                .then_tools(vec![("search_web", json!({"query": "tea"}))])
                .then_tools(vec![("send_text", json!({"message": "tea is hot"}))]),
        );
        let report = fx
            .run(provider.clone(), DecisionKind::Mention, vec![], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.delivered, 1);
        let second = &provider.requests()[1].messages[1].content;
        assert!(second.contains("<tip>"));
        assert!(second.contains("https://tea.example"));
        assert!(!provider.requests()[0].messages[1].content.contains("<tip>"));
    }

    #[tokio::test]
    async fn tool_failure_is_recorded_not_fatal() {
        let mut fx = Fixture::new();
        fx.tools = RecordingToolInvoker::new().fail("fetch_url", "timeout");
        let provider = Arc::new(
            ScriptedProvider::new("m")
                .then_tools(vec![("fetch_url", json!({"url": "https://x.example"}))])
                .then_text("nothing to add"),
        );
        let report = fx
            .run(provider.clone(), DecisionKind::Mention, vec![], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.calls.len(), 1);
        assert!(report.calls[0].outcome.is_err());
        let second = &provider.requests()[1].messages[1].content;
        assert!(second.contains("<error>"));
    }

    #[tokio::test]
    async fn cancelled_before_first_round_has_no_side_effects() {
        let fx = Fixture::new();
        let provider = Arc::new(ScriptedProvider::new("m").then_tools(vec![(
            "send_text",
            json!({"message": "hi"}),
        )]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fx.run(provider.clone(), DecisionKind::Mention, vec![], &cancel).await;
        assert!(matches!(result, Err(TurnError::Cancelled)));
        assert_eq!(provider.call_count(), 0);
        assert!(fx.tools.calls().is_empty());
    }

    #[tokio::test]
    async fn exhausted_backends_end_the_turn() {
        let fx = Fixture::new();
        let provider = Arc::new(ScriptedProvider::new("m").then_error(LlmError::RateLimited));
        let result = fx
            .run(provider, DecisionKind::Mention, vec![], &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TurnError::BackendExhausted(_))));
        assert!(fx.tools.calls().is_empty());
    }

    #[tokio::test]
    async fn memories_of_transcript_authors_are_in_prompt() {
        let fx = Fixture::new();
        fx.store.set_user_memory(5, "ann drinks green tea").unwrap();
        let history = vec![ContextItem::from_message(&ChatMessage::group(1, 9, Author::new(5, "ann"), "hi"))];
        let provider = Arc::new(ScriptedProvider::new("m").then_text(""));
        fx.run(provider.clone(), DecisionKind::Mention, history, &CancellationToken::new())
            .await
            .unwrap();
        assert!(provider.requests()[0].messages[1].content.contains("ann drinks green tea"));
    }
}
