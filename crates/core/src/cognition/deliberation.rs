//! Optional pre-check on a cheaper model: may veto acting and gathers
//! background for the action stage. Never delivers anything.

use chrono::Utc;
use kuuki_llm::invoker::ModelInvoker;
use kuuki_llm::provider::{CompletionRequest, LlmError};
use tokio_util::sync::CancellationToken;

use crate::cognition::prompt::{self, RenderOptions};
use crate::cognition::tools::{Action, ToolRegistry, extract_actions};
use crate::config::ChatCfg;
use crate::io::{RetrievalStore, SearchOptions, ToolInvoker};
use crate::types::{ContentKind, ContextItem, Decision, DecisionKind, TurnRequest};

pub struct DeliberationStage<'a> {
    pub cfg: &'a ChatCfg,
    pub invoker: &'a ModelInvoker,
    pub tools: &'a dyn ToolInvoker,
    pub store: &'a dyn RetrievalStore,
}

impl DeliberationStage<'_> {
    /// Refine `decision`. Decisions that already skip are returned as is;
    /// any failure returns the input unchanged.
    pub async fn consider(
        &self,
        turn: &TurnRequest,
        decision: Decision,
        history: &[ContextItem],
        cancel: &CancellationToken,
    ) -> Decision {
        if !decision.should_act {
            return decision;
        }
        match self.deliberate(turn, decision.clone(), history, cancel).await {
            Ok(refined) => refined,
            Err(LlmError::Aborted) => {
                tracing::debug!(chat_id = turn.chat_id, turn_id = %turn.id, "deliberation aborted");
                decision
            }
            Err(e) => {
                tracing::warn!(chat_id = turn.chat_id, turn_id = %turn.id, error = %e, "deliberation failed, keeping decision");
                decision
            }
        }
    }

    async fn deliberate(
        &self,
        turn: &TurnRequest,
        mut decision: Decision,
        history: &[ContextItem],
        cancel: &CancellationToken,
    ) -> Result<Decision, LlmError> {
        let registry = ToolRegistry::for_deliberation();
        let messages = prompt::deliberation_prompt(self.cfg, &decision, history, &registry, Utc::now());
        let request = CompletionRequest::new(messages).with_tools(registry.definitions());
        let response = self.invoker.invoke(request, Some(cancel)).await?;

        decision.related_context.clear();
        for action in extract_actions(&registry, &response) {
            if cancel.is_cancelled() {
                return Err(LlmError::Aborted);
            }
            tracing::debug!(chat_id = turn.chat_id, tool = action.tool().as_str(), "deliberation tool");
            match action {
                Action::Skip => {
                    decision.should_act = false;
                    decision.kind = DecisionKind::Skip;
                }
                Action::Join => {}
                Action::RecallHistory { ref query } => {
                    let opts = SearchOptions::new(self.cfg.recall_limit).kinds(&[ContentKind::Note]);
                    match self.store.search_similar(turn.chat_id, query, opts).await {
                        Ok(items) if !items.is_empty() => {
                            let text = prompt::render_items(
                                &items,
                                RenderOptions {
                                    now: Utc::now(),
                                    with_time: true,
                                    emphasize_last_reply: false,
                                    blacklist: &self.cfg.blacklist_users,
                                },
                            );
                            decision.related_context.push(ContextItem::SearchResult { text });
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(chat_id = turn.chat_id, error = %e, "recall failed");
                        }
                    }
                }
                Action::WebAnswer { .. } | Action::FetchUrl { .. } => {
                    let name = action.tool().as_str();
                    match self.tools.execute(turn.chat_id, name, action.arguments()).await {
                        Ok(value) => {
                            let text = if name == "web_answer" {
                                prompt::render_answer(&value)
                            } else {
                                prompt::render_page(&value)
                            };
                            decision.related_context.push(ContextItem::WebResult { text });
                        }
                        Err(e) => {
                            tracing::warn!(chat_id = turn.chat_id, tool = name, error = %e, "deliberation tool failed");
                        }
                    }
                }
                other => {
                    tracing::warn!(tool = other.tool().as_str(), "tool not available to deliberation");
                }
            }
        }

        tracing::info!(
            chat_id = turn.chat_id,
            turn_id = %turn.id,
            should_act = decision.should_act,
            related = decision.related_context.len(),
            "deliberation done"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{InMemoryStore, RecordingToolInvoker};
    use crate::types::{Author, ChatMessage};
    use kuuki_llm::provider::{LlmProvider, ScriptedProvider};
    use serde_json::json;
    use std::sync::Arc;

    async fn consider(
        provider: Arc<ScriptedProvider>,
        tools: &RecordingToolInvoker,
        store: &InMemoryStore,
        decision: Decision,
    ) -> Decision {
        let cfg = ChatCfg::default();
        let invoker = ModelInvoker::new(vec![provider as Arc<dyn LlmProvider>], 1);
        let stage = DeliberationStage { cfg: &cfg, invoker: &invoker, tools, store };
        let msg = ChatMessage::group(1, 3, Author::new(5, "ann"), "what is the capital of peru");
        let turn = TurnRequest::new(msg, decision.clone());
        stage.consider(&turn, decision, &[], &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn skip_vetoes_acting() {
        let provider = Arc::new(ScriptedProvider::new("lite").then_tools(vec![("skip", json!({}))]));
        let d = consider(
            provider,
            &RecordingToolInvoker::new(),
            &InMemoryStore::new(),
            Decision::act(DecisionKind::Random, "random"),
        )
        .await;
        assert!(!d.should_act);
        assert_eq!(d.kind, DecisionKind::Skip);
    }

    #[tokio::test]
    async fn answers_become_related_context() {
        let tools = RecordingToolInvoker::new().answer("web_answer", json!({"answer": "Lima"}));
        let provider = Arc::new(ScriptedProvider::new("lite").then_tools(vec![
            ("web_answer", json!({"query": "capital of peru"})),
            ("join", json!({})),
        ]));
        let d = consider(provider, &tools, &InMemoryStore::new(), Decision::act(DecisionKind::Mention, "m")).await;
        assert!(d.should_act);
        assert_eq!(d.kind, DecisionKind::Mention);
        assert_eq!(d.related_context, vec![ContextItem::WebResult { text: "Lima".into() }]);
    }

    #[tokio::test]
    async fn skip_after_fetch_still_vetoes() {
        let tools = RecordingToolInvoker::new().answer("fetch_url", json!({"title": "t", "content": "page"}));
        let provider = Arc::new(ScriptedProvider::new("lite").then_tools(vec![
            ("fetch_url", json!({"url": "https://example.com/a"})),
            ("skip", json!({})),
        ]));
        let d = consider(provider, &tools, &InMemoryStore::new(), Decision::act(DecisionKind::Random, "random")).await;
        assert!(!d.should_act);
        assert_eq!(d.kind, DecisionKind::Skip);
        assert_eq!(tools.calls_named("fetch_url").len(), 1);
    }

    #[tokio::test]
    async fn recall_searches_notes() {
        let store = InMemoryStore::new();
        store.push(1, ContextItem::BotNote { text: "peru trip planned".into(), at: None }).unwrap();
        let provider = Arc::new(
            ScriptedProvider::new("lite").then_tools(vec![("recall_history", json!({"query": "peru"}))]),
        );
        let d = consider(provider, &RecordingToolInvoker::new(), &store, Decision::act(DecisionKind::Trigger, "t")).await;
        assert_eq!(d.related_context.len(), 1);
        assert!(d.related_context[0].text().contains("peru trip planned"));
    }

    #[tokio::test]
    async fn delivery_tools_are_ignored() {
        let tools = RecordingToolInvoker::new();
        let provider = Arc::new(
            ScriptedProvider::new("lite").then_tools(vec![("send_text", json!({"message": "hi"}))]),
        );
        let d = consider(provider, &tools, &InMemoryStore::new(), Decision::act(DecisionKind::Mention, "m")).await;
        assert!(d.should_act);
        assert!(tools.calls().is_empty());
    }

    #[tokio::test]
    async fn failure_keeps_original_decision() {
        let provider = Arc::new(ScriptedProvider::new("lite").then_error(LlmError::RateLimited));
        let original = Decision::act(DecisionKind::Mention, "m");
        let d = consider(provider, &RecordingToolInvoker::new(), &InMemoryStore::new(), original.clone()).await;
        assert_eq!(d, original);
    }

    #[tokio::test]
    async fn skipping_decisions_are_not_consulted() {
        let provider = Arc::new(ScriptedProvider::new("lite"));
        let d = consider(provider.clone(), &RecordingToolInvoker::new(), &InMemoryStore::new(), Decision::pass("cooldown")).await;
        assert!(!d.should_act);
        assert_eq!(provider.call_count(), 0);
    }
}
