//! The work a scheduled turn performs: fetch context, optionally
//! deliberate, then run the action loop.

use std::sync::Arc;
use std::time::Duration;

use kuuki_llm::invoker::ModelInvoker;
use tokio_util::sync::CancellationToken;

use crate::cognition::{ActionLoop, DeliberationStage, TurnContext, TurnError};
use crate::config::ChatCfg;
use crate::decision::SharedRate;
use crate::io::{RetrievalStore, SearchOptions, ToolInvoker};
use crate::types::{ContentKind, TurnReport, TurnRequest};

/// Notes older than this are never offered when the configured window is
/// out of range.
const FALLBACK_NOTES_WINDOW_HOURS: i64 = 24 * 7;

/// Per-conversation state a turn needs besides the request itself.
#[derive(Clone)]
pub struct TurnEnv {
    pub cfg: Arc<ChatCfg>,
    pub rate: SharedRate,
}

/// Executes one attempt of a turn. The scheduler owns retries and
/// preemption; implementations only need to honour `cancel`.
#[async_trait::async_trait]
pub trait TurnRunner: Send + Sync {
    async fn run(
        &self,
        turn: &TurnRequest,
        env: &TurnEnv,
        cancel: CancellationToken,
    ) -> Result<TurnReport, TurnError>;
}

pub struct TurnPipeline {
    store: Arc<dyn RetrievalStore>,
    tools: Arc<dyn ToolInvoker>,
    actions: ModelInvoker,
    deliberation: Option<ModelInvoker>,
}

impl TurnPipeline {
    pub fn new(store: Arc<dyn RetrievalStore>, tools: Arc<dyn ToolInvoker>, actions: ModelInvoker) -> Self {
        Self { store, tools, actions, deliberation: None }
    }

    /// Consult `invoker` before acting. An empty pool disables deliberation.
    pub fn with_deliberation(mut self, invoker: ModelInvoker) -> Self {
        self.deliberation = (!invoker.is_empty()).then_some(invoker);
        self
    }

    async fn fetch_context(
        &self,
        turn: &TurnRequest,
        cfg: &ChatCfg,
        cancel: &CancellationToken,
    ) -> Result<TurnContext, TurnError> {
        let window = chrono::Duration::try_hours(cfg.related_notes_window_hours)
            .unwrap_or_else(|| chrono::Duration::hours(FALLBACK_NOTES_WINDOW_HOURS));
        let notes_opts = SearchOptions::new(cfg.related_notes_limit)
            .kinds(&[ContentKind::Note])
            .within(window);

        let fetch = async {
            tokio::join!(
                self.store.get_context(turn.chat_id, turn.message.id, cfg.context_limit),
                self.store.search_similar(turn.chat_id, &turn.message.text, notes_opts),
            )
        };
        let (history, notes) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            fetched = fetch => fetched,
        };

        let history = history?;
        let notes = notes.unwrap_or_else(|e| {
            tracing::warn!(chat_id = turn.chat_id, error = %e, "related notes unavailable");
            Vec::new()
        });
        Ok(TurnContext { history, notes })
    }
}

#[async_trait::async_trait]
impl TurnRunner for TurnPipeline {
    async fn run(
        &self,
        turn: &TurnRequest,
        env: &TurnEnv,
        cancel: CancellationToken,
    ) -> Result<TurnReport, TurnError> {
        let cfg = env.cfg.as_ref();
        tracing::info!(
            chat_id = turn.chat_id,
            turn_id = %turn.id,
            message_id = turn.message.id,
            kind = turn.decision.kind.as_str(),
            "turn started"
        );

        let ctx = self.fetch_context(turn, cfg, &cancel).await?;

        let decision = match &self.deliberation {
            Some(invoker) => {
                let invoker = invoker.clone().with_max_attempts(1);
                DeliberationStage {
                    cfg,
                    invoker: &invoker,
                    tools: self.tools.as_ref(),
                    store: self.store.as_ref(),
                }
                .consider(turn, turn.decision.clone(), &ctx.history, &cancel)
                .await
            }
            None => turn.decision.clone(),
        };
        if cancel.is_cancelled() {
            return Err(TurnError::Cancelled);
        }
        if !decision.should_act {
            tracing::info!(chat_id = turn.chat_id, turn_id = %turn.id, "turn vetoed");
            return Ok(TurnReport::default());
        }

        let invoker = self
            .actions
            .clone()
            .with_max_attempts(cfg.max_retries as usize)
            .with_backoff(Duration::from_millis(cfg.retry_backoff_ms));
        let report = ActionLoop {
            cfg,
            invoker: &invoker,
            tools: self.tools.as_ref(),
            store: self.store.as_ref(),
            rate: &env.rate,
        }
        .run(turn, &decision, ctx, &cancel)
        .await?;

        tracing::info!(
            chat_id = turn.chat_id,
            turn_id = %turn.id,
            rounds = report.rounds,
            delivered = report.delivered,
            suppressed = report.suppressed,
            dropped = report.dropped,
            "turn finished"
        );
        Ok(report)
    }
}
