//! One actor per conversation. It owns the conversation state, so trigger
//! evaluation, preemption and restarts are serialized without locks; turn
//! attempts run on their own tasks and report back over a channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cognition::TurnError;
use crate::config::ChatCfg;
use crate::decision::{ResponseRateModel, Sampler, SharedRate, TriggerEvaluator};
use crate::dialogue::{ConversationSnapshot, ConversationState, Next, Offer, TurnOutcome};
use crate::io::RetrievalStore;
use crate::runtime::RuntimeError;
use crate::runtime::pipeline::{TurnEnv, TurnRunner};
use crate::types::{ChatId, ChatMessage, TurnId, TurnRequest};

const COMMAND_BUFFER: usize = 64;

enum SchedulerCmd {
    Inbound(ChatMessage),
    Snapshot(oneshot::Sender<ConversationSnapshot>),
}

struct TurnDone {
    turn_id: TurnId,
    outcome: TurnOutcome,
}

/// Cheap handle to a running [`TurnScheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    chat_id: ChatId,
    tx: mpsc::Sender<SchedulerCmd>,
}

impl SchedulerHandle {
    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub async fn submit(&self, msg: ChatMessage) -> Result<(), RuntimeError> {
        self.tx
            .send(SchedulerCmd::Inbound(msg))
            .await
            .map_err(|_| RuntimeError::Closed)
    }

    pub async fn snapshot(&self) -> Result<ConversationSnapshot, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCmd::Snapshot(reply))
            .await
            .map_err(|_| RuntimeError::Closed)?;
        rx.await.map_err(|_| RuntimeError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct TurnScheduler {
    state: ConversationState,
    env: TurnEnv,
    evaluator: TriggerEvaluator,
    store: Arc<dyn RetrievalStore>,
    runner: Arc<dyn TurnRunner>,
    shutdown: CancellationToken,
    done_tx: mpsc::UnboundedSender<TurnDone>,
    done_rx: mpsc::UnboundedReceiver<TurnDone>,
}

impl TurnScheduler {
    /// Start the actor for `chat_id`. It stops when `shutdown` fires or every
    /// handle is dropped, cancelling any running turn.
    pub fn spawn(
        chat_id: ChatId,
        cfg: Arc<ChatCfg>,
        sampler: Box<dyn Sampler>,
        store: Arc<dyn RetrievalStore>,
        runner: Arc<dyn TurnRunner>,
        shutdown: CancellationToken,
    ) -> SchedulerHandle {
        let rate = SharedRate::new(ResponseRateModel::from_cfg(&cfg, Utc::now()));
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            state: ConversationState::new(chat_id, rate.clone(), shutdown.clone()),
            env: TurnEnv { cfg: Arc::clone(&cfg), rate },
            evaluator: TriggerEvaluator::new(cfg, sampler),
            store,
            runner,
            shutdown,
            done_tx,
            done_rx,
        };
        tokio::spawn(scheduler.run(rx));
        SchedulerHandle { chat_id, tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SchedulerCmd>) {
        let chat_id = self.state.chat_id;
        let period = Duration::from_millis(self.env.cfg.decay_interval_ms.max(1));
        let mut decay = tokio::time::interval_at(Instant::now() + period, period);
        decay.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(chat_id, "conversation scheduler started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!(chat_id, "shutdown requested, stopping conversation");
                    break;
                }
                Some(done) = self.done_rx.recv() => self.on_turn_done(done),
                cmd = rx.recv() => match cmd {
                    Some(SchedulerCmd::Inbound(msg)) => self.on_inbound(msg).await,
                    Some(SchedulerCmd::Snapshot(reply)) => {
                        let _ = reply.send(self.state.snapshot());
                    }
                    None => break,
                },
                _ = decay.tick() => match self.state.rate.adjust(Utc::now()) {
                    Ok(rate) => tracing::debug!(chat_id, rate, "response rate adjusted"),
                    Err(e) => tracing::warn!(chat_id, error = %e, "response rate adjustment failed"),
                },
            }
        }

        self.state.abort();
        tracing::info!(chat_id, "conversation scheduler stopped");
    }

    async fn on_inbound(&mut self, msg: ChatMessage) {
        let now = Utc::now();
        let decision = self
            .evaluator
            .evaluate(&msg, &mut self.state, self.store.as_ref(), now)
            .await;
        tracing::debug!(
            chat_id = msg.chat_id,
            message_id = msg.id,
            should_act = decision.should_act,
            kind = decision.kind.as_str(),
            scene = %decision.scene,
            "trigger evaluated"
        );
        if !decision.should_act {
            return;
        }

        let cfg = &self.env.cfg;
        let turn = TurnRequest::new(msg, decision);
        match self.state.offer(
            turn,
            Duration::from_millis(cfg.interrupt_timeout_ms),
            cfg.max_interruptions,
        ) {
            Offer::StartNow(turn) => self.launch(turn, now),
            Offer::Preempted => {
                tracing::info!(chat_id = self.state.chat_id, "newer message preempted the running turn");
            }
            Offer::Queued => {
                tracing::debug!(chat_id = self.state.chat_id, "turn queued behind the running one");
            }
        }
    }

    fn on_turn_done(&mut self, done: TurnDone) {
        let chat_id = self.state.chat_id;
        if self.state.running_turn_id() != Some(done.turn_id) {
            tracing::debug!(chat_id, turn_id = %done.turn_id, "ignoring stale turn result");
            return;
        }
        if let TurnOutcome::Failed(reason) = &done.outcome {
            tracing::warn!(chat_id, turn_id = %done.turn_id, %reason, "turn failed");
        }

        match self.state.finish(&done.outcome, self.env.cfg.max_interruptions) {
            Next::Restart(turn) => {
                if self.shutdown.is_cancelled() {
                    return;
                }
                tracing::info!(
                    chat_id,
                    turn_id = %turn.id,
                    restart = self.state.interrupt_count(),
                    "restarting preempted turn"
                );
                let token = self.state.rearm();
                self.spawn_attempt(turn, token);
            }
            Next::Start(turn) => self.launch(turn, Utc::now()),
            Next::Idle => {}
        }
    }

    fn launch(&mut self, turn: TurnRequest, now: DateTime<Utc>) {
        let token = self.state.start(turn.clone(), now);
        self.spawn_attempt(turn, token);
    }

    /// Run one attempt on its own task. The runner is nested in a second task
    /// so a panic still reports back as a failure.
    fn spawn_attempt(&self, turn: TurnRequest, cancel: CancellationToken) {
        let runner = Arc::clone(&self.runner);
        let env = self.env.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let turn_id = turn.id;
            let attempt = tokio::spawn(async move { runner.run(&turn, &env, cancel).await });
            let outcome = match attempt.await {
                Ok(Ok(_)) => TurnOutcome::Completed,
                Ok(Err(TurnError::Cancelled)) => TurnOutcome::Cancelled,
                Ok(Err(e)) => TurnOutcome::Failed(e.to_string()),
                Err(e) => TurnOutcome::Failed(format!("turn task panicked: {e}")),
            };
            let _ = done_tx.send(TurnDone { turn_id, outcome });
        });
    }
}
