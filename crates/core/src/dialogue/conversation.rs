//! Per-conversation scheduling state and its transitions.
//!
//! The state is owned by exactly one conversation actor; the methods here
//! are plain synchronous transitions so they can be tested without tasks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::decision::rate::SharedRate;
use crate::dialogue::interrupt::InterruptController;
use crate::types::{ChatId, TurnId, TurnRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Running,
    RunningWithPending,
}

/// How a turn attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Result of offering a new turn to the conversation.
#[derive(Debug)]
pub enum Offer {
    /// Nothing running; the caller should start this turn.
    StartNow(TurnRequest),
    /// Stored as pending and the running attempt was cancelled.
    Preempted,
    /// Stored as pending; the running attempt continues.
    Queued,
}

/// What to do after an attempt reported back.
#[derive(Debug)]
pub enum Next {
    /// Re-run the interrupted turn with a fresh token.
    Restart(TurnRequest),
    /// Start the pending turn.
    Start(TurnRequest),
    Idle,
}

/// Point-in-time view of a conversation, for observability and tests.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSnapshot {
    pub chat_id: ChatId,
    pub phase: Phase,
    pub is_processing: bool,
    pub has_active_cancel: bool,
    pub interrupt_count: u32,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub has_pending: bool,
    pub current_rate: Option<f64>,
    pub last_acted_at: Option<DateTime<Utc>>,
}

/// Scheduling state of one conversation.
///
/// `is_processing == false` implies no cancellation token is held.
#[derive(Debug)]
pub struct ConversationState {
    pub chat_id: ChatId,
    pub rate: SharedRate,
    /// Last time a trigger evaluation decided to act. Drives the cooldown.
    pub last_acted_at: Option<DateTime<Utc>>,
    is_processing: bool,
    active_cancel: InterruptController,
    interrupt_count: u32,
    processing_started_at: Option<DateTime<Utc>>,
    pending_turn: Option<TurnRequest>,
    running_turn: Option<TurnRequest>,
}

impl ConversationState {
    pub fn new(chat_id: ChatId, rate: SharedRate, shutdown: CancellationToken) -> Self {
        Self {
            chat_id,
            rate,
            last_acted_at: None,
            is_processing: false,
            active_cancel: InterruptController::new(shutdown),
            interrupt_count: 0,
            processing_started_at: None,
            pending_turn: None,
            running_turn: None,
        }
    }

    pub fn phase(&self) -> Phase {
        match (self.is_processing, self.pending_turn.is_some()) {
            (false, _) => Phase::Idle,
            (true, false) => Phase::Running,
            (true, true) => Phase::RunningWithPending,
        }
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing
    }

    pub fn interrupt_count(&self) -> u32 {
        self.interrupt_count
    }

    pub fn running_turn_id(&self) -> Option<TurnId> {
        self.running_turn.as_ref().map(|t| t.id)
    }

    /// Whether a message sent at `arrived_at` may preempt the running turn.
    pub fn should_interrupt(
        &self,
        arrived_at: DateTime<Utc>,
        interrupt_timeout: Duration,
        max_interruptions: u32,
    ) -> bool {
        let Some(started) = self.processing_started_at else {
            return false;
        };
        let elapsed_ms = (arrived_at - started).num_milliseconds();
        self.is_processing
            && self.active_cancel.is_armed()
            && elapsed_ms < interrupt_timeout.as_millis() as i64
            && self.interrupt_count < max_interruptions
    }

    /// Offer a turn. A running conversation keeps only the newest pending
    /// turn and may cancel the running attempt.
    pub fn offer(
        &mut self,
        turn: TurnRequest,
        interrupt_timeout: Duration,
        max_interruptions: u32,
    ) -> Offer {
        if !self.is_processing {
            return Offer::StartNow(turn);
        }
        let preempt = self.should_interrupt(turn.message.sent_at, interrupt_timeout, max_interruptions);
        self.pending_turn = Some(turn);
        if preempt {
            self.active_cancel.interrupt();
            Offer::Preempted
        } else {
            Offer::Queued
        }
    }

    /// Mark `turn` as running and issue its token.
    pub fn start(&mut self, turn: TurnRequest, now: DateTime<Utc>) -> CancellationToken {
        self.is_processing = true;
        self.interrupt_count = 0;
        self.processing_started_at = Some(now);
        self.running_turn = Some(turn);
        self.active_cancel.arm()
    }

    /// Issue a fresh token for a restart of the running turn. The start
    /// time is kept, so the preemption window does not reopen.
    pub fn rearm(&mut self) -> CancellationToken {
        self.active_cancel.arm()
    }

    /// Apply the outcome of the running attempt.
    pub fn finish(&mut self, outcome: &TurnOutcome, max_interruptions: u32) -> Next {
        if *outcome == TurnOutcome::Cancelled
            && self.interrupt_count < max_interruptions
            && let Some(turn) = self.running_turn.clone()
        {
            self.interrupt_count += 1;
            return Next::Restart(turn);
        }

        self.is_processing = false;
        self.active_cancel.disarm();
        self.interrupt_count = 0;
        self.processing_started_at = None;
        self.running_turn = None;
        match self.pending_turn.take() {
            Some(turn) => Next::Start(turn),
            None => Next::Idle,
        }
    }

    /// Cancel whatever is running, for shutdown.
    pub fn abort(&mut self) {
        self.active_cancel.interrupt();
        self.active_cancel.disarm();
        self.is_processing = false;
        self.pending_turn = None;
        self.running_turn = None;
        self.processing_started_at = None;
        self.interrupt_count = 0;
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            chat_id: self.chat_id,
            phase: self.phase(),
            is_processing: self.is_processing,
            has_active_cancel: self.active_cancel.is_armed(),
            interrupt_count: self.interrupt_count,
            processing_started_at: self.processing_started_at,
            has_pending: self.pending_turn.is_some(),
            current_rate: self.rate.current().ok(),
            last_acted_at: self.last_acted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatCfg;
    use crate::decision::rate::ResponseRateModel;
    use crate::types::{Author, ChatMessage, Decision, DecisionKind};

    const TIMEOUT: Duration = Duration::from_millis(5000);

    fn state() -> ConversationState {
        let rate = SharedRate::new(ResponseRateModel::from_cfg(&ChatCfg::default(), Utc::now()));
        ConversationState::new(1, rate, CancellationToken::new())
    }

    fn turn_at(at: DateTime<Utc>, text: &str) -> TurnRequest {
        let msg = ChatMessage::group(1, 1, Author::new(2, "ann"), text).at(at);
        TurnRequest::new(msg, Decision::act(DecisionKind::Mention, "mentioned"))
    }

    fn assert_invariant(s: &ConversationState) {
        let snap = s.snapshot();
        if !snap.is_processing {
            assert!(!snap.has_active_cancel, "idle conversation holds a token");
            assert_eq!(snap.interrupt_count, 0, "idle conversation kept its interrupt count");
        }
    }

    #[test]
    fn idle_offer_starts_immediately() {
        let mut s = state();
        assert_eq!(s.phase(), Phase::Idle);
        assert!(matches!(s.offer(turn_at(Utc::now(), "a"), TIMEOUT, 2), Offer::StartNow(_)));
        assert_invariant(&s);
    }

    #[test]
    fn early_message_preempts_running_turn() {
        let mut s = state();
        let t0 = Utc::now();
        let token = s.start(turn_at(t0, "a"), t0);

        let second = turn_at(t0 + chrono::Duration::seconds(1), "b");
        assert!(matches!(s.offer(second, TIMEOUT, 2), Offer::Preempted));
        assert!(token.is_cancelled());
        assert_eq!(s.phase(), Phase::RunningWithPending);
    }

    #[test]
    fn late_message_is_queued() {
        let mut s = state();
        let t0 = Utc::now();
        let token = s.start(turn_at(t0, "a"), t0);

        let late = turn_at(t0 + chrono::Duration::seconds(6), "b");
        assert!(matches!(s.offer(late, TIMEOUT, 2), Offer::Queued));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn interruptions_are_bounded() {
        let mut s = state();
        let t0 = Utc::now();
        s.start(turn_at(t0, "a"), t0);
        let at = t0 + chrono::Duration::seconds(1);

        assert!(s.should_interrupt(at, TIMEOUT, 2));
        assert!(matches!(s.finish(&TurnOutcome::Cancelled, 2), Next::Restart(_)));
        s.rearm();
        assert!(matches!(s.finish(&TurnOutcome::Cancelled, 2), Next::Restart(_)));
        s.rearm();
        assert_eq!(s.interrupt_count(), 2);
        assert!(!s.should_interrupt(at, TIMEOUT, 2));
        assert!(matches!(s.offer(turn_at(at, "c"), TIMEOUT, 2), Offer::Queued));

        // a third cancellation is final: state resets and the pending turn starts
        match s.finish(&TurnOutcome::Cancelled, 2) {
            Next::Start(turn) => assert_eq!(turn.message.text, "c"),
            other => panic!("expected pending start, got {other:?}"),
        }
        assert!(!s.is_processing());
        assert_eq!(s.interrupt_count(), 0);
        assert_invariant(&s);
    }

    #[test]
    fn only_newest_pending_turn_survives() {
        let mut s = state();
        let t0 = Utc::now();
        s.start(turn_at(t0, "a"), t0);
        let late = t0 + chrono::Duration::seconds(10);
        s.offer(turn_at(late, "b"), TIMEOUT, 2);
        s.offer(turn_at(late, "c"), TIMEOUT, 2);

        match s.finish(&TurnOutcome::Completed, 2) {
            Next::Start(turn) => assert_eq!(turn.message.text, "c"),
            other => panic!("expected pending start, got {other:?}"),
        }
    }

    #[test]
    fn completion_without_pending_goes_idle() {
        let mut s = state();
        let t0 = Utc::now();
        s.start(turn_at(t0, "a"), t0);
        assert!(matches!(s.finish(&TurnOutcome::Failed("x".into()), 2), Next::Idle));
        assert_eq!(s.phase(), Phase::Idle);
        assert_invariant(&s);
    }

    #[test]
    fn restart_keeps_start_time() {
        let mut s = state();
        let t0 = Utc::now();
        s.start(turn_at(t0, "a"), t0);
        s.finish(&TurnOutcome::Cancelled, 2);
        s.rearm();
        assert_eq!(s.snapshot().processing_started_at, Some(t0));
        assert!(!s.should_interrupt(t0 + chrono::Duration::seconds(6), TIMEOUT, 2));
    }

    #[test]
    fn abort_after_restart_returns_to_a_clean_idle() {
        let mut s = state();
        let t0 = Utc::now();
        let token = s.start(turn_at(t0, "a"), t0);
        s.offer(turn_at(t0 + chrono::Duration::seconds(1), "b"), TIMEOUT, 2);
        assert!(token.is_cancelled());
        assert!(matches!(s.finish(&TurnOutcome::Cancelled, 2), Next::Restart(_)));
        let restarted = s.rearm();
        assert_eq!(s.interrupt_count(), 1);

        s.abort();
        assert!(restarted.is_cancelled());
        assert_eq!(s.phase(), Phase::Idle);
        assert_eq!(s.interrupt_count(), 0);
        assert_invariant(&s);
    }
}
