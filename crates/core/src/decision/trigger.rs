//! Deterministic trigger rules with a random fallback.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ChatCfg;
use crate::decision::rate::RateError;
use crate::dialogue::ConversationState;
use crate::io::RetrievalStore;
use crate::types::{ChatKind, ChatMessage, ContextItem, Decision, DecisionKind};

/// Source of uniform samples in `[0, 1)` for the random rule.
pub trait Sampler: Send + Sync {
    fn sample(&mut self) -> f64;
}

pub struct RandomSampler(StdRng);

impl RandomSampler {
    pub fn from_entropy() -> Self {
        Self(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl Sampler for RandomSampler {
    fn sample(&mut self) -> f64 {
        self.0.gen_range(0.0..1.0)
    }
}

/// Always returns the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedSampler(pub f64);

impl Sampler for FixedSampler {
    fn sample(&mut self) -> f64 {
        self.0
    }
}

/// Decides whether a conversation should act on an inbound message.
///
/// Rules, first match wins: private chat, mention, follow-up to the bot,
/// trigger word, cooldown, ignore words, random draw against the current rate.
/// The four acting rules bypass cooldown and ignore words.
pub struct TriggerEvaluator {
    cfg: Arc<ChatCfg>,
    sampler: Box<dyn Sampler>,
}

impl TriggerEvaluator {
    pub fn new(cfg: Arc<ChatCfg>, sampler: Box<dyn Sampler>) -> Self {
        Self { cfg, sampler }
    }

    /// Never fails: internal errors yield a skip with scene `"error"`.
    pub async fn evaluate(
        &mut self,
        msg: &ChatMessage,
        state: &mut ConversationState,
        store: &dyn RetrievalStore,
        now: DateTime<Utc>,
    ) -> Decision {
        match self.try_evaluate(msg, state, store, now).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(chat_id = msg.chat_id, message_id = msg.id, error = %e, "trigger evaluation failed");
                Decision::pass("error")
            }
        }
    }

    async fn try_evaluate(
        &mut self,
        msg: &ChatMessage,
        state: &mut ConversationState,
        store: &dyn RetrievalStore,
        now: DateTime<Utc>,
    ) -> Result<Decision, RateError> {
        if msg.chat_kind == ChatKind::Private {
            record_mention(state, now)?;
            return Ok(Decision::act(DecisionKind::Private, "private chat"));
        }

        let name = &msg.author.display_name;
        let addressed = if self.is_mention(msg) {
            record_mention(state, now)?;
            Some(Decision::act(DecisionKind::Mention, format!("{name} mentioned you")))
        } else if self.is_follow_up(msg, store).await {
            record_mention(state, now)?;
            Some(Decision::act(
                DecisionKind::FollowUp,
                format!("{name} is following up on something you said"),
            ))
        } else if let Some(word) = first_match(&msg.text, &self.cfg.trigger_words) {
            state.rate.with(|m| {
                m.record_trigger(now);
                m.adjust(now);
            })?;
            Some(Decision::act(DecisionKind::Trigger, format!("{name} said \"{word}\"")))
        } else {
            None
        };
        if let Some(decision) = addressed {
            state.last_acted_at = Some(now);
            return Ok(decision);
        }

        let cooldown_ms = i64::try_from(self.cfg.cooldown_ms).unwrap_or(i64::MAX);
        if let Some(last) = state.last_acted_at
            && (now - last).num_milliseconds() < cooldown_ms
        {
            return Ok(Decision::pass("cooldown"));
        }

        if first_match(&msg.text, &self.cfg.ignore_words).is_some() {
            return Ok(Decision::pass("ignore word matched"));
        }

        let rate = state.rate.current()?;
        let roll = self.sampler.sample();
        if roll >= rate {
            return Ok(Decision::pass("no trigger condition met"));
        }
        tracing::debug!(chat_id = msg.chat_id, rate, roll, "random trigger");
        state.last_acted_at = Some(now);
        Ok(Decision::act(DecisionKind::Random, "the conversation caught your interest"))
    }

    fn is_mention(&self, msg: &ChatMessage) -> bool {
        let handle = format!("@{}", self.cfg.bot_username);
        let by_handle = !self.cfg.bot_username.is_empty() && msg.text.contains(&handle);
        let by_reply = msg
            .reply_to
            .as_ref()
            .is_some_and(|r| r.author.id == self.cfg.bot_user_id);
        by_handle || by_reply
    }

    /// The author is someone the bot replied to within the recent context.
    /// Store failures skip this rule.
    async fn is_follow_up(&self, msg: &ChatMessage, store: &dyn RetrievalStore) -> bool {
        let context = match store.get_context(msg.chat_id, msg.id, self.cfg.context_limit).await {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(chat_id = msg.chat_id, error = %e, "follow-up check skipped");
                return false;
            }
        };
        replied_authors(&context).contains(&msg.author.id)
    }
}

fn record_mention(state: &ConversationState, now: DateTime<Utc>) -> Result<(), RateError> {
    state.rate.with(|m| {
        m.record_mention(now);
        m.adjust(now);
    })
}

/// First configured word found in `text`.
fn first_match<'a>(text: &str, words: &'a [String]) -> Option<&'a str> {
    words
        .iter()
        .map(String::as_str)
        .find(|w| !w.is_empty() && text.contains(w))
}

/// Authors of messages the bot answered with a reply in `context`.
fn replied_authors(context: &[ContextItem]) -> HashSet<i64> {
    let replied: HashSet<i64> = context
        .iter()
        .filter_map(|item| match item {
            ContextItem::BotReply { reply_to_message_id: Some(id), .. } => Some(*id),
            _ => None,
        })
        .collect();
    context
        .iter()
        .filter_map(|item| match item {
            ContextItem::Message { message_id, author, .. } if replied.contains(message_id) => {
                Some(author.id)
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::rate::{ResponseRateModel, SharedRate};
    use crate::io::InMemoryStore;
    use crate::types::{Author, ReplyRef};
    use tokio_util::sync::CancellationToken;

    const BOT_ID: i64 = 999;

    fn cfg() -> Arc<ChatCfg> {
        let mut cfg = ChatCfg::default();
        cfg.bot_user_id = BOT_ID;
        cfg.bot_username = "kuuki_bot".into();
        cfg.trigger_words = vec!["weather".into()];
        cfg.ignore_words = vec!["spoiler".into()];
        Arc::new(cfg)
    }

    fn state(cfg: &ChatCfg, initial_rate: f64) -> ConversationState {
        let mut model = ResponseRateModel::from_cfg(cfg, Utc::now());
        model.boost(initial_rate - model.current_rate());
        ConversationState::new(-1, SharedRate::new(model), CancellationToken::new())
    }

    fn group(id: i64, text: &str) -> ChatMessage {
        ChatMessage::group(-1, id, Author::new(10, "ann"), text)
    }

    #[tokio::test]
    async fn private_chat_always_acts() {
        let cfg = cfg();
        let mut eval = TriggerEvaluator::new(cfg.clone(), Box::new(FixedSampler(0.99)));
        let mut st = state(&cfg, 0.05);
        st.last_acted_at = Some(Utc::now());
        let msg = ChatMessage::private(10, 1, Author::new(10, "ann"), "spoiler hello");

        let d = eval.evaluate(&msg, &mut st, &InMemoryStore::new(), Utc::now()).await;
        assert!(d.should_act);
        assert_eq!(d.kind, DecisionKind::Private);
    }

    #[tokio::test]
    async fn private_chat_raises_rate() {
        let cfg = cfg();
        let mut eval = TriggerEvaluator::new(cfg.clone(), Box::new(FixedSampler(0.99)));
        let mut st = state(&cfg, 0.05);
        let msg = ChatMessage::private(10, 1, Author::new(10, "ann"), "hello");

        eval.evaluate(&msg, &mut st, &InMemoryStore::new(), Utc::now()).await;
        assert_eq!(st.rate.current().unwrap(), 0.7);
    }

    #[tokio::test]
    async fn mention_overrides_cooldown() {
        let cfg = cfg();
        let mut eval = TriggerEvaluator::new(cfg.clone(), Box::new(FixedSampler(0.99)));
        let mut st = state(&cfg, 0.05);
        let now = Utc::now();
        st.last_acted_at = Some(now - chrono::Duration::milliseconds(500));

        let d = eval.evaluate(&group(1, "@kuuki_bot hi"), &mut st, &InMemoryStore::new(), now).await;
        assert!(d.should_act);
        assert_eq!(d.kind, DecisionKind::Mention);
        assert_eq!(st.last_acted_at, Some(now));
    }

    #[tokio::test]
    async fn cooldown_blocks_random_acting() {
        let cfg = cfg();
        let mut eval = TriggerEvaluator::new(cfg.clone(), Box::new(FixedSampler(0.0)));
        let mut st = state(&cfg, 0.05);
        let now = Utc::now();
        st.last_acted_at = Some(now - chrono::Duration::milliseconds(500));

        let d = eval.evaluate(&group(1, "hello all"), &mut st, &InMemoryStore::new(), now).await;
        assert!(!d.should_act);
        assert_eq!(d.scene, "cooldown");
        assert_eq!(d.kind, DecisionKind::Normal);
        assert_eq!(st.rate.current().unwrap(), 0.05);
    }

    #[tokio::test]
    async fn huge_cooldown_still_blocks() {
        let cfg = Arc::new(ChatCfg { cooldown_ms: u64::MAX, ..(*cfg()).clone() });
        let mut eval = TriggerEvaluator::new(cfg.clone(), Box::new(FixedSampler(0.0)));
        let mut st = state(&cfg, 0.05);
        let now = Utc::now();
        st.last_acted_at = Some(now - chrono::Duration::days(30));

        let d = eval.evaluate(&group(1, "hello all"), &mut st, &InMemoryStore::new(), now).await;
        assert_eq!(d.scene, "cooldown");
    }

    #[tokio::test]
    async fn ignore_words_skip_random_acting() {
        let cfg = cfg();
        let mut eval = TriggerEvaluator::new(cfg.clone(), Box::new(FixedSampler(0.0)));
        let mut st = state(&cfg, 0.05);
        let d = eval
            .evaluate(&group(1, "spoiler alert"), &mut st, &InMemoryStore::new(), Utc::now())
            .await;
        assert!(!d.should_act);
        assert_eq!(d.scene, "ignore word matched");
    }

    #[tokio::test]
    async fn trigger_word_wins_over_ignore_word() {
        let cfg = cfg();
        let mut eval = TriggerEvaluator::new(cfg.clone(), Box::new(FixedSampler(0.99)));
        let mut st = state(&cfg, 0.05);
        let d = eval
            .evaluate(&group(1, "weather spoiler"), &mut st, &InMemoryStore::new(), Utc::now())
            .await;
        assert!(d.should_act);
        assert_eq!(d.kind, DecisionKind::Trigger);
    }

    #[tokio::test]
    async fn mention_beats_trigger_word_and_raises_rate() {
        let cfg = cfg();
        let mut eval = TriggerEvaluator::new(cfg.clone(), Box::new(FixedSampler(0.99)));
        let mut st = state(&cfg, 0.05);
        let now = Utc::now();

        let d = eval
            .evaluate(&group(1, "@kuuki_bot how is the weather"), &mut st, &InMemoryStore::new(), now)
            .await;
        assert!(d.should_act);
        assert_eq!(d.kind, DecisionKind::Mention);
        assert_eq!(st.rate.current().unwrap(), 0.7);
        assert_eq!(st.last_acted_at, Some(now));
    }

    #[tokio::test]
    async fn reply_to_bot_counts_as_mention() {
        let cfg = cfg();
        let mut eval = TriggerEvaluator::new(cfg.clone(), Box::new(FixedSampler(0.99)));
        let mut st = state(&cfg, 0.05);
        let msg = group(2, "really?").replying_to(ReplyRef {
            message_id: 1,
            author: Author::new(BOT_ID, "kuuki"),
            text: Some("it rains".into()),
        });
        let d = eval.evaluate(&msg, &mut st, &InMemoryStore::new(), Utc::now()).await;
        assert_eq!(d.kind, DecisionKind::Mention);
    }

    #[tokio::test]
    async fn follow_up_detected_from_context() {
        let cfg = cfg();
        let store = InMemoryStore::new();
        store.push(-1, ContextItem::from_message(&group(1, "any news?"))).unwrap();
        store
            .push(-1, ContextItem::BotReply { text: "none".into(), reply_to_message_id: Some(1), at: None })
            .unwrap();
        let next = group(2, "ok thanks");
        store.push(-1, ContextItem::from_message(&next)).unwrap();

        let mut eval = TriggerEvaluator::new(cfg.clone(), Box::new(FixedSampler(0.99)));
        let mut st = state(&cfg, 0.05);
        let d = eval.evaluate(&next, &mut st, &store, Utc::now()).await;
        assert!(d.should_act);
        assert_eq!(d.kind, DecisionKind::FollowUp);
        assert_eq!(st.rate.current().unwrap(), 0.7);
    }

    #[tokio::test]
    async fn trigger_word_acts() {
        let cfg = cfg();
        let mut eval = TriggerEvaluator::new(cfg.clone(), Box::new(FixedSampler(0.99)));
        let mut st = state(&cfg, 0.05);
        let d = eval
            .evaluate(&group(1, "nice weather today"), &mut st, &InMemoryStore::new(), Utc::now())
            .await;
        assert_eq!(d.kind, DecisionKind::Trigger);
        assert_eq!(d.scene, "ann said \"weather\"");
    }

    #[tokio::test]
    async fn random_rule_compares_sample_with_rate() {
        let cfg = cfg();
        let store = InMemoryStore::new();

        let mut low = TriggerEvaluator::new(cfg.clone(), Box::new(FixedSampler(0.9)));
        let mut st = state(&cfg, 0.05);
        let d = low.evaluate(&group(1, "hello all"), &mut st, &store, Utc::now()).await;
        assert!(!d.should_act);
        assert_eq!(d.scene, "no trigger condition met");
        assert_eq!(st.last_acted_at, None);

        let mut high = TriggerEvaluator::new(cfg.clone(), Box::new(FixedSampler(0.01)));
        let d = high.evaluate(&group(2, "hello all"), &mut st, &store, Utc::now()).await;
        assert!(d.should_act);
        assert_eq!(d.kind, DecisionKind::Random);
    }

    #[test]
    fn random_sampler_stays_in_unit_interval() {
        let mut s = RandomSampler::seeded(7);
        for _ in 0..1000 {
            let v = s.sample();
            assert!((0.0..1.0).contains(&v));
        }
    }
}
