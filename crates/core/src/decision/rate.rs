//! Adaptive response-probability model.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::config::ChatCfg;

#[derive(Debug, thiserror::Error)]
pub enum RateError {
    #[error("response rate lock poisoned")]
    Poisoned,
}

/// Bounds and gains of the rate model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateParams {
    pub min: f64,
    pub max: f64,
    pub mention_multiplier: f64,
    pub trigger_word_multiplier: f64,
    pub decay_rate_per_min: f64,
}

impl RateParams {
    /// Bounds are ordered and non-negative whatever the config says.
    pub fn from_cfg(cfg: &ChatCfg) -> Self {
        let (lo, hi) = ordered(cfg.response_rate_min, cfg.response_rate_max);
        Self {
            min: lo.max(0.0),
            max: hi.max(0.0),
            mention_multiplier: finite_or_zero(cfg.mention_multiplier),
            trigger_word_multiplier: finite_or_zero(cfg.trigger_word_multiplier),
            decay_rate_per_min: finite_or_zero(cfg.decay_rate_per_min).max(0.0),
        }
    }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    let a = finite_or_zero(a);
    let b = finite_or_zero(b);
    if a <= b { (a, b) } else { (b, a) }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() { v } else { 0.0 }
}

/// Probability of joining a conversation unprompted.
///
/// `current_rate` always stays within `[min, max]`.
#[derive(Debug, Clone)]
pub struct ResponseRateModel {
    params: RateParams,
    current_rate: f64,
    mention_count: u32,
    trigger_word_count: u32,
    last_interaction_at: DateTime<Utc>,
}

impl ResponseRateModel {
    pub fn new(params: RateParams, initial_rate: f64, now: DateTime<Utc>) -> Self {
        let mut model = Self {
            params,
            current_rate: params.min,
            mention_count: 0,
            trigger_word_count: 0,
            last_interaction_at: now,
        };
        model.current_rate = model.clamp(initial_rate);
        model
    }

    pub fn from_cfg(cfg: &ChatCfg, now: DateTime<Utc>) -> Self {
        Self::new(RateParams::from_cfg(cfg), cfg.initial_response_rate, now)
    }

    pub fn current_rate(&self) -> f64 {
        self.current_rate
    }

    pub fn params(&self) -> RateParams {
        self.params
    }

    pub fn record_mention(&mut self, now: DateTime<Utc>) {
        self.mention_count += 1;
        self.last_interaction_at = now;
    }

    pub fn record_trigger(&mut self, now: DateTime<Utc>) {
        self.trigger_word_count += 1;
        self.last_interaction_at = now;
    }

    /// Fold pending mentions/triggers and idle decay into the rate, then
    /// reset the counters.
    ///
    /// A rate sitting at the floor jumps straight to the ceiling on any
    /// interaction.
    pub fn adjust(&mut self, now: DateTime<Utc>) {
        let p = self.params;
        let idle_ms = (now - self.last_interaction_at).num_milliseconds().max(0);
        let minutes = idle_ms as f64 / 60_000.0;
        let decay = (1.0 - minutes * p.decay_rate_per_min).max(0.0);
        let interacted = self.mention_count > 0 || self.trigger_word_count > 0;

        self.current_rate = if self.current_rate <= p.min && interacted {
            p.max
        } else {
            let raw = (self.current_rate
                + self.mention_count as f64 * p.mention_multiplier
                + self.trigger_word_count as f64 * p.trigger_word_multiplier)
                * decay;
            self.clamp(raw)
        };
        self.mention_count = 0;
        self.trigger_word_count = 0;
    }

    pub fn boost(&mut self, amount: f64) {
        self.current_rate = self.clamp(self.current_rate + amount);
    }

    pub fn decay_by(&mut self, amount: f64) {
        self.current_rate = self.clamp(self.current_rate - amount);
    }

    fn clamp(&self, v: f64) -> f64 {
        if v.is_nan() {
            return self.params.min;
        }
        v.clamp(self.params.min, self.params.max)
    }
}

/// Rate model shared by a conversation's trigger evaluation, its decay
/// ticker and its running turn. Every mutation is a single critical section.
#[derive(Debug, Clone)]
pub struct SharedRate(Arc<Mutex<ResponseRateModel>>);

impl SharedRate {
    pub fn new(model: ResponseRateModel) -> Self {
        Self(Arc::new(Mutex::new(model)))
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut ResponseRateModel) -> T) -> Result<T, RateError> {
        let mut guard = self.0.lock().map_err(|_| RateError::Poisoned)?;
        Ok(f(&mut guard))
    }

    pub fn current(&self) -> Result<f64, RateError> {
        self.with(|m| m.current_rate())
    }

    pub fn adjust(&self, now: DateTime<Utc>) -> Result<f64, RateError> {
        self.with(|m| {
            m.adjust(now);
            m.current_rate()
        })
    }

    pub fn boost(&self, amount: f64) -> Result<f64, RateError> {
        self.with(|m| {
            m.boost(amount);
            m.current_rate()
        })
    }

    pub fn decay_by(&self, amount: f64) -> Result<f64, RateError> {
        self.with(|m| {
            m.decay_by(amount);
            m.current_rate()
        })
    }
}
