pub mod rate;
pub mod trigger;

pub use rate::{RateError, RateParams, ResponseRateModel, SharedRate};
pub use trigger::{FixedSampler, RandomSampler, Sampler, TriggerEvaluator};
