pub mod action_loop;
pub mod deliberation;
pub mod prompt;
pub mod text;
pub mod tools;

use kuuki_llm::provider::LlmError;

use crate::io::StoreError;

pub use action_loop::{ActionLoop, TurnContext};
pub use deliberation::DeliberationStage;
pub use tools::{Action, ToolName, ToolRegistry};

/// Why a turn ended without completing.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// Preempted or shut down. Expected; the scheduler decides what follows.
    #[error("turn cancelled")]
    Cancelled,
    #[error("model backends exhausted: {0}")]
    BackendExhausted(LlmError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LlmError> for TurnError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Aborted => Self::Cancelled,
            other => Self::BackendExhausted(other),
        }
    }
}
