mod agent;
mod pipeline;
mod scheduler;
mod shutdown;

pub use agent::{Agent, AgentHandle};
pub use pipeline::{TurnEnv, TurnPipeline, TurnRunner};
pub use scheduler::{SchedulerHandle, TurnScheduler};
pub use shutdown::ShutdownGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime stopped")]
    Closed,
}
