pub mod conversation;
pub mod interrupt;

pub use conversation::{ConversationSnapshot, ConversationState, Next, Offer, Phase, TurnOutcome};
pub use interrupt::InterruptController;
