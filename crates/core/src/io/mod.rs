pub mod store;
pub mod tools;

pub use store::{InMemoryStore, RetrievalStore, SearchOptions, StoreError};
pub use tools::{RecordedCall, RecordingToolInvoker, ToolError, ToolInvoker};
