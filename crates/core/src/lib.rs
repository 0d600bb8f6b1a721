pub mod cognition;
pub mod config;
pub mod decision;
pub mod dialogue;
pub mod io;
pub mod runtime;
pub mod types;
