pub mod http;
pub mod invoker;
pub mod provider;
