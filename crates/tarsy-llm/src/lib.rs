//! Tarsy LLM - provider adapters, streaming, and the client that sits over them.

pub mod anthropic;
pub mod client;
pub mod google;
pub mod openai_compat;
pub mod provider;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use client::LlmClient;
pub use google::GoogleProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{LlmError, LlmProvider, LlmResult, LlmStream};
pub use types::*;
