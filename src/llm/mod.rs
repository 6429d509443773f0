pub mod models;
pub mod pool;
pub mod prompts;
pub mod providers;
pub mod registry;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Sampling temperature for every backend call.
pub const TEMPERATURE: f32 = 0.0;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM connection error: {0}")]
    ConnectionError(String),
    #[error("LLM request timed out: {0}")]
    Timeout(String),
    #[error("LLM response error: {0}")]
    ResponseError(String),
    #[error("LLM configuration error: {0}")]
    ConfigError(String),
}

/// Text returned by a chat completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatReply {
    pub content: String,
    /// Thinking trace from reasoning models; empty when the backend has none.
    pub reasoning: String,
}

/// Per-client limits derived from the backend and the client's purpose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientSettings {
    pub max_tokens: u32,
    pub timeout: Duration,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_message: &str) -> Result<ChatReply, LlmError>;
}
