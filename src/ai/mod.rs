pub mod claude;
pub mod prompts;
pub mod structured;

pub use claude::ClaudeClient;
pub use structured::complete_structured;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use crate::data::http::FetchError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One chat completion: optional system prompt plus the conversation so far
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
}

impl LlmRequest {
    pub fn new(system: &str, user: impl Into<String>) -> Self {
        Self {
            system: Some(system.to_string()),
            messages: vec![ChatMessage::user(user)],
        }
    }

    /// Last user turn, handy for logging and fakes
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }
}

/// Text-completion seam; scoring and estimation only see this trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        request: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError>;
}
