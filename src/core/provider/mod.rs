//! The completion provider seam.
//!
//! The core only needs a lazy, finite stream of [`StreamEvent`]s. How those
//! are produced (HTTP, SSE, a test script) is the adapter's business.

pub mod openai;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::core::message::{Role, Usage};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Usage(Usage),
    Error(String),
}

/// Not restartable. Dropping it, or cancelling the token handed to the
/// provider, releases everything the provider holds for the request.
pub type CompletionStream = BoxStream<'static, StreamEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

impl PromptRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptRole::System => "system",
            PromptRole::User => "user",
            PromptRole::Assistant => "assistant",
        }
    }
}

impl From<Role> for PromptRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => PromptRole::User,
            Role::Assistant => PromptRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: PromptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    /// History messages between the system prompt and the active turn.
    pub fn context(&self) -> &[PromptMessage] {
        let start = usize::from(
            self.messages
                .first()
                .is_some_and(|m| m.role == PromptRole::System),
        );
        let end = self.messages.len().saturating_sub(1).max(start);
        &self.messages[start..end]
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Connection failed: {0}")]
    Transport(String),

    #[error("{0}")]
    Api(String),

    #[error("No API key found in ${0}")]
    MissingApiKey(String),
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: Vec<PromptMessage>) -> CompletionRequest {
        CompletionRequest {
            model: "m".into(),
            messages,
            temperature: 0.7,
            max_tokens: None,
        }
    }

    #[test]
    fn context_excludes_system_prompt_and_active_turn() {
        let req = request(vec![
            PromptMessage::new(PromptRole::System, "be brief"),
            PromptMessage::new(PromptRole::User, "U1"),
            PromptMessage::new(PromptRole::Assistant, "A1"),
            PromptMessage::new(PromptRole::User, "U2"),
        ]);
        let context: Vec<&str> = req.context().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(context, vec!["U1", "A1"]);
    }

    #[test]
    fn context_is_empty_for_a_lone_turn() {
        assert!(request(vec![PromptMessage::new(PromptRole::User, "hi")])
            .context()
            .is_empty());
        assert!(request(vec![
            PromptMessage::new(PromptRole::System, "p"),
            PromptMessage::new(PromptRole::User, "hi"),
        ])
        .context()
        .is_empty());
    }
}
