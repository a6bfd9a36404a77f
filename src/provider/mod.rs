//! Provider trait and normalized request/response types.
//!
//! The [`Provider`] trait abstracts over LLM endpoints, translating between
//! the normalized message model and provider-specific APIs. Built-in
//! implementations: [`HttpProvider`] (OpenAI-compatible), [`MockProvider`]
//! (deterministic tests).
//!
//! ## Architecture
//!
//! ```text
//! dispatcher ──► [Message] ──► Provider::complete()/stream() ──► Completion
//!                                        │
//!                             ┌──────────┴──────────┐
//!                        HttpProvider           MockProvider
//!                        /v1/chat/completions   canned responses
//! ```

pub mod http;
pub mod mock;

pub use http::HttpProvider;
pub use mock::MockProvider;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// The role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant (model) response.
    Assistant,
    /// Tool output echoed into the conversation.
    Tool,
}

impl Role {
    /// Wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One part of a multimodal message body.
#[derive(Debug, Clone)]
pub enum Part {
    /// Plain text.
    Text(String),
    /// Inline image bytes.
    ImageBytes {
        /// Mime type of the image.
        mime: String,
        /// Raw image bytes.
        data: Vec<u8>,
    },
    /// Image referenced by URI.
    ImageUri(String),
}

/// Message content: a plain string or an ordered list of parts.
#[derive(Debug, Clone)]
pub enum Content {
    /// Text-only content.
    Text(String),
    /// Multimodal content.
    Parts(Vec<Part>),
}

impl Content {
    /// The textual portion of the content, concatenating text parts.
    pub fn text(&self) -> String {
        match self {
            Content::Text(t) => t.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    Part::Text(t) => Some(t.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone)]
pub struct Message {
    /// The role of the message author.
    pub role: Role,
    /// The message content.
    pub content: Content,
}

impl Message {
    /// A system message with plain text content.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Content::Text(text.into()),
        }
    }

    /// A user message with plain text content.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::Text(text.into()),
        }
    }

    /// A user message with multimodal parts.
    pub fn user_parts(parts: Vec<Part>) -> Self {
        Self {
            role: Role::User,
            content: Content::Parts(parts),
        }
    }

    /// An assistant message with plain text content.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(text.into()),
        }
    }
}

/// Provider-agnostic request parameters.
#[derive(Debug, Clone, Default)]
pub struct RequestParams {
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Provider-opaque extras merged into the request body.
    pub extra: Option<Value>,
}

/// A provider-returned completion.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    /// The generated text.
    pub text: String,
    /// Model that produced the completion, when reported.
    pub model: Option<String>,
    /// Why generation stopped, when reported.
    pub finish_reason: Option<String>,
    /// Prompt token count, when reported.
    pub tokens_prompt: Option<u64>,
    /// Completion token count, when reported.
    pub tokens_completion: Option<u64>,
}

/// A streaming atom: one delta of generated text.
#[derive(Debug, Clone)]
pub struct TokenChunk {
    /// The delta text.
    pub delta: String,
    /// Provider-assigned chunk index, when reported.
    pub index: Option<u64>,
    /// Whether this is the terminal chunk.
    pub done: bool,
}

/// Callback invoked for each streaming token as it arrives.
pub type TokenSink<'a> = &'a mut (dyn FnMut(TokenChunk) + Send);

/// Abstraction over LLM endpoints.
///
/// Implementors translate between the normalized message model and the
/// endpoint's API. The trait is object-safe and designed to be used as
/// `Arc<dyn Provider>`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &str;

    /// Whether the endpoint can stream tokens.
    fn supports_streaming(&self) -> bool;

    /// Execute a non-streaming call.
    async fn complete(&self, messages: &[Message], params: &RequestParams) -> Result<Completion>;

    /// Execute a streaming call.
    ///
    /// `on_token` is called for each token as it arrives. The final
    /// accumulated text is returned as a [`Completion`].
    async fn stream(
        &self,
        messages: &[Message],
        params: &RequestParams,
        on_token: TokenSink<'_>,
    ) -> Result<Completion>;
}

/// Fast completion-token estimate used when the provider reports no counts:
/// whitespace-separated word count. Documented as approximate.
pub fn estimate_tokens_out(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_names() {
        assert_eq!(Role::System.as_str(), "system");
        assert_eq!(Role::Tool.as_str(), "tool");
    }

    #[test]
    fn test_content_text_joins_parts() {
        let content = Content::Parts(vec![
            Part::Text("one".into()),
            Part::ImageUri("http://img".into()),
            Part::Text("two".into()),
        ]);
        assert_eq!(content.text(), "one\ntwo");
    }

    #[test]
    fn test_message_constructors() {
        let m = Message::user("hi");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.content.text(), "hi");
    }

    #[test]
    fn test_estimate_tokens_out() {
        assert_eq!(estimate_tokens_out(""), 0);
        assert_eq!(estimate_tokens_out("three word line"), 3);
    }
}
