//! Mock provider for testing without a live endpoint.
//!
//! [`MockProvider`] returns pre-configured responses in order, echoes the
//! user message, or fails on request — allowing deterministic tests of the
//! dispatch, retry, and enforcement paths.
//!
//! # Example
//!
//! ```
//! use inferchain::provider::MockProvider;
//!
//! let mock = MockProvider::new(vec!["Hello, world!".to_string()]);
//! let echo = MockProvider::echo();
//! ```

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{Completion, Message, Provider, RequestParams, Role, TokenChunk, TokenSink};
use crate::error::{EngineError, Result};

/// A test provider with canned responses and scriptable failures.
///
/// Canned responses cycle from the beginning when exhausted. In echo mode
/// the provider returns the text of the last user message, which keeps
/// expectations stable under concurrent dispatch. For streaming, the full
/// response is emitted as a single token followed by a terminal chunk.
#[derive(Debug)]
pub struct MockProvider {
    responses: Vec<String>,
    index: AtomicUsize,
    echo: bool,
    streaming: bool,
    fail_remaining: AtomicU32,
    fail_status: u16,
    stream_fail_remaining: AtomicU32,
    stream_fail_status: u16,
}

impl MockProvider {
    /// Canned responses, returned in order and cycling when exhausted.
    pub fn new(responses: Vec<String>) -> Self {
        assert!(
            !responses.is_empty(),
            "MockProvider requires at least one response"
        );
        Self {
            responses,
            index: AtomicUsize::new(0),
            echo: false,
            streaming: true,
            fail_remaining: AtomicU32::new(0),
            fail_status: 0,
            stream_fail_remaining: AtomicU32::new(0),
            stream_fail_status: 0,
        }
    }

    /// Always return the same response.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Echo the last user message back as the completion text.
    ///
    /// Order-independent, so safe under concurrent dispatch.
    pub fn echo() -> Self {
        let mut mock = Self::new(vec![String::new()]);
        mock.echo = true;
        mock
    }

    /// Disable the streaming capability.
    pub fn without_streaming(mut self) -> Self {
        self.streaming = false;
        self
    }

    /// Fail the next `times` calls (regular and streaming) with the given
    /// HTTP status before serving responses.
    pub fn with_failures(self, times: u32, status: u16) -> Self {
        self.fail_remaining.store(times, Ordering::Relaxed);
        Self {
            fail_status: status,
            ..self
        }
    }

    /// Fail the next `times` streaming calls, before any token is emitted.
    /// Regular calls are unaffected.
    pub fn with_stream_failures(self, times: u32, status: u16) -> Self {
        self.stream_fail_remaining.store(times, Ordering::Relaxed);
        Self {
            stream_fail_status: status,
            ..self
        }
    }

    fn next_response(&self, messages: &[Message]) -> String {
        if self.echo {
            return messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.text())
                .unwrap_or_default();
        }
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.responses.len();
        self.responses[idx].clone()
    }

    fn take_failure(&self, remaining: &AtomicU32, status: u16) -> Result<()> {
        let prev = remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .unwrap_or(0);
        if prev > 0 {
            return Err(EngineError::Http {
                status,
                body: "scripted failure".into(),
                retry_after: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn complete(&self, messages: &[Message], _params: &RequestParams) -> Result<Completion> {
        self.take_failure(&self.fail_remaining, self.fail_status)?;
        let text = self.next_response(messages);
        Ok(Completion {
            text,
            model: Some("mock".into()),
            ..Completion::default()
        })
    }

    async fn stream(
        &self,
        messages: &[Message],
        _params: &RequestParams,
        on_token: TokenSink<'_>,
    ) -> Result<Completion> {
        self.take_failure(&self.fail_remaining, self.fail_status)?;
        self.take_failure(&self.stream_fail_remaining, self.stream_fail_status)?;
        let text = self.next_response(messages);
        on_token(TokenChunk {
            delta: text.clone(),
            index: Some(0),
            done: false,
        });
        on_token(TokenChunk {
            delta: String::new(),
            index: Some(1),
            done: true,
        });
        Ok(Completion {
            text,
            model: Some("mock".into()),
            ..Completion::default()
        })
    }
}
