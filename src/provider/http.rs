//! OpenAI-compatible HTTP provider.
//!
//! [`HttpProvider`] translates normalized messages into the
//! `/v1/chat/completions` wire format used by OpenAI-compatible gateways.
//! Streaming uses SSE with `choices[0].delta.content` per event, decoded
//! through the buffered [`StreamDecoder`](crate::streaming::StreamDecoder).

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

use super::{Completion, Content, Message, Part, Provider, RequestParams, TokenChunk, TokenSink};
use crate::error::{EngineError, Result};
use crate::streaming::StreamDecoder;

/// Provider for OpenAI-compatible chat completion endpoints.
///
/// # Example
///
/// ```
/// use inferchain::provider::HttpProvider;
///
/// let provider = HttpProvider::new("https://api.example.com", "gpt-4o-mini")
///     .with_api_key("sk-...");
/// ```
pub struct HttpProvider {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    streaming: bool,
}

impl HttpProvider {
    /// Create a provider against `base_url` (scheme and host, no path) for
    /// the given model.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            streaming: true,
        }
    }

    /// Authenticate with `Authorization: Bearer {key}`.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Use a custom HTTP client (pooling, proxies, timeouts).
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Advertise the endpoint as non-streaming.
    pub fn without_streaming(mut self) -> Self {
        self.streaming = false;
        self
    }

    fn part_to_json(part: &Part) -> Value {
        match part {
            Part::Text(text) => json!({"type": "text", "text": text}),
            Part::ImageBytes { mime, data } => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(data);
                json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:{mime};base64,{encoded}")}
                })
            }
            Part::ImageUri(uri) => json!({"type": "image_url", "image_url": {"url": uri}}),
        }
    }

    fn build_body(&self, messages: &[Message], params: &RequestParams, stream: bool) -> Value {
        let wire_messages: Vec<Value> = messages
            .iter()
            .map(|m| {
                let content = match &m.content {
                    Content::Text(text) => Value::String(text.clone()),
                    Content::Parts(parts) => {
                        Value::Array(parts.iter().map(Self::part_to_json).collect())
                    }
                };
                json!({"role": m.role.as_str(), "content": content})
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
            "stream": stream,
        });
        if let Some(t) = params.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = params.max_tokens {
            body["max_tokens"] = json!(m);
        }
        if let Some(Value::Object(extra)) = &params.extra {
            if let Some(base) = body.as_object_mut() {
                for (k, v) in extra {
                    base.insert(k.clone(), v.clone());
                }
            }
        }
        body
    }

    fn parse_retry_after(value: &str) -> Option<Duration> {
        value.trim().parse::<u64>().ok().map(Duration::from_secs)
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await.map_err(|e| EngineError::Inference {
            message: format!("failed to reach provider at {url}: {e}"),
            status_code: None,
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(Self::parse_retry_after);
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Http {
                status,
                body,
                retry_after,
            });
        }
        Ok(resp)
    }

    fn extract_usage(value: &Value) -> (Option<u64>, Option<u64>) {
        let usage = value.get("usage");
        let prompt = usage
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(Value::as_u64);
        let completion = usage
            .and_then(|u| u.get("completion_tokens"))
            .and_then(Value::as_u64);
        (prompt, completion)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn complete(&self, messages: &[Message], params: &RequestParams) -> Result<Completion> {
        let body = self.build_body(messages, params, false);
        let resp = self.post(&body).await?;
        let value: Value = resp.json().await?;

        let text = value["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .unwrap_or("")
            .to_string();
        let finish_reason = value["choices"]
            .get(0)
            .and_then(|c| c["finish_reason"].as_str())
            .map(str::to_string);
        let (tokens_prompt, tokens_completion) = Self::extract_usage(&value);

        Ok(Completion {
            text,
            model: value["model"].as_str().map(str::to_string),
            finish_reason,
            tokens_prompt,
            tokens_completion,
        })
    }

    async fn stream(
        &self,
        messages: &[Message],
        params: &RequestParams,
        on_token: TokenSink<'_>,
    ) -> Result<Completion> {
        let body = self.build_body(messages, params, true);
        let resp = self.post(&body).await?;

        let mut stream = resp.bytes_stream();
        let mut decoder = StreamDecoder::new();
        let mut accumulated = String::new();
        let mut index: u64 = 0;
        let mut finish_reason = None;
        let mut model = None;
        let mut usage = (None, None);

        let mut consume = |value: Value,
                           accumulated: &mut String,
                           index: &mut u64,
                           on_token: &mut (dyn FnMut(TokenChunk) + Send)| {
            if let Some(delta) = value["choices"]
                .get(0)
                .and_then(|c| c["delta"]["content"].as_str())
            {
                if !delta.is_empty() {
                    accumulated.push_str(delta);
                    on_token(TokenChunk {
                        delta: delta.to_string(),
                        index: Some(*index),
                        done: false,
                    });
                    *index += 1;
                }
            }
            if let Some(reason) = value["choices"]
                .get(0)
                .and_then(|c| c["finish_reason"].as_str())
            {
                finish_reason = Some(reason.to_string());
            }
            if let Some(m) = value["model"].as_str() {
                model = Some(m.to_string());
            }
            let (p, c) = Self::extract_usage(&value);
            if p.is_some() || c.is_some() {
                usage = (p, c);
            }
        };

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(EngineError::Request)?;
            for value in decoder.decode(&chunk) {
                consume(value, &mut accumulated, &mut index, on_token);
            }
        }
        if let Some(value) = decoder.flush() {
            consume(value, &mut accumulated, &mut index, on_token);
        }

        on_token(TokenChunk {
            delta: String::new(),
            index: Some(index),
            done: true,
        });

        Ok(Completion {
            text: accumulated,
            model,
            finish_reason,
            tokens_prompt: usage.0,
            tokens_completion: usage.1,
        })
    }
}
