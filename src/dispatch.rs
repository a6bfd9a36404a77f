//! Inference dispatch: the mode/fallback/telemetry contract.
//!
//! [`invoke_with_mode`] is the single entry point every model call goes
//! through. It resolves the effective inference mode, checks the provider's
//! streaming capability, runs the call under transport retry, falls back
//! from streaming to regular where the contract allows, and returns a
//! [`Completion`] together with per-call [`InferenceTelemetry`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::events::{emit, Event, EventHandler};
use crate::provider::{estimate_tokens_out, Completion, Message, Provider, RequestParams};
use crate::retry::{self, BackoffStreamOpts, RetryPolicy};

/// Well-known environment variable overriding every in-config inference mode.
pub const MODE_ENV_VAR: &str = "INFERCHAIN_INFER_MODE";

/// The provider call style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferMode {
    /// Stream when the provider is capable, fall back to regular otherwise.
    #[default]
    Auto,
    /// Plain completion call; never requests streaming.
    Regular,
    /// Streaming required; fails when the provider cannot stream.
    Stream,
}

impl InferMode {
    /// Parse a mode name, accepting the common aliases.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "default" => Ok(InferMode::Auto),
            "regular" | "sync" | "standard" => Ok(InferMode::Regular),
            "stream" | "streaming" => Ok(InferMode::Stream),
            other => Err(EngineError::Config(format!(
                "unsupported inference mode: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for InferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InferMode::Auto => "auto",
            InferMode::Regular => "regular",
            InferMode::Stream => "stream",
        };
        f.write_str(name)
    }
}

/// Immutable per-run context for mode resolution.
///
/// The environment override is read exactly once at construction and never
/// re-read per call.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    mode_override: Option<InferMode>,
}

impl RuntimeContext {
    /// Read the mode override from [`MODE_ENV_VAR`], once.
    pub fn from_env() -> Result<Self> {
        let mode_override = match std::env::var(MODE_ENV_VAR) {
            Ok(value) if !value.trim().is_empty() => Some(InferMode::parse(&value)?),
            _ => None,
        };
        Ok(Self { mode_override })
    }

    /// A context with an explicit override, for tests and embedding.
    pub fn with_override(mode: Option<InferMode>) -> Self {
        Self {
            mode_override: mode,
        }
    }

    /// Resolve the effective mode. Precedence, highest first: environment
    /// override, explicit caller argument, step field, `Auto`.
    pub fn resolve_mode(&self, caller: Option<InferMode>, step: Option<InferMode>) -> InferMode {
        self.mode_override
            .or(caller)
            .or(step)
            .unwrap_or(InferMode::Auto)
    }
}

/// Per-call measurement record.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceTelemetry {
    /// Whether the call actually streamed tokens.
    pub streaming: bool,
    /// The mode the call resolved to after capability checks and fallback.
    pub selected_mode: InferMode,
    /// Why the call fell back from streaming, when it did.
    pub fallback_reason: Option<String>,
    /// Dispatch to first token (streaming) or to completion (regular).
    pub ttfb_ms: u64,
    /// Dispatch to completion.
    pub latency_ms: u64,
    /// Number of streamed deltas (1 for a non-empty regular completion).
    pub chunk_count: u64,
    /// Completion tokens: provider-reported when present, otherwise a
    /// whitespace estimate.
    pub tokens_out: u64,
    /// Transport retries beyond the first attempt, across all phases.
    pub retries: u32,
}

/// Inputs to [`invoke_with_mode`] beyond the messages themselves.
pub struct DispatchContext<'a> {
    /// The requested (already precedence-resolved) mode.
    pub mode: InferMode,
    /// Transport retry policy.
    pub policy: &'a RetryPolicy,
    /// Label for counters and events, normally the step id.
    pub label: String,
    /// Position of the unit being processed, for events.
    pub unit_index: usize,
    /// Cancellation flag shared with the executor.
    pub cancel: Option<&'a AtomicBool>,
    /// Optional lifecycle event handler.
    pub events: Option<Arc<dyn EventHandler>>,
}

#[derive(Default)]
struct StreamRecorder {
    chunks: Vec<String>,
    first_token_at: Option<Instant>,
}

impl StreamRecorder {
    fn reset(&mut self) {
        self.chunks.clear();
        self.first_token_at = None;
    }
}

/// Dispatch one model call under the mode/fallback contract.
///
/// Behaviour by requested mode:
/// - `Regular` — provider completion under retry; never streams.
/// - `Stream` — requires `supports_streaming()`; a missing capability fails
///   with a provider error and no regular attempt is made. A failure after
///   any token was emitted is an inference error.
/// - `Auto` — streams when capable. A stream failure before the first token
///   falls back to regular with `fallback_reason = "stream_error:<code>"`;
///   a missing capability runs regular with
///   `fallback_reason = "streaming_unsupported"`.
///
/// Partial tokens from a failed or fallen-back stream attempt are discarded
/// and do not count toward `tokens_out`. Cancellation aborts with a
/// cancelled error; partial tokens are discarded.
pub async fn invoke_with_mode(
    provider: &dyn Provider,
    messages: &[Message],
    params: &RequestParams,
    ctx: DispatchContext<'_>,
) -> Result<(Completion, InferenceTelemetry)> {
    if ctx.cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
        return Err(EngineError::Cancelled);
    }

    let requested = ctx.mode;
    let supports = provider.supports_streaming();

    let mut selected_mode = requested;
    let mut fallback_reason: Option<String> = None;
    let mut use_stream = false;

    match requested {
        InferMode::Stream => {
            if !supports {
                return Err(EngineError::Provider(format!(
                    "streaming unsupported by {}",
                    provider.name()
                )));
            }
            use_stream = true;
        }
        InferMode::Auto => {
            if supports {
                use_stream = true;
            } else {
                selected_mode = InferMode::Regular;
                fallback_reason = Some("streaming_unsupported".to_string());
            }
        }
        InferMode::Regular => {
            selected_mode = InferMode::Regular;
        }
    }

    let start = Instant::now();
    let recorder = Arc::new(Mutex::new(StreamRecorder::default()));
    let mut total_retries: u32 = 0;
    let mut completion: Option<Completion> = None;

    if use_stream {
        let rec = Arc::clone(&recorder);
        let events = ctx.events.clone();
        let step_id = ctx.label.clone();
        let unit_index = ctx.unit_index;
        let mut on_token = move |tok: crate::provider::TokenChunk| {
            let mut r = rec.lock().expect("stream recorder poisoned");
            if r.first_token_at.is_none() && !tok.done {
                r.first_token_at = Some(Instant::now());
            }
            if !tok.delta.is_empty() {
                r.chunks.push(tok.delta.clone());
                emit(
                    &events,
                    Event::Token {
                        step_id: step_id.clone(),
                        unit_index,
                        chunk: tok.delta,
                    },
                );
            }
        };

        let rec = Arc::clone(&recorder);
        let events = ctx.events.clone();
        let label = ctx.label.clone();
        let mut on_retry = move |attempt: u32, delay: std::time::Duration, reason: &str| {
            // Each transport retry restarts the stream; partials are discarded.
            rec.lock().expect("stream recorder poisoned").reset();
            emit(
                &events,
                Event::TransportRetry {
                    label: label.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    reason: reason.to_string(),
                },
            );
        };

        let result = retry::with_backoff_streaming(
            provider,
            messages,
            params,
            ctx.policy,
            &ctx.label,
            BackoffStreamOpts {
                cancel: ctx.cancel,
                on_retry: Some(&mut on_retry),
                on_token: &mut on_token,
            },
        )
        .await;

        match result {
            Ok((c, retries)) => {
                total_retries += retries;
                completion = Some(c);
            }
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) => {
                let emitted = {
                    let r = recorder.lock().expect("stream recorder poisoned");
                    !r.chunks.is_empty()
                };
                if emitted {
                    // Content already reached the caller; no silent fallback.
                    return Err(EngineError::Inference {
                        message: format!("stream failed mid-response: {e}"),
                        status_code: e.status_code(),
                    });
                }
                if requested == InferMode::Auto {
                    let code = e
                        .status_code()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    fallback_reason = Some(format!("stream_error:{code}"));
                    selected_mode = InferMode::Regular;
                    use_stream = false;
                } else {
                    return Err(EngineError::Provider(format!(
                        "streaming request failed: {e}"
                    )));
                }
            }
        }
    }

    if completion.is_none() {
        let events = ctx.events.clone();
        let label = ctx.label.clone();
        let mut on_retry = move |attempt: u32, delay: std::time::Duration, reason: &str| {
            emit(
                &events,
                Event::TransportRetry {
                    label: label.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    reason: reason.to_string(),
                },
            );
        };
        let (c, retries) = retry::with_backoff(
            provider,
            messages,
            params,
            ctx.policy,
            &ctx.label,
            ctx.cancel,
            Some(&mut on_retry),
        )
        .await?;
        total_retries += retries;
        completion = Some(c);
        use_stream = false;
    }

    if ctx.cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
        return Err(EngineError::Cancelled);
    }

    let completion = completion.expect("completion set on all paths");
    let end = Instant::now();
    let latency_ms = end.duration_since(start).as_millis() as u64;

    let (ttfb_ms, chunk_count) = if use_stream {
        let r = recorder.lock().expect("stream recorder poisoned");
        let first = r.first_token_at.unwrap_or(end);
        (
            first.duration_since(start).as_millis() as u64,
            r.chunks.len() as u64,
        )
    } else {
        (
            latency_ms,
            if completion.text.is_empty() { 0 } else { 1 },
        )
    };

    let tokens_out = completion
        .tokens_completion
        .unwrap_or_else(|| estimate_tokens_out(&completion.text));

    let telemetry = InferenceTelemetry {
        streaming: use_stream,
        selected_mode,
        fallback_reason,
        ttfb_ms,
        latency_ms,
        chunk_count,
        tokens_out,
        retries: total_retries,
    };

    Ok((completion, telemetry))
}
