//! Transport-level retry with exponential backoff, jitter, and a hard deadline.
//!
//! [`RetryPolicy`] controls how transient failures (429, 5xx, connection
//! errors) are retried with increasing delays. Every call emits four counters
//! into the telemetry registry: attempts, failures, successes, and cumulative
//! sleep seconds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{EngineError, Result};
use crate::provider::{Completion, Message, Provider, RequestParams, TokenSink};
use crate::telemetry;

/// Configuration for transport-level retry.
///
/// The sleep before attempt `k` is `min(cap, initial_delay * multiplier^k)`
/// scaled by `(1 + uniform(-jitter, jitter))`. A hard wall-clock deadline
/// (`max_elapsed`) terminates retries with `deadline_exceeded`.
///
/// # Example
///
/// ```
/// use inferchain::retry::RetryPolicy;
///
/// let policy = RetryPolicy::standard();
/// assert_eq!(policy.max_attempts, 5);
///
/// // No retry for local or already-idempotent calls
/// let none = RetryPolicy::none();
/// assert_eq!(none.max_attempts, 1);
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry. Default: 200ms.
    pub initial_delay: Duration,
    /// Multiplier applied per retry. Default: 2.0.
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1)`. Default: 0.25.
    pub jitter: f64,
    /// Absolute cap on a single sleep. Default: 5 seconds.
    pub cap: Duration,
    /// Hard wall-clock deadline for the whole call. Default: 30 seconds.
    pub max_elapsed: Duration,
    /// Maximum attempts including the first. Default: 5.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Sensible defaults for cloud APIs.
    pub fn standard() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: 0.25,
            cap: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(30),
            max_attempts: 5,
        }
    }

    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::standard()
        }
    }

    /// The jittered sleep before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.cap.as_secs_f64());
        let factor = 1.0 + self.jitter * (2.0 * fastrand::f64() - 1.0);
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Whether an error is worth retrying: rate limits, server errors, and
/// transport failures. Everything else surfaces unchanged.
pub fn is_transient(error: &EngineError) -> bool {
    match error {
        EngineError::Http { status, .. } => *status == 429 || (500..600).contains(status),
        EngineError::Request(_) => true,
        EngineError::Inference { status_code, .. } => match status_code {
            Some(code) => *code == 429 || (500..600).contains(code),
            None => false,
        },
        EngineError::Connector { kind, .. } => {
            matches!(kind, crate::error::ConnectorErrorKind::Transient)
        }
        _ => false,
    }
}

/// Callback invoked before each retry: `(attempt_number, delay, reason)`.
pub type RetryCallback<'a> = Option<&'a mut (dyn FnMut(u32, Duration, &str) + Send)>;

struct Bookkeeper<'a> {
    label: &'a str,
    started: Instant,
}

impl<'a> Bookkeeper<'a> {
    fn new(label: &'a str) -> Self {
        telemetry::inc(&format!("retry.attempts.{label}"), 1.0);
        Self {
            label,
            started: Instant::now(),
        }
    }

    fn attempt(&self) {
        telemetry::inc(&format!("retry.attempts.{}", self.label), 1.0);
    }

    fn success(&self) {
        telemetry::inc(&format!("retry.successes.{}", self.label), 1.0);
    }

    fn failure(&self) {
        telemetry::inc(&format!("retry.failures.{}", self.label), 1.0);
    }

    fn slept(&self, delay: Duration) {
        telemetry::inc(
            &format!("retry.sleep_seconds.{}", self.label),
            delay.as_secs_f64(),
        );
    }

    /// The delay before the next attempt, or an error when the deadline
    /// would be exceeded. Respects a Retry-After hint when present, still
    /// bounded by the policy cap.
    fn next_delay(
        &self,
        policy: &RetryPolicy,
        attempt: u32,
        last_error: &EngineError,
    ) -> Result<Duration> {
        let delay = match last_error {
            EngineError::Http {
                retry_after: Some(ra),
                ..
            } => (*ra).min(policy.cap),
            _ => policy.delay_for_attempt(attempt),
        };
        if self.started.elapsed() + delay > policy.max_elapsed {
            self.failure();
            return Err(EngineError::inference("deadline_exceeded"));
        }
        Ok(delay)
    }
}

fn check_cancelled(cancel: Option<&AtomicBool>) -> Result<()> {
    if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
        return Err(EngineError::Cancelled);
    }
    Ok(())
}

/// Execute a non-streaming provider call with transport-level retry.
///
/// Returns the completion plus the number of retries performed (attempts
/// beyond the first). Non-transient failures surface unchanged; exhausting
/// the wall-clock budget yields `deadline_exceeded`.
pub async fn with_backoff(
    provider: &dyn Provider,
    messages: &[Message],
    params: &RequestParams,
    policy: &RetryPolicy,
    label: &str,
    cancel: Option<&AtomicBool>,
    mut on_retry: RetryCallback<'_>,
) -> Result<(Completion, u32)> {
    let books = Bookkeeper::new(label);
    let mut last_error: Option<EngineError> = None;

    for attempt in 0..policy.max_attempts.max(1) {
        check_cancelled(cancel)?;

        if attempt > 0 {
            books.attempt();
            let err = last_error.as_ref().expect("retry without prior error");
            let delay = books.next_delay(policy, attempt - 1, err)?;
            if let Some(ref mut cb) = on_retry {
                cb(attempt, delay, &err.to_string());
            }
            books.slept(delay);
            tokio::time::sleep(delay).await;
            check_cancelled(cancel)?;
        }

        match provider.complete(messages, params).await {
            Ok(completion) => {
                books.success();
                return Ok((completion, attempt));
            }
            Err(e) => {
                if attempt + 1 < policy.max_attempts && is_transient(&e) {
                    last_error = Some(e);
                    continue;
                }
                books.failure();
                return Err(e);
            }
        }
    }

    books.failure();
    Err(last_error
        .unwrap_or_else(|| EngineError::inference("backoff loop exited unexpectedly")))
}

/// Options for [`with_backoff_streaming`] — bundles the callback parameters.
pub struct BackoffStreamOpts<'a> {
    /// Optional cancellation flag.
    pub cancel: Option<&'a AtomicBool>,
    /// Optional callback invoked before each retry. Callers use this to
    /// discard partial tokens from the failed attempt.
    pub on_retry: RetryCallback<'a>,
    /// Token callback, invoked for each delta as it arrives.
    pub on_token: TokenSink<'a>,
}

/// Execute a streaming provider call with transport-level retry.
///
/// Same contract as [`with_backoff`], but each retry restarts the stream from
/// scratch; callers reset their accumulation in `on_retry`.
pub async fn with_backoff_streaming(
    provider: &dyn Provider,
    messages: &[Message],
    params: &RequestParams,
    policy: &RetryPolicy,
    label: &str,
    opts: BackoffStreamOpts<'_>,
) -> Result<(Completion, u32)> {
    let BackoffStreamOpts {
        cancel,
        mut on_retry,
        on_token,
    } = opts;
    let books = Bookkeeper::new(label);
    let mut last_error: Option<EngineError> = None;

    for attempt in 0..policy.max_attempts.max(1) {
        check_cancelled(cancel)?;

        if attempt > 0 {
            books.attempt();
            let err = last_error.as_ref().expect("retry without prior error");
            let delay = books.next_delay(policy, attempt - 1, err)?;
            if let Some(ref mut cb) = on_retry {
                cb(attempt, delay, &err.to_string());
            }
            books.slept(delay);
            tokio::time::sleep(delay).await;
            check_cancelled(cancel)?;
        }

        match provider.stream(messages, params, on_token).await {
            Ok(completion) => {
                books.success();
                return Ok((completion, attempt));
            }
            Err(e) => {
                if attempt + 1 < policy.max_attempts && is_transient(&e) {
                    last_error = Some(e);
                    continue;
                }
                books.failure();
                return Err(e);
            }
        }
    }

    books.failure();
    Err(last_error
        .unwrap_or_else(|| EngineError::inference("backoff loop exited unexpectedly")))
}
