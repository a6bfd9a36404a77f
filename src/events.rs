//! Event system for step and unit lifecycle hooks.
//!
//! Provides an optional, non-intrusive way to observe execution. The
//! executor and dispatcher emit events when steps and units start, tokens
//! arrive, transport retries fire, and JSON repair rounds run. Users
//! implement [`EventHandler`] for logging, progress tracking, or streaming
//! UIs.

use std::sync::Arc;

/// Events emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum Event {
    /// A step has started executing over the unit set.
    StepStart {
        /// Step identifier.
        step_id: String,
    },
    /// A unit-step invocation has started.
    UnitStart {
        /// Step identifier.
        step_id: String,
        /// Unit position in the stream.
        unit_index: usize,
    },
    /// A token was received during streaming.
    Token {
        /// Step identifier.
        step_id: String,
        /// Unit position in the stream.
        unit_index: usize,
        /// The delta text.
        chunk: String,
    },
    /// A transport-level retry due to a transient failure.
    TransportRetry {
        /// Step id or operation label.
        label: String,
        /// The retry attempt number (1-indexed).
        attempt: u32,
        /// Delay before this retry attempt in milliseconds.
        delay_ms: u64,
        /// Reason for the retry (error description).
        reason: String,
    },
    /// A JSON repair round is starting.
    RepairStart {
        /// Step identifier.
        step_id: String,
        /// Unit position in the stream.
        unit_index: usize,
        /// The repair attempt number (1-indexed).
        attempt: u32,
        /// Why the repair was triggered (parse or schema error).
        reason: String,
    },
    /// A JSON repair sequence has completed.
    RepairEnd {
        /// Step identifier.
        step_id: String,
        /// Unit position in the stream.
        unit_index: usize,
        /// Total repair attempts made.
        attempts: u32,
        /// Whether the final attempt produced valid output.
        success: bool,
    },
    /// A unit-step invocation has finished.
    UnitEnd {
        /// Step identifier.
        step_id: String,
        /// Unit position in the stream.
        unit_index: usize,
        /// Whether the unit emitted an output.
        ok: bool,
    },
    /// A step has finished executing over the unit set.
    StepEnd {
        /// Step identifier.
        step_id: String,
        /// Whether every unit emitted an output.
        ok: bool,
    },
}

/// Handler for lifecycle events.
///
/// Entirely optional — the engine works without one.
///
/// # Example
///
/// ```
/// use inferchain::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         if let Event::Token { chunk, .. } = event {
///             print!("{}", chunk);
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    /// Called when the engine emits an event.
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use inferchain::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     if let Event::StepStart { step_id } = event {
///         eprintln!("step {step_id} started");
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_fn_handler_receives_events() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let handler: Option<Arc<dyn EventHandler>> =
            Some(Arc::new(FnEventHandler(move |event: Event| {
                if let Event::StepStart { step_id } = event {
                    seen2.lock().unwrap().push(step_id);
                }
            })));
        emit(
            &handler,
            Event::StepStart {
                step_id: "analyse".into(),
            },
        );
        assert_eq!(seen.lock().unwrap().as_slice(), ["analyse"]);
    }

    #[test]
    fn test_emit_without_handler_is_noop() {
        emit(
            &None,
            Event::StepEnd {
                step_id: "x".into(),
                ok: true,
            },
        );
    }
}
