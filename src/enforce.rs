//! JSON enforcement: strict parse, minimal schema validation, and a bounded
//! repair-via-reprompt loop.
//!
//! Enforcement is a value, not an exception: exhaustion yields a
//! [`JsonOutcome::Failed`] record that the executor converts into a unit
//! failure only when `continue_on_error` is off. A completion that already
//! parses and validates costs zero repair attempts.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::Value;

use crate::dispatch::{invoke_with_mode, DispatchContext, InferMode, InferenceTelemetry};
use crate::error::Result;
use crate::events::{emit, Event, EventHandler};
use crate::provider::{Message, Provider, RequestParams, Role};
use crate::retry::RetryPolicy;
use crate::telemetry;

/// What a step expects of its completion text.
#[derive(Debug, Clone, Default)]
pub struct JsonExpectation {
    /// Minimal schema: `type: object`, `required: [...]`, and per-property
    /// `type` checks. `None` means any valid JSON.
    pub schema: Option<Value>,
    /// Repair rounds allowed before giving up.
    pub parse_retries: u32,
}

/// The result of enforcement.
#[derive(Debug, Clone)]
pub enum JsonOutcome {
    /// Valid JSON (and schema, when set).
    Parsed {
        /// The parsed value.
        value: Value,
        /// Repair rounds consumed (0 when the first parse succeeded).
        repair_attempts: u32,
    },
    /// Every attempt exhausted.
    Failed {
        /// `parse_error` or `schema_error`.
        kind: String,
        /// The final invalid completion text.
        raw_text: String,
    },
}

/// Validate a value against the minimal schema dialect.
///
/// Supported keywords: `type: object`, `required: [keys]`, and
/// `properties.<key>.type` ∈ {string, number, integer, boolean, array,
/// object}. Unknown keywords are ignored.
pub fn validate_min_schema(value: &Value, schema: &Value) -> std::result::Result<(), String> {
    if schema.get("type").and_then(Value::as_str) == Some("object") && !value.is_object() {
        return Err("schema.type=object but got non-object".to_string());
    }
    if let (Some(required), Some(obj)) = (
        schema.get("required").and_then(Value::as_array),
        value.as_object(),
    ) {
        let missing: Vec<&str> = required
            .iter()
            .filter_map(Value::as_str)
            .filter(|k| !obj.contains_key(*k))
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing required keys: {}", missing.join(", ")));
        }
    }
    if let (Some(props), Some(obj)) = (
        schema.get("properties").and_then(Value::as_object),
        value.as_object(),
    ) {
        for (key, prop) in props {
            let Some(expected) = prop.get("type").and_then(Value::as_str) else {
                continue;
            };
            let Some(actual) = obj.get(key) else {
                continue;
            };
            let ok = match expected {
                "string" => actual.is_string(),
                "number" => actual.is_number(),
                "integer" => actual.is_i64() || actual.is_u64(),
                "boolean" => actual.is_boolean(),
                "array" => actual.is_array(),
                "object" => actual.is_object(),
                _ => true,
            };
            if !ok {
                return Err(format!("key {key:?} is not of type {expected}"));
            }
        }
    }
    Ok(())
}

fn try_parse(text: &str, schema: Option<&Value>) -> std::result::Result<Value, (String, String)> {
    let parsed: Value = serde_json::from_str(text.trim())
        .map_err(|e| ("parse_error".to_string(), e.to_string()))?;
    if let Some(schema) = schema {
        validate_min_schema(&parsed, schema).map_err(|e| ("schema_error".to_string(), e))?;
    }
    Ok(parsed)
}

/// Build the deterministic repair instruction.
///
/// Quotes the invalid text and the schema's required keys/types, and adds
/// no examples beyond the failed output itself.
fn repair_instruction(invalid_text: &str, reason: &str, schema: Option<&Value>) -> String {
    let mut instruction = format!(
        "The previous response was not valid JSON ({reason}). \
         Respond again with only a valid JSON value and no surrounding text. \
         Previous response:\n{invalid_text}"
    );
    if let Some(schema) = schema {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            let keys: Vec<String> = required
                .iter()
                .filter_map(Value::as_str)
                .map(|k| {
                    match schema
                        .get("properties")
                        .and_then(|p| p.get(k))
                        .and_then(|p| p.get("type"))
                        .and_then(Value::as_str)
                    {
                        Some(t) => format!("{k} ({t})"),
                        None => k.to_string(),
                    }
                })
                .collect();
            if !keys.is_empty() {
                instruction.push_str(&format!("\nRequired keys: {}", keys.join(", ")));
            }
        }
    }
    instruction
}

fn repair_messages(original: &[Message], invalid_text: &str, reason: &str, schema: Option<&Value>) -> Vec<Message> {
    let mut messages = vec![Message::system(repair_instruction(
        invalid_text,
        reason,
        schema,
    ))];
    messages.extend(
        original
            .iter()
            .filter(|m| m.role == Role::User)
            .cloned(),
    );
    messages
}

/// Enforce a JSON expectation on a completion, repairing via reprompt.
///
/// Repair calls always run in regular mode. Returns the outcome plus the
/// telemetry of every repair call made, for step aggregation. The
/// `json_parse_failures` counters are incremented only on exhaustion.
#[allow(clippy::too_many_arguments)]
pub async fn enforce_json(
    provider: &dyn Provider,
    params: &RequestParams,
    policy: &RetryPolicy,
    cancel: Option<&AtomicBool>,
    events: &Option<Arc<dyn EventHandler>>,
    step_id: &str,
    unit_index: usize,
    original_messages: &[Message],
    completion_text: &str,
    expectation: &JsonExpectation,
) -> Result<(JsonOutcome, Vec<InferenceTelemetry>)> {
    let schema = expectation.schema.as_ref();
    let mut repair_calls = Vec::new();

    let mut text = completion_text.to_string();
    let mut failure = match try_parse(&text, schema) {
        Ok(value) => {
            return Ok((
                JsonOutcome::Parsed {
                    value,
                    repair_attempts: 0,
                },
                repair_calls,
            ))
        }
        Err(f) => f,
    };

    for attempt in 1..=expectation.parse_retries {
        let (kind, reason) = &failure;
        emit(
            events,
            Event::RepairStart {
                step_id: step_id.to_string(),
                unit_index,
                attempt,
                reason: format!("{kind}: {reason}"),
            },
        );

        let messages = repair_messages(original_messages, &text, reason, schema);
        let (completion, telemetry) = invoke_with_mode(
            provider,
            &messages,
            params,
            DispatchContext {
                mode: InferMode::Regular,
                policy,
                label: step_id.to_string(),
                unit_index,
                cancel,
                events: events.clone(),
            },
        )
        .await?;
        repair_calls.push(telemetry);
        text = completion.text;

        match try_parse(&text, schema) {
            Ok(value) => {
                emit(
                    events,
                    Event::RepairEnd {
                        step_id: step_id.to_string(),
                        unit_index,
                        attempts: attempt,
                        success: true,
                    },
                );
                return Ok((
                    JsonOutcome::Parsed {
                        value,
                        repair_attempts: attempt,
                    },
                    repair_calls,
                ));
            }
            Err(f) => failure = f,
        }
    }

    emit(
        events,
        Event::RepairEnd {
            step_id: step_id.to_string(),
            unit_index,
            attempts: expectation.parse_retries,
            success: false,
        },
    );
    telemetry::inc("json_parse_failures", 1.0);
    telemetry::inc(&format!("json_parse_failures.{step_id}"), 1.0);
    Ok((
        JsonOutcome::Failed {
            kind: failure.0,
            raw_text: text,
        },
        repair_calls,
    ))
}
