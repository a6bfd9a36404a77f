//! Bounded-concurrency execution of a step chain over a unit set.
//!
//! Steps run in declared order; within a step, units fan out through a
//! semaphore-bounded task set and outputs are collected back into unit
//! order. `all.<output>` scopes are populated from emitted units only,
//! after the producing step has fully drained. A unit reaches exactly one
//! of emitted or failed.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::dispatch::{
    invoke_with_mode, DispatchContext, InferMode, InferenceTelemetry, RuntimeContext,
};
use crate::enforce::{enforce_json, JsonExpectation, JsonOutcome};
use crate::error::{EngineError, Result};
use crate::events::{emit, Event, EventHandler};
use crate::prompts::PromptRegistry;
use crate::provider::{Content, Message, Part, Provider};
use crate::retrieval::{attach_context, RetrievalPipeline};
use crate::retry::RetryPolicy;
use crate::secrets::Redactor;
use crate::step::{OutputExpectation, PipelineSpec, Step, StepMode};
use crate::telemetry;
use crate::template::{render_binding, render_prompt, Scope};
use crate::types::{Document, ExecutionUnit, PromptUsed, StepTelemetry, UnitKind};

/// Everything the executor needs beyond the pipeline spec itself.
pub struct Executor {
    /// Provider adapter for every step.
    pub provider: Arc<dyn Provider>,
    /// Prompt registry.
    pub prompts: Arc<PromptRegistry>,
    /// Configured retrieval pipelines by name.
    pub retrieval: HashMap<String, Arc<dyn RetrievalPipeline>>,
    /// Transport retry policy.
    pub policy: Arc<RetryPolicy>,
    /// Mode-override context, read once at startup.
    pub runtime: RuntimeContext,
    /// Optional lifecycle event handler.
    pub events: Option<Arc<dyn EventHandler>>,
    /// Shared cancellation flag.
    pub cancel: Arc<AtomicBool>,
    /// Secret redactor applied to unit error messages.
    pub redactor: Arc<Redactor>,
    /// Cap applied to joined `all.*` payloads.
    pub join_max_chars: usize,
    /// Engine-level defaults for concurrency and error policy.
    pub defaults: ExecutorConfig,
}

/// Result of executing the whole chain.
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    /// Per unit, `output_name -> value | error record`, unit order.
    pub unit_outputs: Vec<Map<String, Value>>,
    /// Per step output name, emitted values in unit order.
    pub all_outputs: BTreeMap<String, Vec<Value>>,
    /// Per-step telemetry aggregates.
    pub step_telemetry: BTreeMap<String, StepTelemetry>,
    /// Prompts resolved during the run, in first-use order.
    pub prompts_used: Vec<PromptUsed>,
    /// Retrieval log records per pipeline, unit order.
    pub rag_records: BTreeMap<String, Vec<Value>>,
    /// Units that reached the failed state.
    pub failed_units: usize,
    /// Whether external cancellation stopped the run.
    pub cancelled: bool,
}

enum UnitOutput {
    Emitted {
        value: Value,
        calls: Vec<InferenceTelemetry>,
        rag: Option<(String, Value)>,
    },
    JsonFailed {
        record: Value,
        calls: Vec<InferenceTelemetry>,
        rag: Option<(String, Value)>,
    },
}

struct UnitTask {
    provider: Arc<dyn Provider>,
    step: Arc<Step>,
    template: Arc<String>,
    unit: ExecutionUnit,
    doc: Option<Document>,
    all: Arc<Value>,
    run_id: Arc<String>,
    policy: Arc<RetryPolicy>,
    mode: InferMode,
    events: Option<Arc<dyn EventHandler>>,
    cancel: Arc<AtomicBool>,
    retrieval: Option<Arc<dyn RetrievalPipeline>>,
    join_max_chars: usize,
}

fn document_value(doc: &Document) -> Value {
    let mut obj = Map::new();
    obj.insert("id".into(), Value::String(doc.id.clone()));
    obj.insert("source_uri".into(), Value::String(doc.source_uri.clone()));
    obj.insert(
        "text".into(),
        doc.text
            .as_ref()
            .map(|t| Value::String(t.clone()))
            .unwrap_or(Value::Null),
    );
    obj.insert("metadata".into(), Value::Object(doc.metadata.clone()));
    Value::Object(obj)
}

fn unit_scope(task: &UnitTask) -> Scope {
    let mut scope = Scope::new();
    scope.join_max_chars = task.join_max_chars;
    scope.bind("run_id", Value::String(task.run_id.as_str().to_string()));
    scope.bind("all", (*task.all).clone());
    if let Some(doc) = &task.doc {
        scope.bind("document", document_value(doc));
    }
    match &task.unit.kind {
        UnitKind::Chunk(chunk) => {
            let mut obj = Map::new();
            obj.insert("id".into(), Value::String(chunk.id.clone()));
            obj.insert("text".into(), Value::String(chunk.text.clone()));
            obj.insert(
                "source_uri".into(),
                Value::String(task.unit.source_uri.clone()),
            );
            obj.insert("offset".into(), Value::from(chunk.offset as u64));
            obj.insert(
                "tokens_estimate".into(),
                Value::from(chunk.tokens_estimate as u64),
            );
            scope.bind("chunk", Value::Object(obj));
        }
        UnitKind::Row(row) => {
            let mut obj = row.values.clone();
            obj.insert("text".into(), Value::String(row.text.clone()));
            scope.bind("row", Value::Object(obj));
            scope.bind("row_index", Value::from(row.row_index as u64));
        }
        UnitKind::Group(group) => {
            let mut obj = Map::new();
            obj.insert("size".into(), Value::from(group.blobs.len() as u64));
            obj.insert(
                "source_uris".into(),
                Value::Array(
                    group
                        .source_uris
                        .iter()
                        .map(|u| Value::String(u.clone()))
                        .collect(),
                ),
            );
            if let Some(caption) = &group.caption {
                obj.insert("caption".into(), Value::String(caption.clone()));
            }
            scope.bind("group", Value::Object(obj));
        }
    }
    scope
}

async fn run_unit(task: UnitTask) -> Result<UnitOutput> {
    if task.cancel.load(Ordering::Relaxed) {
        return Err(EngineError::Cancelled);
    }

    let scope = unit_scope(&task);

    let mut inputs = Map::new();
    for (name, expr) in &task.step.input_bindings {
        let rendered = render_binding(expr, &scope).map_err(|e| match e {
            EngineError::Processing(msg) => EngineError::Processing(format!(
                "step {:?} binding {name:?}: {msg}",
                task.step.id
            )),
            other => other,
        })?;
        inputs.insert(name.clone(), rendered);
    }

    let mut rag_images = Vec::new();
    let mut rag_record = None;
    if let (Some(binding), Some(pipeline)) = (&task.step.retrieval, &task.retrieval) {
        let attachment = attach_context(binding, pipeline.as_ref(), &task.unit, &scope).await?;
        for (name, value) in attachment.bindings {
            inputs.insert(name, value);
        }
        rag_images = attachment.images;
        rag_record = attachment
            .log_record
            .map(|record| (binding.pipeline.clone(), record));
    }

    let body = render_prompt(&task.template, &inputs, &scope)?;

    let mut messages = Vec::new();
    if let Some(system) = &task.step.system_prompt {
        messages.push(Message::system(render_prompt(system, &inputs, &scope)?));
    }
    let user = match task.step.mode {
        StepMode::Text => Message::user(body),
        StepMode::Multimodal | StepMode::ImagesGroup => {
            let mut parts = vec![Part::Text(body)];
            match (&task.step.mode, &task.unit.kind) {
                (StepMode::ImagesGroup, UnitKind::Group(group)) => {
                    for blob in &group.blobs {
                        parts.push(Part::ImageBytes {
                            mime: blob.mime.clone(),
                            data: blob.bytes.clone(),
                        });
                    }
                }
                _ => {
                    if let Some(doc) = &task.doc {
                        for blob in &doc.blobs {
                            parts.push(Part::ImageBytes {
                                mime: blob.mime.clone(),
                                data: blob.bytes.clone(),
                            });
                        }
                    }
                }
            }
            for image in &rag_images {
                parts.push(Part::ImageBytes {
                    mime: image.mime.clone(),
                    data: image.bytes.clone(),
                });
            }
            Message {
                role: crate::provider::Role::User,
                content: Content::Parts(parts),
            }
        }
    };
    messages.push(user);

    let (completion, call_telemetry) = invoke_with_mode(
        task.provider.as_ref(),
        &messages,
        &task.step.params,
        DispatchContext {
            mode: task.mode,
            policy: &task.policy,
            label: task.step.id.clone(),
            unit_index: task.unit.index,
            cancel: Some(task.cancel.as_ref()),
            events: task.events.clone(),
        },
    )
    .await?;
    let mut calls = vec![call_telemetry];

    match task.step.output_expects {
        OutputExpectation::None => Ok(UnitOutput::Emitted {
            value: Value::String(completion.text),
            calls,
            rag: rag_record,
        }),
        OutputExpectation::Json => {
            let expectation = JsonExpectation {
                schema: task.step.output_schema.clone(),
                parse_retries: task.step.parse_retries,
            };
            let (outcome, repair_calls) = enforce_json(
                task.provider.as_ref(),
                &task.step.params,
                &task.policy,
                Some(task.cancel.as_ref()),
                &task.events,
                &task.step.id,
                task.unit.index,
                &messages,
                &completion.text,
                &expectation,
            )
            .await?;
            calls.extend(repair_calls);
            match outcome {
                JsonOutcome::Parsed { value, .. } => Ok(UnitOutput::Emitted {
                    value,
                    calls,
                    rag: rag_record,
                }),
                JsonOutcome::Failed { kind, raw_text } => {
                    let mut record = Map::new();
                    record.insert("parse_error".into(), Value::String(kind));
                    record.insert("raw_text".into(), Value::String(raw_text));
                    Ok(UnitOutput::JsonFailed {
                        record: Value::Object(record),
                        calls,
                        rag: rag_record,
                    })
                }
            }
        }
    }
}

impl Executor {
    /// Execute every step of the chain over the unit set.
    ///
    /// Returns the collected outcome, or the first run-level error. Provider
    /// capability and configuration errors always halt the run; other unit
    /// errors become records when `continue_on_error` is set.
    pub async fn execute(
        &self,
        spec: &PipelineSpec,
        units: Arc<Vec<ExecutionUnit>>,
        documents: Arc<HashMap<String, Document>>,
        run_id: &str,
    ) -> Result<ExecutionOutcome> {
        let mut outcome = ExecutionOutcome {
            unit_outputs: vec![Map::new(); units.len()],
            ..ExecutionOutcome::default()
        };
        let run_id = Arc::new(run_id.to_string());
        let concurrency = spec
            .concurrency
            .unwrap_or(self.defaults.concurrency)
            .max(1);
        let continue_on_error = spec
            .continue_on_error
            .unwrap_or(self.defaults.continue_on_error);

        for step in &spec.steps {
            if self.cancel.load(Ordering::Relaxed) {
                outcome.cancelled = true;
                break;
            }

            let (template, prompt_used) = self.prompts.resolve(&step.prompt)?;
            outcome.prompts_used.push(prompt_used);

            let pipeline = match &step.retrieval {
                Some(binding) => Some(
                    self.retrieval
                        .get(&binding.pipeline)
                        .cloned()
                        .ok_or_else(|| {
                            EngineError::Config(format!(
                                "retrieval pipeline {:?} is not configured",
                                binding.pipeline
                            ))
                        })?,
                ),
                None => None,
            };

            emit(
                &self.events,
                Event::StepStart {
                    step_id: step.id.clone(),
                },
            );
            debug!(step_id = %step.id, units = units.len(), "step started");

            let step_arc = Arc::new(step.clone());
            let template_arc = Arc::new(template);
            let all_value = Arc::new(Value::Object(
                outcome
                    .all_outputs
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::Array(v.clone())))
                    .collect(),
            ));
            let mode = self.runtime.resolve_mode(None, step.infer_mode);
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let halt = Arc::new(AtomicBool::new(false));

            let mut join_set: JoinSet<(usize, Result<UnitOutput>)> = JoinSet::new();
            for unit in units.iter() {
                let task = UnitTask {
                    provider: Arc::clone(&self.provider),
                    step: Arc::clone(&step_arc),
                    template: Arc::clone(&template_arc),
                    unit: unit.clone(),
                    doc: documents.get(&unit.doc_id).cloned(),
                    all: Arc::clone(&all_value),
                    run_id: Arc::clone(&run_id),
                    policy: Arc::clone(&self.policy),
                    mode,
                    events: self.events.clone(),
                    cancel: Arc::clone(&self.cancel),
                    retrieval: pipeline.clone(),
                    join_max_chars: self.join_max_chars,
                };
                let semaphore = Arc::clone(&semaphore);
                let halt = Arc::clone(&halt);
                let events = self.events.clone();
                let step_id = step.id.clone();
                let index = unit.index;
                join_set.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("semaphore closed unexpectedly");
                    if halt.load(Ordering::Relaxed) {
                        return (index, Err(EngineError::Cancelled));
                    }
                    emit(
                        &events,
                        Event::UnitStart {
                            step_id: step_id.clone(),
                            unit_index: index,
                        },
                    );
                    let result = run_unit(task).await;
                    emit(
                        &events,
                        Event::UnitEnd {
                            step_id,
                            unit_index: index,
                            ok: matches!(result, Ok(UnitOutput::Emitted { .. })),
                        },
                    );
                    (index, result)
                });
            }

            let mut results: Vec<Option<UnitOutput>> =
                (0..units.len()).map(|_| None).collect();
            let mut unit_errors: Vec<Option<(String, String)>> =
                (0..units.len()).map(|_| None).collect();
            let mut first_error: Option<EngineError> = None;

            while let Some(joined) = join_set.join_next().await {
                let (index, result) = joined
                    .map_err(|e| EngineError::Processing(format!("unit task join: {e}")))?;
                match result {
                    Ok(UnitOutput::JsonFailed { .. }) if !continue_on_error => {
                        // Surfaced as a run error after in-flight units settle.
                        halt.store(true, Ordering::Relaxed);
                        if first_error.is_none() {
                            first_error = Some(EngineError::inference(format!(
                                "json enforcement exhausted for step {:?}",
                                step.id
                            )));
                        }
                    }
                    Ok(output) => results[index] = Some(output),
                    Err(EngineError::Cancelled) if self.cancel.load(Ordering::Relaxed) => {
                        outcome.cancelled = true;
                        unit_errors[index] =
                            Some(("cancelled".to_string(), "run was cancelled".to_string()));
                    }
                    Err(EngineError::Cancelled) if halt.load(Ordering::Relaxed) => {
                        // Unit never started; the halting error is already recorded.
                    }
                    Err(e) => {
                        let fatal =
                            matches!(e, EngineError::Provider(_) | EngineError::Config(_));
                        if continue_on_error && !fatal {
                            let message = self.redactor.redact(&e.to_string());
                            warn!(step_id = %step.id, unit_index = index, error = %message, "unit failed");
                            telemetry::inc("unit_failures", 1.0);
                            unit_errors[index] = Some((e.kind_tag().to_string(), message));
                        } else {
                            halt.store(true, Ordering::Relaxed);
                            if first_error.is_none() {
                                first_error = Some(e);
                            }
                        }
                    }
                }
            }

            if let Some(error) = first_error {
                emit(
                    &self.events,
                    Event::StepEnd {
                        step_id: step.id.clone(),
                        ok: false,
                    },
                );
                return Err(error);
            }

            let mut emitted = Vec::new();
            let mut step_failed = 0usize;
            let mut aggregate = StepTelemetry::default();
            for (index, slot) in results.iter_mut().enumerate() {
                let calls = match slot.take() {
                    Some(UnitOutput::Emitted { value, calls, rag }) => {
                        outcome.unit_outputs[index]
                            .insert(step.output_name.clone(), value.clone());
                        emitted.push(value);
                        if let Some((pipeline, record)) = rag {
                            outcome.rag_records.entry(pipeline).or_default().push(record);
                        }
                        calls
                    }
                    Some(UnitOutput::JsonFailed { record, calls, rag }) => {
                        outcome.unit_outputs[index]
                            .insert(step.output_name.clone(), record);
                        step_failed += 1;
                        if let Some((pipeline, record)) = rag {
                            outcome.rag_records.entry(pipeline).or_default().push(record);
                        }
                        calls
                    }
                    None => {
                        if let Some((kind, message)) = unit_errors[index].take() {
                            let mut record = Map::new();
                            record.insert("error".into(), Value::String(kind));
                            record.insert("message".into(), Value::String(message));
                            outcome.unit_outputs[index]
                                .insert(step.output_name.clone(), Value::Object(record));
                            step_failed += 1;
                        }
                        Vec::new()
                    }
                };
                for call in calls {
                    aggregate.calls += 1;
                    aggregate.streaming |= call.streaming;
                    if call.fallback_reason.is_some() {
                        aggregate.fallback_reason = call.fallback_reason.clone();
                    }
                    aggregate.retries += u64::from(call.retries);
                    aggregate.tokens_out += call.tokens_out;
                    aggregate.latency_ms += call.latency_ms;
                    aggregate.ttfb_ms += call.ttfb_ms;
                }
            }

            outcome.failed_units += step_failed;
            outcome
                .all_outputs
                .insert(step.output_name.clone(), emitted);
            outcome
                .step_telemetry
                .insert(step.id.clone(), aggregate);

            emit(
                &self.events,
                Event::StepEnd {
                    step_id: step.id.clone(),
                    ok: step_failed == 0,
                },
            );

            if self.cancel.load(Ordering::Relaxed) {
                outcome.cancelled = true;
                break;
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use crate::step::Step;
    use crate::types::{Chunk, Row};
    use serde_json::json;

    fn chunk_units(texts: &[&str]) -> Vec<ExecutionUnit> {
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| ExecutionUnit {
                index: i,
                doc_id: "doc_1".into(),
                source_uri: "file://a.txt".into(),
                kind: UnitKind::Chunk(Chunk {
                    id: format!("doc_1_ch_{i}"),
                    doc_id: "doc_1".into(),
                    text: text.to_string(),
                    tokens_estimate: 2,
                    offset: i * 10,
                    metadata: Map::new(),
                }),
            })
            .collect()
    }

    fn row_units(texts: &[&str]) -> Vec<ExecutionUnit> {
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let mut values = Map::new();
                values.insert("id".into(), json!((i + 1).to_string()));
                ExecutionUnit {
                    index: i,
                    doc_id: "doc_t".into(),
                    source_uri: "file://t.csv".into(),
                    kind: UnitKind::Row(Row {
                        row_index: i,
                        values,
                        source_uri: "file://t.csv".into(),
                        filename: "t.csv".into(),
                        text: text.to_string(),
                    }),
                }
            })
            .collect()
    }

    fn executor(provider: MockProvider) -> Executor {
        Executor {
            provider: Arc::new(provider),
            prompts: Arc::new(PromptRegistry::new()),
            retrieval: HashMap::new(),
            policy: Arc::new(RetryPolicy::none()),
            runtime: RuntimeContext::with_override(None),
            events: None,
            cancel: Arc::new(AtomicBool::new(false)),
            redactor: Arc::new(Redactor::new()),
            join_max_chars: 10_000,
            defaults: ExecutorConfig::default(),
        }
    }

    fn spec_with(steps: Vec<Step>, continue_on_error: bool) -> PipelineSpec {
        let mut builder = PipelineSpec::builder("test").continue_on_error(continue_on_error);
        for step in steps {
            builder = builder.step(step);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_outputs_preserve_unit_order() {
        let exec = executor(MockProvider::echo());
        let spec = spec_with(
            vec![Step::new("echo", "inline: Echo: ${row.text}")],
            true,
        );
        let units = Arc::new(row_units(&["ok", "bad", "fine"]));
        let outcome = exec
            .execute(&spec, units, Arc::new(HashMap::new()), "run")
            .await
            .unwrap();
        assert_eq!(outcome.unit_outputs.len(), 3);
        assert_eq!(outcome.unit_outputs[0]["echo"], "Echo: ok");
        assert_eq!(outcome.unit_outputs[1]["echo"], "Echo: bad");
        assert_eq!(outcome.unit_outputs[2]["echo"], "Echo: fine");
        assert_eq!(
            outcome.all_outputs["echo"],
            vec![json!("Echo: ok"), json!("Echo: bad"), json!("Echo: fine")]
        );
        assert_eq!(outcome.failed_units, 0);
    }

    #[tokio::test]
    async fn test_second_step_sees_all_scope() {
        let exec = executor(MockProvider::echo());
        let spec = spec_with(
            vec![
                Step::new("first", "inline: Echo: ${chunk.text}"),
                Step::new("second", "inline: Join: ${join(all.first, \" + \")}"),
            ],
            true,
        );
        let units = Arc::new(chunk_units(&["a", "b"]));
        let outcome = exec
            .execute(&spec, units, Arc::new(HashMap::new()), "run")
            .await
            .unwrap();
        assert_eq!(
            outcome.unit_outputs[0]["second"],
            "Join: Echo: a + Echo: b"
        );
    }

    #[tokio::test]
    async fn test_continue_on_error_records_failures() {
        // Unresolvable binding fails interpolation for every unit.
        let exec = executor(MockProvider::echo());
        let step = Step::new("echo", "inline: ${missing.path}");
        let spec = spec_with(vec![step], true);
        let units = Arc::new(chunk_units(&["a", "b"]));
        let outcome = exec
            .execute(&spec, units, Arc::new(HashMap::new()), "run")
            .await
            .unwrap();
        assert_eq!(outcome.failed_units, 2);
        assert_eq!(outcome.unit_outputs[0]["echo"]["error"], "processing");
        // Failed units do not reach the all scope.
        assert!(outcome.all_outputs["echo"].is_empty());
    }

    #[tokio::test]
    async fn test_halt_without_continue_on_error() {
        let exec = executor(MockProvider::echo());
        let spec = spec_with(vec![Step::new("echo", "inline: ${missing.path}")], false);
        let units = Arc::new(chunk_units(&["a", "b"]));
        let err = exec
            .execute(&spec, units, Arc::new(HashMap::new()), "run")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Processing(_)));
    }

    #[tokio::test]
    async fn test_provider_capability_error_halts_despite_continue() {
        let exec = executor(MockProvider::echo().without_streaming());
        let step = Step::new("echo", "inline: Echo: ${chunk.text}")
            .with_infer_mode(InferMode::Stream);
        let spec = spec_with(vec![step], true);
        let units = Arc::new(chunk_units(&["a"]));
        let err = exec
            .execute(&spec, units, Arc::new(HashMap::new()), "run")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Provider(_)));
    }

    #[tokio::test]
    async fn test_json_enforcement_failure_recorded() {
        let exec = executor(MockProvider::fixed("not json"));
        let step = Step::new("parse", "inline: Parse ${chunk.text}")
            .expecting_json(None, 1);
        let spec = spec_with(vec![step], true);
        let units = Arc::new(chunk_units(&["a"]));
        let outcome = exec
            .execute(&spec, units, Arc::new(HashMap::new()), "run")
            .await
            .unwrap();
        assert_eq!(outcome.failed_units, 1);
        assert_eq!(outcome.unit_outputs[0]["parse"]["parse_error"], "parse_error");
        assert_eq!(outcome.unit_outputs[0]["parse"]["raw_text"], "not json");
    }

    #[tokio::test]
    async fn test_step_telemetry_aggregated() {
        let exec = executor(MockProvider::echo().without_streaming());
        let spec = spec_with(vec![Step::new("echo", "inline: Echo: ${chunk.text}")], true);
        let units = Arc::new(chunk_units(&["a", "b"]));
        let outcome = exec
            .execute(&spec, units, Arc::new(HashMap::new()), "run")
            .await
            .unwrap();
        let agg = &outcome.step_telemetry["echo"];
        assert_eq!(agg.calls, 2);
        assert!(!agg.streaming);
        assert_eq!(agg.fallback_reason.as_deref(), Some("streaming_unsupported"));
    }

    #[tokio::test]
    async fn test_cancellation_marks_outcome() {
        let exec = executor(MockProvider::echo());
        exec.cancel.store(true, Ordering::Relaxed);
        let spec = spec_with(vec![Step::new("echo", "inline: Echo: ${chunk.text}")], true);
        let units = Arc::new(chunk_units(&["a"]));
        let outcome = exec
            .execute(&spec, units, Arc::new(HashMap::new()), "run")
            .await
            .unwrap();
        assert!(outcome.cancelled);
        assert!(outcome.unit_outputs[0].is_empty());
    }
}
