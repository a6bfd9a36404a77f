//! Declarative pipeline description: steps, unit selection, outputs.
//!
//! A [`PipelineSpec`] is a linear chain of [`Step`]s over a fixed unit set.
//! Builder validation fails closed on empty chains and colliding names.

use serde_json::{Map, Value};

use crate::dispatch::InferMode;
use crate::error::{EngineError, Result};
use crate::processing::{TableOptions, UnitMode};
use crate::provider::RequestParams;
use crate::retrieval::RetrievalBinding;
use crate::serialize::OutputFormat;

/// How the step's request body is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
    /// Text-only request.
    #[default]
    Text,
    /// Text plus the active document's blobs.
    Multimodal,
    /// Text plus the unit's image-group blobs.
    ImagesGroup,
}

/// What the step expects of its completion text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputExpectation {
    /// Free text.
    #[default]
    None,
    /// Valid JSON, optionally schema-checked.
    Json,
}

/// One logical inference operation applied to every unit.
#[derive(Debug, Clone)]
pub struct Step {
    /// Step identifier, unique within the pipeline.
    pub id: String,
    /// Prompt reference: `inline: ...` or a registry `id#version`.
    pub prompt: String,
    /// Optional system prompt.
    pub system_prompt: Option<String>,
    /// Name-to-expression bindings rendered into the prompt scope.
    pub input_bindings: Map<String, Value>,
    /// Request body assembly mode.
    pub mode: StepMode,
    /// Name under which the output lands in `all.*` and artefacts.
    pub output_name: String,
    /// Output expectation.
    pub output_expects: OutputExpectation,
    /// Minimal schema for JSON outputs.
    pub output_schema: Option<Value>,
    /// Repair rounds allowed for JSON outputs.
    pub parse_retries: u32,
    /// Per-step inference mode; `None` defers to the engine default.
    pub infer_mode: Option<InferMode>,
    /// Optional retrieval binding.
    pub retrieval: Option<RetrievalBinding>,
    /// Provider request parameters.
    pub params: RequestParams,
}

impl Step {
    /// Create a step; the output name defaults to the step id.
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            output_name: id.clone(),
            id,
            prompt: prompt.into(),
            system_prompt: None,
            input_bindings: Map::new(),
            mode: StepMode::default(),
            output_expects: OutputExpectation::default(),
            output_schema: None,
            parse_retries: 0,
            infer_mode: None,
            retrieval: None,
            params: RequestParams::default(),
        }
    }

    /// Set the system prompt.
    pub fn with_system(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Bind an input expression.
    pub fn bind(mut self, name: impl Into<String>, expr: impl Into<Value>) -> Self {
        self.input_bindings.insert(name.into(), expr.into());
        self
    }

    /// Set the request body mode.
    pub fn with_mode(mut self, mode: StepMode) -> Self {
        self.mode = mode;
        self
    }

    /// Rename the output.
    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.output_name = name.into();
        self
    }

    /// Expect JSON output, optionally schema-checked, with repair budget.
    pub fn expecting_json(mut self, schema: Option<Value>, parse_retries: u32) -> Self {
        self.output_expects = OutputExpectation::Json;
        self.output_schema = schema;
        self.parse_retries = parse_retries;
        self
    }

    /// Pin the inference mode for this step.
    pub fn with_infer_mode(mut self, mode: InferMode) -> Self {
        self.infer_mode = Some(mode);
        self
    }

    /// Attach a retrieval binding.
    pub fn with_retrieval(mut self, binding: RetrievalBinding) -> Self {
        self.retrieval = Some(binding);
        self
    }

    /// Set provider request parameters.
    pub fn with_params(mut self, params: RequestParams) -> Self {
        self.params = params;
        self
    }
}

/// Which resources feed the run and how they become units.
#[derive(Debug, Clone, Default)]
pub struct UnitSpec {
    /// Connector glob selectors.
    pub selectors: Vec<String>,
    /// Unit iteration mode.
    pub mode: UnitMode,
    /// Table options override for `TableRows` runs.
    pub table: Option<TableOptions>,
    /// Group size override for `ImagesGroup` runs.
    pub group_size: Option<usize>,
}

/// Where a step output is persisted or exported.
#[derive(Debug, Clone, Default)]
pub struct OutputSpec {
    /// Source step output; the last step's output when omitted.
    pub from: Option<String>,
    /// Path to save the serialized buffer (supports `${run_id}`).
    pub save: Option<String>,
    /// Named export sink to write to.
    pub export: Option<String>,
    /// Serialisation format.
    pub format: OutputFormat,
}

/// An ordered chain of steps over a unit set, plus outputs.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    /// Pipeline name, for logging.
    pub name: String,
    /// Input selection and unit mode.
    pub units: UnitSpec,
    /// Steps in execution order.
    pub steps: Vec<Step>,
    /// Output persistence/export specifications.
    pub outputs: Vec<OutputSpec>,
    /// Concurrent unit-step invocations; `None` defers to the engine config.
    pub concurrency: Option<usize>,
    /// Error policy; `None` defers to the engine config.
    pub continue_on_error: Option<bool>,
    /// Optional wall-clock deadline for the whole run, in seconds.
    pub run_deadline_s: Option<u64>,
}

impl PipelineSpec {
    /// Start building a pipeline.
    pub fn builder(name: impl Into<String>) -> PipelineSpecBuilder {
        PipelineSpecBuilder {
            spec: PipelineSpec {
                name: name.into(),
                units: UnitSpec::default(),
                steps: Vec::new(),
                outputs: Vec::new(),
                concurrency: None,
                continue_on_error: None,
                run_deadline_s: None,
            },
        }
    }
}

/// Builder with fail-closed validation.
pub struct PipelineSpecBuilder {
    spec: PipelineSpec,
}

impl PipelineSpecBuilder {
    /// Set the connector selectors.
    pub fn selectors(mut self, selectors: Vec<String>) -> Self {
        self.spec.units.selectors = selectors;
        self
    }

    /// Set the unit mode.
    pub fn unit_mode(mut self, mode: UnitMode) -> Self {
        self.spec.units.mode = mode;
        self
    }

    /// Override table options for this pipeline.
    pub fn table(mut self, table: TableOptions) -> Self {
        self.spec.units.table = Some(table);
        self
    }

    /// Override the image group size.
    pub fn group_size(mut self, size: usize) -> Self {
        self.spec.units.group_size = Some(size);
        self
    }

    /// Append a step.
    pub fn step(mut self, step: Step) -> Self {
        self.spec.steps.push(step);
        self
    }

    /// Append an output specification.
    pub fn output(mut self, output: OutputSpec) -> Self {
        self.spec.outputs.push(output);
        self
    }

    /// Set the concurrency budget.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.spec.concurrency = Some(concurrency);
        self
    }

    /// Set the error policy.
    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.spec.continue_on_error = Some(continue_on_error);
        self
    }

    /// Set the run deadline.
    pub fn run_deadline_s(mut self, seconds: u64) -> Self {
        self.spec.run_deadline_s = Some(seconds);
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<PipelineSpec> {
        let spec = self.spec;
        if spec.steps.is_empty() {
            return Err(EngineError::Config(
                "pipeline must have at least one step".into(),
            ));
        }
        if spec.concurrency == Some(0) {
            return Err(EngineError::Config(
                "concurrency must be a positive integer".into(),
            ));
        }
        let mut ids = std::collections::HashSet::new();
        let mut outputs = std::collections::HashSet::new();
        for step in &spec.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate step id: {:?}",
                    step.id
                )));
            }
            if !outputs.insert(step.output_name.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate step output name: {:?}",
                    step.output_name
                )));
            }
        }
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_defaults() {
        let spec = PipelineSpec::builder("analyse")
            .step(Step::new("echo", "inline: Echo: ${row.text}"))
            .build()
            .unwrap();
        assert_eq!(spec.concurrency, None);
        assert_eq!(spec.continue_on_error, None);
        assert_eq!(spec.steps[0].output_name, "echo");
    }

    #[test]
    fn test_empty_pipeline_fails() {
        let err = PipelineSpec::builder("empty").build().unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_zero_concurrency_fails() {
        let err = PipelineSpec::builder("p")
            .step(Step::new("a", "inline: x"))
            .concurrency(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_duplicate_step_id_fails() {
        let err = PipelineSpec::builder("p")
            .step(Step::new("a", "inline: x"))
            .step(Step::new("a", "inline: y"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn test_duplicate_output_name_fails() {
        let err = PipelineSpec::builder("p")
            .step(Step::new("a", "inline: x").with_output("shared"))
            .step(Step::new("b", "inline: y").with_output("shared"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate step output name"));
    }

    #[test]
    fn test_step_builder_chain() {
        let step = Step::new("classify", "triage#v2")
            .with_system("You label support tickets.")
            .bind("context", json!("${join(all.summaries, \"\\n\")}"))
            .expecting_json(Some(json!({"required": ["label"]})), 2)
            .with_infer_mode(InferMode::Regular);
        assert_eq!(step.output_name, "classify");
        assert_eq!(step.parse_retries, 2);
        assert_eq!(step.infer_mode, Some(InferMode::Regular));
        assert!(step.input_bindings.contains_key("context"));
    }
}
