//! Engine facade: wires connectors, providers, prompts, retrieval, and
//! sinks into a single run entry point.
//!
//! A run resolves secrets and the mode override once, lists and loads
//! resources, collects the unit set and manifest, executes the step chain,
//! and finalizes artefacts, the run record, and exports.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::artefacts::ArtefactWriter;
use crate::config::EngineConfig;
use crate::connector::Connector;
use crate::dispatch::RuntimeContext;
use crate::error::{EngineError, Result};
use crate::events::EventHandler;
use crate::executor::{ExecutionOutcome, Executor};
use crate::ids;
use crate::processing::{collect_units, load_document, UnitOptions};
use crate::prompts::PromptRegistry;
use crate::provider::Provider;
use crate::retrieval::RetrievalPipeline;
use crate::secrets::{Redactor, SecretCache, SecretProvider};
use crate::serialize::{serialize_outputs, ColumnarEncoder};
use crate::step::PipelineSpec;
use crate::telemetry;
use crate::types::{Document, RunRecord, RunStatus};
use crate::export::{ExportSink, WriteOptions};

/// Summary returned to the caller at run end.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: String,
    /// The run's artefact directory.
    pub run_dir: std::path::PathBuf,
    /// Terminal status.
    pub status: RunStatus,
    /// Counter snapshot at run end.
    pub metrics: std::collections::BTreeMap<String, f64>,
    /// Every artefact written during the run.
    pub artefact_paths: Vec<String>,
}

/// The assembled engine. Construct via [`Engine::builder`].
pub struct Engine {
    provider: Arc<dyn Provider>,
    connector: Arc<dyn Connector>,
    config: EngineConfig,
    prompts: Arc<PromptRegistry>,
    retrieval: HashMap<String, Arc<dyn RetrievalPipeline>>,
    sinks: HashMap<String, Arc<dyn ExportSink>>,
    columnar: Option<Arc<dyn ColumnarEncoder>>,
    events: Option<Arc<dyn EventHandler>>,
    cancel: Arc<AtomicBool>,
    redactor: Arc<Redactor>,
    secrets: HashMap<String, String>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Start building an engine around a provider and a connector.
    pub fn builder(provider: Arc<dyn Provider>, connector: Arc<dyn Connector>) -> EngineBuilder {
        EngineBuilder {
            provider,
            connector,
            config: EngineConfig::default(),
            prompts: PromptRegistry::new(),
            retrieval: HashMap::new(),
            sinks: HashMap::new(),
            columnar: None,
            events: None,
            cancel: None,
            secret_provider: None,
            required_secrets: Vec::new(),
        }
    }

    /// The shared cancellation flag; set it to stop the run.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// A secret resolved at build time, by logical name.
    ///
    /// Secrets are for provider wiring only; they are never bound into the
    /// template scope.
    pub fn secret(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(String::as_str)
    }

    fn effective_unit_options(&self, spec: &PipelineSpec) -> UnitOptions {
        let mut options = self.config.processing.clone();
        if let Some(table) = &spec.units.table {
            options.table = table.clone();
        }
        if let Some(group_size) = spec.units.group_size {
            options.group_size = group_size;
        }
        options
    }

    /// Execute a pipeline end to end and persist its artefacts.
    pub async fn run(&self, spec: &PipelineSpec) -> Result<RunSummary> {
        ids::configure_hasher(self.config.hash_algo()?)?;
        let runtime = RuntimeContext::from_env()?;
        telemetry::reset();

        let run_id = ids::new_run_id();
        let started_at = ids::utc_now_iso();
        info!(run_id = %run_id, pipeline = %spec.name, "run started");

        // Collect inputs.
        let resources = self.connector.list(&spec.units.selectors).await?;
        let mut documents = Vec::with_capacity(resources.len());
        for resource in &resources {
            let data = self.connector.open(resource).await?;
            documents.push(load_document(resource, &data));
        }
        let options = self.effective_unit_options(spec);
        let (units, manifest) = collect_units(&documents, spec.units.mode, &options)?;
        telemetry::set_value("docs", documents.len() as f64);
        telemetry::set_value("units", units.len() as f64);

        let doc_lookup: HashMap<String, Document> = documents
            .iter()
            .map(|d| (d.id.clone(), d.clone()))
            .collect();

        // Execute the chain.
        let executor = Executor {
            provider: Arc::clone(&self.provider),
            prompts: Arc::clone(&self.prompts),
            retrieval: self.retrieval.clone(),
            policy: Arc::new(self.config.retry.to_policy()?),
            runtime,
            events: self.events.clone(),
            cancel: Arc::clone(&self.cancel),
            redactor: Arc::clone(&self.redactor),
            join_max_chars: self.config.interpolation.all_join_max_chars,
            defaults: self.config.executor.clone(),
        };
        let units = Arc::new(units);
        let docs_arc = Arc::new(doc_lookup);

        let deadline = spec
            .run_deadline_s
            .or(self.config.executor.run_deadline_s);
        let execution = executor.execute(spec, Arc::clone(&units), docs_arc, &run_id);
        let outcome = match deadline {
            Some(seconds) => tokio::time::timeout(Duration::from_secs(seconds), execution)
                .await
                .map_err(|_| EngineError::inference("deadline_exceeded"))??,
            None => execution.await?,
        };

        self.finalize(spec, &run_id, &started_at, &documents, &units, manifest, outcome)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        spec: &PipelineSpec,
        run_id: &str,
        started_at: &str,
        documents: &[Document],
        units: &[crate::types::ExecutionUnit],
        manifest: crate::types::Manifest,
        outcome: ExecutionOutcome,
    ) -> Result<RunSummary> {
        let mut writer = ArtefactWriter::new(&self.config.artefacts_dir(), run_id)?;
        writer.write_documents(documents)?;
        writer.write_units(units)?;
        writer.write_outputs(units, &outcome.unit_outputs)?;
        writer.write_manifest(&manifest)?;
        for (pipeline, records) in &outcome.rag_records {
            writer.write_retrieval_log(pipeline, records)?;
        }

        // Persist and export requested outputs.
        for output in &spec.outputs {
            let from = match &output.from {
                Some(name) => name.clone(),
                None => match spec.steps.last() {
                    Some(step) => step.output_name.clone(),
                    None => continue,
                },
            };
            let Some(values) = outcome.all_outputs.get(&from) else {
                return Err(EngineError::Config(format!(
                    "outputs.from references unknown step output: {from:?}"
                )));
            };
            let payload = serialize_outputs(
                values,
                output.format,
                run_id,
                self.columnar.as_deref(),
            )?;
            if let Some(save) = &output.save {
                let relative = save.replace("${run_id}", run_id);
                writer.write_saved_output(&relative, &payload)?;
            }
            if let Some(sink_name) = &output.export {
                let sink = self.sinks.get(sink_name).ok_or_else(|| {
                    EngineError::Config(format!("unknown export sink: {sink_name:?}"))
                })?;
                match sink.write(&payload, &WriteOptions::default()).await {
                    Ok(result) => {
                        info!(sink = %sink_name, bytes = result.bytes_written, "exported");
                        sink.finalize().await?;
                    }
                    Err(e) => {
                        if !spec
                            .continue_on_error
                            .unwrap_or(self.config.executor.continue_on_error)
                        {
                            return Err(e);
                        }
                        warn!(sink = %sink_name, error = %e, "export failed");
                    }
                }
            }
        }

        let status = if outcome.cancelled {
            RunStatus::Cancelled
        } else if outcome.failed_units > 0 {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };

        let record = RunRecord {
            run_id: run_id.to_string(),
            status,
            started_at: started_at.to_string(),
            finished_at: ids::utc_now_iso(),
            config_hash: self.config.config_hash(),
            prompts_used: outcome.prompts_used,
            metrics: telemetry::snapshot(),
            step_telemetry: outcome.step_telemetry,
            artefact_paths: writer.written_paths(),
        };
        writer.write_run_record(&record)?;

        info!(run_id = %run_id, status = ?status, failed_units = outcome.failed_units, "run finished");
        Ok(RunSummary {
            run_id: run_id.to_string(),
            run_dir: writer.run_dir().to_path_buf(),
            status,
            metrics: record.metrics,
            artefact_paths: writer.written_paths(),
        })
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    provider: Arc<dyn Provider>,
    connector: Arc<dyn Connector>,
    config: EngineConfig,
    prompts: PromptRegistry,
    retrieval: HashMap<String, Arc<dyn RetrievalPipeline>>,
    sinks: HashMap<String, Arc<dyn ExportSink>>,
    columnar: Option<Arc<dyn ColumnarEncoder>>,
    events: Option<Arc<dyn EventHandler>>,
    cancel: Option<Arc<AtomicBool>>,
    secret_provider: Option<Box<dyn SecretProvider>>,
    required_secrets: Vec<String>,
}

impl EngineBuilder {
    /// Set the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a prompt template.
    pub fn prompt(
        mut self,
        id: impl Into<String>,
        version: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        self.prompts.register(id, version, template);
        self
    }

    /// Use a pre-populated prompt registry.
    pub fn prompt_registry(mut self, registry: PromptRegistry) -> Self {
        self.prompts = registry;
        self
    }

    /// Register a retrieval pipeline under a name.
    pub fn retrieval(
        mut self,
        name: impl Into<String>,
        pipeline: Arc<dyn RetrievalPipeline>,
    ) -> Self {
        self.retrieval.insert(name.into(), pipeline);
        self
    }

    /// Register an export sink under a name.
    pub fn sink(mut self, name: impl Into<String>, sink: Arc<dyn ExportSink>) -> Self {
        self.sinks.insert(name.into(), sink);
        self
    }

    /// Supply a columnar encoder for `Columnar` outputs.
    pub fn columnar_encoder(mut self, encoder: Arc<dyn ColumnarEncoder>) -> Self {
        self.columnar = Some(encoder);
        self
    }

    /// Set the lifecycle event handler.
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = Some(handler);
        self
    }

    /// Share a cancellation flag with the caller.
    pub fn cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Set the secret provider used to resolve required secrets at build.
    pub fn secret_provider(mut self, provider: Box<dyn SecretProvider>) -> Self {
        self.secret_provider = Some(provider);
        self
    }

    /// Require a logical secret; resolved once at build, cached, and
    /// registered with the redactor.
    pub fn require_secret(mut self, name: impl Into<String>) -> Self {
        self.required_secrets.push(name.into());
        self
    }

    /// Resolve secrets and assemble the engine.
    pub fn build(self) -> crate::error::Result<Engine> {
        let mut redactor = Redactor::new();
        let mut secrets = HashMap::new();
        if !self.required_secrets.is_empty() {
            let provider = self.secret_provider.ok_or_else(|| {
                EngineError::Config("secrets required but no secret provider set".into())
            })?;
            let cache = SecretCache::new(provider);
            for name in &self.required_secrets {
                let value = cache.resolve(name)?;
                redactor.register(value.clone());
                secrets.insert(name.clone(), value);
            }
        }
        Ok(Engine {
            provider: self.provider,
            connector: self.connector,
            config: self.config,
            prompts: Arc::new(self.prompts),
            retrieval: self.retrieval,
            sinks: self.sinks,
            columnar: self.columnar,
            events: self.events,
            cancel: self
                .cancel
                .unwrap_or_else(|| Arc::new(AtomicBool::new(false))),
            redactor: Arc::new(redactor),
            secrets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::LocalConnector;
    use crate::provider::MockProvider;

    #[test]
    fn test_builder_requires_provider_for_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let result = Engine::builder(
            Arc::new(MockProvider::echo()),
            Arc::new(LocalConnector::new(dir.path())),
        )
        .require_secret("API_KEY")
        .build();
        assert!(matches!(result.unwrap_err(), EngineError::Config(_)));
    }

    #[test]
    fn test_builder_resolves_and_redacts_secrets() {
        struct Fixed;
        impl SecretProvider for Fixed {
            fn resolve(&self, _name: &str) -> crate::error::Result<String> {
                Ok("sekrit-value".into())
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::builder(
            Arc::new(MockProvider::echo()),
            Arc::new(LocalConnector::new(dir.path())),
        )
        .secret_provider(Box::new(Fixed))
        .require_secret("API_KEY")
        .build()
        .unwrap();
        assert_eq!(engine.secret("API_KEY"), Some("sekrit-value"));
        assert_eq!(
            engine.redactor.redact("token sekrit-value leaked"),
            "token **** leaked"
        );
    }
}
