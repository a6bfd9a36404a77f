//! # inferchain
//!
//! Declarative orchestration engine for LLM inference pipelines. A caller
//! describes where source data lives, how to normalize it into units (text
//! chunks, table rows, or image groups), which prompts to evaluate against a
//! provider, and where structured results land. The engine executes the
//! chain with bounded concurrency, provider-agnostic retries, streaming or
//! regular inference under a single mode/fallback contract, JSON-schema
//! enforcement with repair-via-reprompt, optional retrieval-augmented
//! context, and a deterministic, content-addressed artefact trail.
//!
//! ## Core Concepts
//!
//! - **[`Engine`]** — assembled runtime: provider + connector + prompts +
//!   retrieval + sinks. Built once, runs many pipelines.
//! - **[`PipelineSpec`]** — an ordered chain of [`Step`]s over a fixed unit
//!   set, plus output specifications.
//! - **[`Provider`]** — object-safe adapter over an LLM endpoint with a
//!   `complete`/`stream` contract and a streaming capability flag.
//! - **[`invoke_with_mode`]** — the uniform dispatch path: capability check,
//!   streaming/regular selection, fallback, per-call telemetry.
//! - **[`RunSummary`]** — run id, artefact paths, status, and metrics.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use inferchain::{
//!     connector::LocalConnector, processing::UnitMode, provider::HttpProvider,
//!     Engine, PipelineSpec, Step,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = Arc::new(
//!         HttpProvider::new("https://api.example.com", "gpt-4o-mini")
//!             .with_api_key(std::env::var("API_KEY")?),
//!     );
//!     let connector = Arc::new(LocalConnector::new("./data"));
//!     let engine = Engine::builder(provider, connector).build()?;
//!
//!     let spec = PipelineSpec::builder("summarise")
//!         .selectors(vec!["**/*.txt".into()])
//!         .unit_mode(UnitMode::TextChunks)
//!         .step(Step::new("summary", "inline: Summarise: ${chunk.text}"))
//!         .build()?;
//!
//!     let summary = engine.run(&spec).await?;
//!     println!("run {} -> {}", summary.run_id, summary.run_dir.display());
//!     Ok(())
//! }
//! ```

pub mod artefacts;
pub mod config;
pub mod connector;
pub mod dispatch;
pub mod enforce;
pub mod error;
pub mod events;
pub mod executor;
pub mod export;
pub mod ids;
pub mod processing;
pub mod prompts;
pub mod provider;
pub mod retrieval;
pub mod retry;
pub mod runner;
pub mod secrets;
pub mod serialize;
pub mod step;
pub mod streaming;
pub mod telemetry;
pub mod template;
pub mod types;

pub use config::EngineConfig;
pub use dispatch::{invoke_with_mode, InferMode, InferenceTelemetry, RuntimeContext, MODE_ENV_VAR};
pub use error::{EngineError, Result};
pub use events::{Event, EventHandler, FnEventHandler};
pub use provider::{Completion, Message, Provider, TokenChunk};
pub use retry::RetryPolicy;
pub use runner::{Engine, EngineBuilder, RunSummary};
pub use step::{OutputSpec, PipelineSpec, Step, StepMode};
pub use streaming::StreamDecoder;
pub use types::{Manifest, RunRecord, RunStatus};
