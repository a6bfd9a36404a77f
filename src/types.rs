//! Core data model: resources, documents, units, manifest, run record.
//!
//! Chunks and blobs reference their document by id only; the [`Manifest`] is
//! the sole aggregator. All collections preserve source order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A logical addressable source produced by a connector.
///
/// Immutable during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Globally unique source URI.
    pub uri: String,
    /// Base file name (used for format sniffing).
    pub name: String,
    /// Normalized mime type.
    pub mime: String,
    /// Payload size in bytes, when known.
    pub size_bytes: Option<u64>,
    /// Entity tag or content hash, when the source provides one.
    pub etag_or_hash: Option<String>,
    /// RFC 3339 modification timestamp, when known.
    pub modified_at: Option<String>,
}

/// A non-text payload attached to a document (image or other binary part).
#[derive(Debug, Clone)]
pub struct Blob {
    /// Content-derived identifier.
    pub id: String,
    /// Mime type of the payload.
    pub mime: String,
    /// Raw bytes. Never serialized into artefacts.
    pub bytes: Vec<u8>,
    /// Free-form scalar metadata.
    pub metadata: Map<String, Value>,
}

impl Blob {
    /// Artefact-safe record: id, mime, size, metadata. Raw bytes are omitted;
    /// the id already binds the content.
    pub fn to_record(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".into(), Value::String(self.id.clone()));
        obj.insert("mime".into(), Value::String(self.mime.clone()));
        obj.insert("size_bytes".into(), Value::from(self.bytes.len() as u64));
        obj.insert("metadata".into(), Value::Object(self.metadata.clone()));
        Value::Object(obj)
    }
}

/// A normalized resource: canonical text and/or blobs plus metadata.
///
/// Created by the unit iterator, dropped at run end.
#[derive(Debug, Clone)]
pub struct Document {
    /// Content-derived identifier.
    pub id: String,
    /// URI of the originating resource.
    pub source_uri: String,
    /// Canonical UTF-8 text (NFC, LF line endings), when the resource is textual.
    pub text: Option<String>,
    /// Ordered non-text payloads.
    pub blobs: Vec<Blob>,
    /// Free-form scalar metadata.
    pub metadata: Map<String, Value>,
}

impl Document {
    /// One `docs.jsonl` line. Blob bytes are replaced by their records.
    pub fn to_record(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".into(), Value::String(self.id.clone()));
        obj.insert("source_uri".into(), Value::String(self.source_uri.clone()));
        obj.insert(
            "text".into(),
            self.text
                .as_ref()
                .map(|t| Value::String(t.clone()))
                .unwrap_or(Value::Null),
        );
        obj.insert(
            "blobs".into(),
            Value::Array(self.blobs.iter().map(Blob::to_record).collect()),
        );
        obj.insert("metadata".into(), Value::Object(self.metadata.clone()));
        Value::Object(obj)
    }
}

/// A text slice of a document. Order within a document is stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Content-derived identifier (folds in doc id, offset, length).
    pub id: String,
    /// Owning document id.
    pub doc_id: String,
    /// Chunk text.
    pub text: String,
    /// Approximate token count (whitespace-based estimate).
    pub tokens_estimate: usize,
    /// Byte offset of the chunk's leading unit within the document text.
    pub offset: usize,
    /// Free-form scalar metadata (splitter, index, length).
    pub metadata: Map<String, Value>,
}

/// A table record. `values` preserves source column order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    /// 0-based index after the header row, stable per source.
    pub row_index: usize,
    /// Selected columns in source order.
    pub values: Map<String, Value>,
    /// URI of the originating resource.
    pub source_uri: String,
    /// Base file name of the originating resource.
    pub filename: String,
    /// Text derived from the configured text column(s). Empty when the
    /// source cell is empty; downstream may skip such rows.
    pub text: String,
}

/// An ordered batch of blobs bound together for one multimodal call.
#[derive(Debug, Clone)]
pub struct ImageGroup {
    /// Stable group id derived from member blob ids.
    pub id: String,
    /// Optional caption rendered into the prompt.
    pub caption: Option<String>,
    /// Member blobs, in document order.
    pub blobs: Vec<Blob>,
    /// Source URIs of the member documents, in order.
    pub source_uris: Vec<String>,
}

/// A single, indivisible input to a model call.
#[derive(Debug, Clone)]
pub enum UnitKind {
    /// A text chunk.
    Chunk(Chunk),
    /// A table row.
    Row(Row),
    /// An image group.
    Group(ImageGroup),
}

/// Tagged execution unit carrying back-references to its document and source.
#[derive(Debug, Clone)]
pub struct ExecutionUnit {
    /// Position in the unit stream (0-based, source order).
    pub index: usize,
    /// Owning document id.
    pub doc_id: String,
    /// URI of the originating resource.
    pub source_uri: String,
    /// The unit payload.
    pub kind: UnitKind,
}

impl ExecutionUnit {
    /// Stable identifier for artefact records.
    pub fn unit_id(&self) -> String {
        match &self.kind {
            UnitKind::Chunk(c) => c.id.clone(),
            UnitKind::Row(r) => format!("{}_r{}", self.doc_id, r.row_index),
            UnitKind::Group(g) => g.id.clone(),
        }
    }

    /// The unit's primary text, used as the default retrieval query.
    pub fn text(&self) -> &str {
        match &self.kind {
            UnitKind::Chunk(c) => &c.text,
            UnitKind::Row(r) => &r.text,
            UnitKind::Group(g) => g.caption.as_deref().unwrap_or(""),
        }
    }
}

/// Per-document membership entry in the [`Manifest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Chunk ids in document order.
    pub chunk_ids: Vec<String>,
    /// Blob ids in document order.
    pub blob_ids: Vec<String>,
}

/// Authoritative mapping of document ids to chunk/blob ids for a run.
///
/// Serialized sorted by document id, so identical inputs yield a
/// byte-identical `manifest.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Document id to member ids.
    pub documents: BTreeMap<String, ManifestEntry>,
    /// Document id to row count, for table runs.
    pub row_counts: BTreeMap<String, usize>,
}

/// Prompt provenance recorded in the run record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptUsed {
    /// Registry id, or `inline` for inline templates.
    pub id: String,
    /// Registry version, or `v0` for inline templates.
    pub version: String,
    /// Hash of the template content.
    pub content_hash: String,
}

/// Per-step telemetry aggregates for the run record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepTelemetry {
    /// Total provider calls made for this step, including repair calls.
    pub calls: u64,
    /// Whether any call for this step streamed tokens.
    pub streaming: bool,
    /// Last fallback reason observed, if any call fell back.
    pub fallback_reason: Option<String>,
    /// Retry attempts beyond the first, summed across calls.
    pub retries: u64,
    /// Completion tokens, summed across calls (provider-reported or estimated).
    pub tokens_out: u64,
    /// Wall-clock latency, summed across calls.
    pub latency_ms: u64,
    /// Time to first byte, summed across calls.
    pub ttfb_ms: u64,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// All units emitted.
    Completed,
    /// At least one unit failed under `continue_on_error`.
    CompletedWithErrors,
    /// The run was cancelled; in-flight units were drained or aborted.
    Cancelled,
}

/// Audit artefact written exactly once at run end (`run.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run identifier.
    pub run_id: String,
    /// Terminal status.
    pub status: RunStatus,
    /// RFC 3339 start timestamp.
    pub started_at: String,
    /// RFC 3339 finish timestamp.
    pub finished_at: String,
    /// Hash of the effective engine configuration.
    pub config_hash: String,
    /// Prompts evaluated during the run, in first-use order.
    pub prompts_used: Vec<PromptUsed>,
    /// Counter snapshot at run end.
    pub metrics: BTreeMap<String, f64>,
    /// Per-step telemetry aggregates.
    pub step_telemetry: BTreeMap<String, StepTelemetry>,
    /// Every artefact written during the run.
    pub artefact_paths: Vec<String>,
}
