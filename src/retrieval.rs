//! Retrieval-augmented context attachment.
//!
//! A step may name a prebuilt retrieval pipeline; before dispatch, the
//! engine renders the query, retrieves up to `top_k_text`/`top_k_images`
//! items, binds the text block and image payloads to template variables,
//! and records the retrieved identifiers for the per-run retrieval log.
//! Retrieval always runs before dispatch, so a retrieval failure never
//! masks a successful model call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::template::{self, Scope};
use crate::types::ExecutionUnit;

/// Default cap on the bound text block, in characters.
pub const DEFAULT_CONTEXT_MAX_CHARS: usize = 8_000;

/// A retrieved text item with provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedText {
    /// The text payload.
    pub text: String,
    /// Provenance identifier (source URI or item id).
    pub source_uri: String,
}

/// A retrieved image item with provenance.
#[derive(Debug, Clone)]
pub struct RetrievedImage {
    /// Mime type of the image.
    pub mime: String,
    /// Raw image bytes.
    pub bytes: Vec<u8>,
    /// Provenance identifier.
    pub source_uri: String,
}

/// Result of one retrieval call.
#[derive(Debug, Clone, Default)]
pub struct Retrieved {
    /// Ranked text items.
    pub texts: Vec<RetrievedText>,
    /// Ranked image items.
    pub images: Vec<RetrievedImage>,
}

/// An external retrieval pipeline. Called at most once per step per unit.
#[async_trait]
pub trait RetrievalPipeline: Send + Sync {
    /// Retrieve ranked items for a query.
    async fn retrieve(&self, query: &str, top_k_text: usize, top_k_images: usize)
        -> Result<Retrieved>;
}

/// A step's retrieval binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalBinding {
    /// Name of the configured retrieval pipeline.
    pub pipeline: String,
    /// Query template; the unit's own text when omitted.
    #[serde(default)]
    pub query: Option<String>,
    /// Text items requested.
    #[serde(default = "default_top_k_text")]
    pub top_k_text: usize,
    /// Image items requested.
    #[serde(default)]
    pub top_k_images: usize,
    /// Template variable receiving the newline-joined text block.
    #[serde(default = "default_text_var")]
    pub text_var: String,
    /// Template variable receiving the image provenance list.
    #[serde(default = "default_image_var")]
    pub image_var: String,
    /// Character cap on the bound text block.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

fn default_top_k_text() -> usize {
    3
}
fn default_text_var() -> String {
    "rag_context".to_string()
}
fn default_image_var() -> String {
    "rag_images".to_string()
}
fn default_max_chars() -> usize {
    DEFAULT_CONTEXT_MAX_CHARS
}

/// Outcome of a retrieval attachment: extra template bindings, image
/// payloads for the multimodal request, and the log record.
#[derive(Debug, Default)]
pub struct Attachment {
    /// Bindings added to the step's inputs (`text_var`, `image_var`).
    pub bindings: Map<String, Value>,
    /// Images to append to the provider request.
    pub images: Vec<RetrievedImage>,
    /// One `rag/<pipeline>.jsonl` record, when retrieval ran.
    pub log_record: Option<Value>,
}

/// Run retrieval for one unit and bind the results.
///
/// The query template is rendered against the unit scope; a blank query
/// skips retrieval entirely.
pub async fn attach_context(
    binding: &RetrievalBinding,
    pipeline: &dyn RetrievalPipeline,
    unit: &ExecutionUnit,
    scope: &Scope,
) -> Result<Attachment> {
    let query = match &binding.query {
        Some(expr) => {
            let rendered = template::render_binding(&Value::String(expr.clone()), scope)?;
            template::stringify(&rendered)
        }
        None => unit.text().to_string(),
    };
    let query = query.trim().to_string();
    if query.is_empty() {
        return Ok(Attachment::default());
    }

    let retrieved = pipeline
        .retrieve(&query, binding.top_k_text, binding.top_k_images)
        .await?;

    let mut attachment = Attachment::default();

    if !retrieved.texts.is_empty() {
        let mut block = retrieved
            .texts
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if binding.max_chars > 0 && block.len() > binding.max_chars {
            let mut cut = binding.max_chars;
            while cut > 0 && !block.is_char_boundary(cut) {
                cut -= 1;
            }
            block.truncate(cut);
            block.push_str("\n… [truncated]");
        }
        attachment
            .bindings
            .insert(binding.text_var.clone(), Value::String(block));
    }

    if !retrieved.images.is_empty() {
        let provenance: Vec<Value> = retrieved
            .images
            .iter()
            .map(|img| {
                let mut obj = Map::new();
                obj.insert("source_uri".into(), Value::String(img.source_uri.clone()));
                obj.insert("mime".into(), Value::String(img.mime.clone()));
                Value::Object(obj)
            })
            .collect();
        attachment
            .bindings
            .insert(binding.image_var.clone(), Value::Array(provenance));
        attachment.images = retrieved.images.clone();
    }

    let mut record = Map::new();
    record.insert("pipeline".into(), Value::String(binding.pipeline.clone()));
    record.insert("query".into(), Value::String(query));
    record.insert("unit_id".into(), Value::String(unit.unit_id()));
    record.insert(
        "text_ids".into(),
        Value::Array(
            retrieved
                .texts
                .iter()
                .map(|t| Value::String(t.source_uri.clone()))
                .collect(),
        ),
    );
    record.insert(
        "image_ids".into(),
        Value::Array(
            retrieved
                .images
                .iter()
                .map(|i| Value::String(i.source_uri.clone()))
                .collect(),
        ),
    );
    attachment.log_record = Some(Value::Object(record));

    Ok(attachment)
}
