//! Output serialisation for sinks.
//!
//! The executor's ordered record buffer is serialized to JSONL (default),
//! CSV, or a caller-supplied columnar encoding. Compression is a
//! pass-through byte transform applied after serialisation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::template;

/// Supported serialisation formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One JSON record per line.
    #[default]
    Jsonl,
    /// Header = union of record keys in first-seen order.
    Csv,
    /// Caller-supplied columnar encoder.
    Columnar,
}

/// Encodes records into a columnar byte buffer (Parquet, Arrow, ...).
pub trait ColumnarEncoder: Send + Sync {
    /// Encode the ordered records.
    fn encode(&self, records: &[Value]) -> Result<Vec<u8>>;
}

/// A byte transform applied after serialisation (compression and the like).
pub trait ByteTransform: Send + Sync {
    /// Transform the serialized buffer.
    fn apply(&self, bytes: Vec<u8>) -> Result<Vec<u8>>;
}

/// The identity transform: no compression.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl ByteTransform for Identity {
    fn apply(&self, bytes: Vec<u8>) -> Result<Vec<u8>> {
        Ok(bytes)
    }
}

fn serialize_jsonl(values: &[Value], run_id: &str) -> Result<Vec<u8>> {
    let mut out = String::new();
    for (record_id, value) in values.iter().enumerate() {
        let mut record = Map::new();
        record.insert("run_id".into(), Value::String(run_id.to_string()));
        record.insert("record_id".into(), Value::from(record_id as u64));
        record.insert("output".into(), value.clone());
        out.push_str(&serde_json::to_string(&Value::Object(record))?);
        out.push('\n');
    }
    Ok(out.into_bytes())
}

fn serialize_csv(values: &[Value]) -> Result<Vec<u8>> {
    // Header: union of object keys in first-seen order; non-object records
    // fall into a single `output` column.
    let mut header: Vec<String> = Vec::new();
    for value in values {
        match value {
            Value::Object(map) => {
                for key in map.keys() {
                    if !header.iter().any(|h| h == key) {
                        header.push(key.clone());
                    }
                }
            }
            _ => {
                if !header.iter().any(|h| h == "output") {
                    header.push("output".to_string());
                }
            }
        }
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&header)
        .map_err(|e| EngineError::Processing(format!("csv serialisation failed: {e}")))?;
    for value in values {
        let row: Vec<String> = header
            .iter()
            .map(|column| match value {
                Value::Object(map) => map.get(column).map(template::stringify).unwrap_or_default(),
                other if column == "output" => template::stringify(other),
                _ => String::new(),
            })
            .collect();
        writer
            .write_record(&row)
            .map_err(|e| EngineError::Processing(format!("csv serialisation failed: {e}")))?;
    }
    writer
        .into_inner()
        .map_err(|e| EngineError::Processing(format!("csv serialisation failed: {e}")))
}

/// Serialize the ordered record buffer.
///
/// `Columnar` requires an encoder; omitting one is a configuration error.
pub fn serialize_outputs(
    values: &[Value],
    format: OutputFormat,
    run_id: &str,
    columnar: Option<&dyn ColumnarEncoder>,
) -> Result<Vec<u8>> {
    match format {
        OutputFormat::Jsonl => serialize_jsonl(values, run_id),
        OutputFormat::Csv => serialize_csv(values),
        OutputFormat::Columnar => match columnar {
            Some(encoder) => encoder.encode(values),
            None => Err(EngineError::Config(
                "columnar output requires a columnar encoder".into(),
            )),
        },
    }
}
