//! Export sinks.
//!
//! An [`ExportSink`] accepts serialized record buffers. Write modes:
//! `Append`, `Overwrite` (staged through a temp file, then atomically
//! swapped), and `Upsert` (requires `key_fields`). [`FileSink`] is the
//! in-tree reference implementation over JSONL files.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// How a write lands in the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Append to existing content.
    #[default]
    Append,
    /// Replace existing content atomically.
    Overwrite,
    /// Merge by key fields; later records win.
    Upsert,
}

/// Options for one write call.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// The write mode.
    pub mode: WriteMode,
    /// Optional record schema, passed through to sinks that enforce one.
    pub schema: Option<Value>,
    /// Key fields identifying a record; required for upsert.
    pub key_fields: Option<Vec<String>>,
}

/// Result of one write call.
#[derive(Debug, Clone)]
pub struct ExportResult {
    /// Destination description (path or table).
    pub destination: String,
    /// Bytes accepted.
    pub bytes_written: usize,
}

/// A typed destination for serialized records.
#[async_trait]
pub trait ExportSink: Send + Sync {
    /// Sink name for logging.
    fn name(&self) -> &str;

    /// Write a serialized buffer.
    async fn write(&self, payload: &[u8], options: &WriteOptions) -> Result<ExportResult>;

    /// Flush and release resources. Called once at run end.
    async fn finalize(&self) -> Result<()>;
}

/// File sink over a single JSONL path.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    /// Create a sink writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Export(format!("mkdir {}: {e}", parent.display())))?;
        }
        Ok(())
    }

    fn write_atomic(&self, payload: &[u8]) -> Result<()> {
        self.ensure_parent()?;
        let dir = self
            .path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| EngineError::Export(format!("temp file in {}: {e}", dir.display())))?;
        std::io::Write::write_all(&mut tmp, payload)
            .map_err(|e| EngineError::Export(format!("stage write: {e}")))?;
        tmp.persist(&self.path)
            .map_err(|e| EngineError::Export(format!("swap {}: {e}", self.path.display())))?;
        Ok(())
    }

    fn upsert(&self, payload: &[u8], key_fields: &[String]) -> Result<()> {
        let key_of = |record: &Value| -> String {
            key_fields
                .iter()
                .map(|field| {
                    record
                        .get("output")
                        .and_then(|o| o.get(field))
                        .or_else(|| record.get(field))
                        .map(|v| v.to_string())
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>()
                .join("\u{1f}")
        };

        let existing = std::fs::read_to_string(&self.path).unwrap_or_default();
        let mut merged: Vec<(String, String)> = Vec::new();
        let upsert_line = |line: &str, merged: &mut Vec<(String, String)>| {
            let Ok(record) = serde_json::from_str::<Value>(line) else {
                return;
            };
            let key = key_of(&record);
            match merged.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = line.to_string(),
                None => merged.push((key, line.to_string())),
            }
        };
        for line in existing.lines().filter(|l| !l.trim().is_empty()) {
            upsert_line(line, &mut merged);
        }
        let incoming = String::from_utf8_lossy(payload);
        for line in incoming.lines().filter(|l| !l.trim().is_empty()) {
            upsert_line(line, &mut merged);
        }

        let mut out = String::new();
        for (_, line) in &merged {
            out.push_str(line);
            out.push('\n');
        }
        self.write_atomic(out.as_bytes())
    }
}

#[async_trait]
impl ExportSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn write(&self, payload: &[u8], options: &WriteOptions) -> Result<ExportResult> {
        match options.mode {
            WriteMode::Append => {
                self.ensure_parent()?;
                use std::io::Write as _;
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .map_err(|e| {
                        EngineError::Export(format!("open {}: {e}", self.path.display()))
                    })?;
                file.write_all(payload)
                    .map_err(|e| EngineError::Export(format!("append: {e}")))?;
            }
            WriteMode::Overwrite => self.write_atomic(payload)?,
            WriteMode::Upsert => {
                let key_fields = options.key_fields.as_deref().ok_or_else(|| {
                    EngineError::Export("upsert requires key_fields".to_string())
                })?;
                if key_fields.is_empty() {
                    return Err(EngineError::Export("upsert requires key_fields".into()));
                }
                self.upsert(payload, key_fields)?;
            }
        }
        Ok(ExportResult {
            destination: self.path.display().to_string(),
            bytes_written: payload.len(),
        })
    }

    async fn finalize(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sink_in(dir: &tempfile::TempDir) -> FileSink {
        FileSink::new(dir.path().join("out.jsonl"))
    }

    #[tokio::test]
    async fn test_append_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir);
        let opts = WriteOptions::default();
        sink.write(b"line one\n", &opts).await.unwrap();
        sink.write(b"line two\n", &opts).await.unwrap();
        let content = std::fs::read_to_string(dir.path().join("out.jsonl")).unwrap();
        assert_eq!(content, "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_overwrite_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir);
        let opts = WriteOptions {
            mode: WriteMode::Overwrite,
            ..WriteOptions::default()
        };
        sink.write(b"first\n", &opts).await.unwrap();
        sink.write(b"second\n", &opts).await.unwrap();
        let content = std::fs::read_to_string(dir.path().join("out.jsonl")).unwrap();
        assert_eq!(content, "second\n");
    }

    #[tokio::test]
    async fn test_upsert_requires_key_fields() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir);
        let err = sink
            .write(
                b"{}\n",
                &WriteOptions {
                    mode: WriteMode::Upsert,
                    ..WriteOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Export(_)));
    }

    #[tokio::test]
    async fn test_upsert_merges_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir);
        let opts = WriteOptions {
            mode: WriteMode::Upsert,
            key_fields: Some(vec!["id".into()]),
            ..WriteOptions::default()
        };
        let first = format!("{}\n{}\n", json!({"id": "a", "v": 1}), json!({"id": "b", "v": 2}));
        sink.write(first.as_bytes(), &opts).await.unwrap();
        let second = format!("{}\n", json!({"id": "a", "v": 9}));
        sink.write(second.as_bytes(), &opts).await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("out.jsonl")).unwrap();
        let records: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        let a = records.iter().find(|r| r["id"] == "a").unwrap();
        assert_eq!(a["v"], 9);
    }

    #[tokio::test]
    async fn test_write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("nested/deep/out.jsonl"));
        sink.write(b"x\n", &WriteOptions::default()).await.unwrap();
        assert!(dir.path().join("nested/deep/out.jsonl").exists());
    }
}
