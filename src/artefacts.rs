//! Artefact persistence under the run directory.
//!
//! Every file is written through a temp-file + atomic-rename pair, and all
//! record streams are serialized in unit/document order, so re-running with
//! identical inputs yields byte-identical `docs.jsonl`, `chunks.jsonl`, and
//! `manifest.json`.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::types::{Document, ExecutionUnit, Manifest, RunRecord, UnitKind};

/// Writer for one run's artefact directory.
pub struct ArtefactWriter {
    run_dir: PathBuf,
    written: Vec<PathBuf>,
}

impl ArtefactWriter {
    /// Create `<artefacts_dir>/<run_id>/` and a writer over it.
    pub fn new(artefacts_dir: &Path, run_id: &str) -> Result<Self> {
        let run_dir = artefacts_dir.join(run_id);
        std::fs::create_dir_all(&run_dir)
            .map_err(|e| EngineError::Processing(format!("mkdir {}: {e}", run_dir.display())))?;
        Ok(Self {
            run_dir,
            written: Vec::new(),
        })
    }

    /// The run directory.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Paths written so far, in write order.
    pub fn written_paths(&self) -> Vec<String> {
        self.written
            .iter()
            .map(|p| p.display().to_string())
            .collect()
    }

    fn write_atomic(&mut self, relative: &str, payload: &[u8]) -> Result<PathBuf> {
        let target = self.run_dir.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Processing(format!("mkdir {}: {e}", parent.display())))?;
        }
        let dir = target
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.run_dir.clone());
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| EngineError::Processing(format!("temp file in {}: {e}", dir.display())))?;
        tmp.write_all(payload)
            .map_err(|e| EngineError::Processing(format!("stage write: {e}")))?;
        tmp.persist(&target)
            .map_err(|e| EngineError::Processing(format!("rename to {}: {e}", target.display())))?;
        self.written.push(target.clone());
        Ok(target)
    }

    fn jsonl<I: IntoIterator<Item = Value>>(records: I) -> Result<Vec<u8>> {
        let mut out = String::new();
        for record in records {
            out.push_str(&serde_json::to_string(&record)?);
            out.push('\n');
        }
        Ok(out.into_bytes())
    }

    /// Write `docs.jsonl`, one document per line in stream order.
    pub fn write_documents(&mut self, documents: &[Document]) -> Result<PathBuf> {
        let payload = Self::jsonl(documents.iter().map(Document::to_record))?;
        self.write_atomic("docs.jsonl", &payload)
    }

    /// Write `chunks.jsonl` or `rows.jsonl` depending on the unit stream.
    pub fn write_units(&mut self, units: &[ExecutionUnit]) -> Result<Option<PathBuf>> {
        let mut chunk_records = Vec::new();
        let mut row_records = Vec::new();
        for unit in units {
            match &unit.kind {
                UnitKind::Chunk(chunk) => chunk_records.push(serde_json::to_value(chunk)?),
                UnitKind::Row(row) => {
                    let mut record = serde_json::Map::new();
                    record.insert("doc_id".into(), Value::String(unit.doc_id.clone()));
                    record.insert("source_uri".into(), Value::String(row.source_uri.clone()));
                    record.insert("row_index".into(), Value::from(row.row_index as u64));
                    record.insert("row".into(), Value::Object(row.values.clone()));
                    record.insert("text".into(), Value::String(row.text.clone()));
                    row_records.push(Value::Object(record));
                }
                UnitKind::Group(_) => {}
            }
        }
        if !row_records.is_empty() {
            let payload = Self::jsonl(row_records)?;
            return self.write_atomic("rows.jsonl", &payload).map(Some);
        }
        if !chunk_records.is_empty() {
            let payload = Self::jsonl(chunk_records)?;
            return self.write_atomic("chunks.jsonl", &payload).map(Some);
        }
        Ok(None)
    }

    /// Write `outputs.jsonl`: `{unit_id, unit_index, ..row values,
    /// step_outputs}` per unit, in unit order. Row units echo their
    /// pass-through columns into the record for export-ready joins.
    pub fn write_outputs(
        &mut self,
        units: &[ExecutionUnit],
        step_outputs: &[serde_json::Map<String, Value>],
    ) -> Result<PathBuf> {
        let records = units.iter().zip(step_outputs.iter()).map(|(unit, outputs)| {
            let mut record = serde_json::Map::new();
            record.insert("unit_id".into(), Value::String(unit.unit_id()));
            record.insert("unit_index".into(), Value::from(unit.index as u64));
            if let UnitKind::Row(row) = &unit.kind {
                for (name, value) in &row.values {
                    record.entry(name.clone()).or_insert_with(|| value.clone());
                }
            }
            record.insert("step_outputs".into(), Value::Object(outputs.clone()));
            Value::Object(record)
        });
        let payload = Self::jsonl(records)?;
        self.write_atomic("outputs.jsonl", &payload)
    }

    /// Write `manifest.json` (sorted keys, deterministic bytes).
    pub fn write_manifest(&mut self, manifest: &Manifest) -> Result<PathBuf> {
        let payload = serde_json::to_vec_pretty(manifest)?;
        self.write_atomic("manifest.json", &payload)
    }

    /// Write a retrieval log under `rag/<pipeline>.jsonl`.
    pub fn write_retrieval_log(&mut self, pipeline: &str, records: &[Value]) -> Result<PathBuf> {
        let payload = Self::jsonl(records.iter().cloned())?;
        self.write_atomic(&format!("rag/{pipeline}.jsonl"), &payload)
    }

    /// Write a serialized output buffer under the run directory.
    pub fn write_saved_output(&mut self, relative: &str, payload: &[u8]) -> Result<PathBuf> {
        self.write_atomic(relative, payload)
    }

    /// Write `run.yaml`. Called exactly once, at run end.
    pub fn write_run_record(&mut self, record: &RunRecord) -> Result<PathBuf> {
        let payload = serde_yaml::to_string(record)
            .map_err(|e| EngineError::Processing(format!("run record serialisation: {e}")))?;
        self.write_atomic("run.yaml", payload.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, RunStatus};
    use serde_json::{json, Map};
    use std::collections::BTreeMap;

    fn chunk_unit(index: usize, id: &str) -> ExecutionUnit {
        ExecutionUnit {
            index,
            doc_id: "doc_1".into(),
            source_uri: "file://a.txt".into(),
            kind: UnitKind::Chunk(Chunk {
                id: id.into(),
                doc_id: "doc_1".into(),
                text: format!("text {index}"),
                tokens_estimate: 2,
                offset: index * 10,
                metadata: Map::new(),
            }),
        }
    }

    #[test]
    fn test_layout_and_written_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArtefactWriter::new(dir.path(), "20250101T000000Z-ab12").unwrap();
        writer.write_documents(&[]).unwrap();
        writer.write_manifest(&Manifest::default()).unwrap();
        assert!(dir
            .path()
            .join("20250101T000000Z-ab12/docs.jsonl")
            .exists());
        assert!(dir
            .path()
            .join("20250101T000000Z-ab12/manifest.json")
            .exists());
        assert_eq!(writer.written_paths().len(), 2);
    }

    #[test]
    fn test_outputs_in_unit_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArtefactWriter::new(dir.path(), "run").unwrap();
        let units = vec![chunk_unit(0, "c0"), chunk_unit(1, "c1")];
        let mut o0 = Map::new();
        o0.insert("echo".into(), json!("zero"));
        let mut o1 = Map::new();
        o1.insert("echo".into(), json!("one"));
        let path = writer.write_outputs(&units, &[o0, o1]).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0]["unit_id"], "c0");
        assert_eq!(lines[0]["step_outputs"]["echo"], "zero");
        assert_eq!(lines[1]["unit_index"], 1);
    }

    #[test]
    fn test_manifest_bytes_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::default();
        manifest
            .documents
            .entry("doc_b".into())
            .or_default()
            .chunk_ids
            .push("c1".into());
        manifest
            .documents
            .entry("doc_a".into())
            .or_default()
            .chunk_ids
            .push("c0".into());

        let mut w1 = ArtefactWriter::new(dir.path(), "run1").unwrap();
        let p1 = w1.write_manifest(&manifest).unwrap();
        let mut w2 = ArtefactWriter::new(dir.path(), "run2").unwrap();
        let p2 = w2.write_manifest(&manifest).unwrap();
        assert_eq!(std::fs::read(p1).unwrap(), std::fs::read(p2).unwrap());
    }

    #[test]
    fn test_rows_file_for_row_units() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArtefactWriter::new(dir.path(), "run").unwrap();
        let mut values = Map::new();
        values.insert("id".into(), json!("1"));
        let unit = ExecutionUnit {
            index: 0,
            doc_id: "doc_1".into(),
            source_uri: "file://t.csv".into(),
            kind: UnitKind::Row(crate::types::Row {
                row_index: 0,
                values,
                source_uri: "file://t.csv".into(),
                filename: "t.csv".into(),
                text: "ok".into(),
            }),
        };
        let path = writer.write_units(&[unit]).unwrap().unwrap();
        assert!(path.ends_with("rows.jsonl"));
        let text = std::fs::read_to_string(path).unwrap();
        let record: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(record["row"]["id"], "1");
        assert_eq!(record["row_index"], 0);
    }

    #[test]
    fn test_run_record_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArtefactWriter::new(dir.path(), "run").unwrap();
        let record = RunRecord {
            run_id: "run".into(),
            status: RunStatus::Completed,
            started_at: "2025-01-01T00:00:00Z".into(),
            finished_at: "2025-01-01T00:00:01Z".into(),
            config_hash: "abc".into(),
            prompts_used: vec![],
            metrics: BTreeMap::new(),
            step_telemetry: BTreeMap::new(),
            artefact_paths: vec![],
        };
        let path = writer.write_run_record(&record).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("status: completed"));
        assert!(text.contains("run_id: run"));
    }

    #[test]
    fn test_retrieval_log_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArtefactWriter::new(dir.path(), "run").unwrap();
        let path = writer
            .write_retrieval_log("kb", &[json!({"query": "q"})])
            .unwrap();
        assert!(path.ends_with("rag/kb.jsonl"));
        assert!(path.exists());
    }
}
