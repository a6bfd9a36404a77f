//! Document loading and unit collection.
//!
//! [`load_document`] normalizes a resource payload into a document: textual
//! mime types become canonical text, image mime types become blobs.
//! [`collect_units`] then produces the ordered execution-unit set for the
//! selected mode, together with the run manifest.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::chunking::{self, ChunkOptions};
use super::table::{self, TableOptions};
use crate::error::{EngineError, Result};
use crate::ids;
use crate::types::{
    Blob, Chunk, Document, ExecutionUnit, ImageGroup, Manifest, Resource, UnitKind,
};

/// How resources are turned into execution units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitMode {
    /// Split document text into chunks.
    #[default]
    TextChunks,
    /// Parse tabular resources into rows.
    TableRows,
    /// Batch image blobs into groups.
    ImagesGroup,
}

/// Combined unit-iterator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct UnitOptions {
    /// Chunking parameters for [`UnitMode::TextChunks`].
    #[serde(default)]
    pub chunking: ChunkOptions,
    /// Table parameters for [`UnitMode::TableRows`].
    #[serde(default)]
    pub table: TableOptions,
    /// Blobs per group for [`UnitMode::ImagesGroup`].
    #[serde(default = "default_group_size")]
    pub group_size: usize,
}

fn default_group_size() -> usize {
    1
}

impl Default for UnitOptions {
    fn default() -> Self {
        Self {
            chunking: ChunkOptions::default(),
            table: TableOptions::default(),
            group_size: default_group_size(),
        }
    }
}

fn is_textual(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime == "application/json"
        || mime == "application/x-ndjson"
        || mime == "application/yaml"
}

/// Normalize raw resource bytes into a [`Document`].
///
/// Textual payloads are canonicalised (NFC, LF); image payloads become
/// blobs with content-derived ids. The document id folds in the source URI,
/// modification time, mime, and payload length.
pub fn load_document(resource: &Resource, data: &[u8]) -> Document {
    let doc_id = ids::document_id(
        &resource.uri,
        data,
        resource.modified_at.as_deref(),
        Some(&resource.mime),
    );

    let mut metadata = Map::new();
    metadata.insert("filename".into(), Value::String(resource.name.clone()));
    metadata.insert("mime".into(), Value::String(resource.mime.clone()));

    let mut text = None;
    let mut blobs = Vec::new();
    if resource.mime.starts_with("image/") {
        blobs.push(Blob {
            id: ids::blob_id(&doc_id, &resource.mime, data),
            mime: resource.mime.clone(),
            bytes: data.to_vec(),
            metadata: Map::new(),
        });
    } else if is_textual(&resource.mime) {
        text = Some(ids::normalize_text(&String::from_utf8_lossy(data)));
    }

    Document {
        id: doc_id,
        source_uri: resource.uri.clone(),
        text,
        blobs,
        metadata,
    }
}

/// Turn a document stream into the ordered unit set and the run manifest.
///
/// Unit order follows document order; within a document, chunk and row order
/// is stable. In `ImagesGroup` mode, documents carrying blobs are batched
/// into groups of `group_size`; a final short group is emitted as-is.
pub fn collect_units(
    documents: &[Document],
    mode: UnitMode,
    opts: &UnitOptions,
) -> Result<(Vec<ExecutionUnit>, Manifest)> {
    let mut units = Vec::new();
    let mut manifest = Manifest::default();

    for doc in documents {
        let entry = manifest.documents.entry(doc.id.clone()).or_default();
        for blob in &doc.blobs {
            entry.blob_ids.push(blob.id.clone());
        }
    }

    match mode {
        UnitMode::TextChunks => {
            for doc in documents {
                let chunks = match &doc.text {
                    Some(text) => chunking::chunk_text(&doc.id, text, &opts.chunking),
                    // Blob-only documents still occupy a unit slot so that
                    // multimodal steps see them.
                    None if !doc.blobs.is_empty() => {
                        vec![empty_chunk(&doc.id)]
                    }
                    None => Vec::new(),
                };
                let entry = manifest.documents.entry(doc.id.clone()).or_default();
                for chunk in chunks {
                    entry.chunk_ids.push(chunk.id.clone());
                    units.push(ExecutionUnit {
                        index: units.len(),
                        doc_id: doc.id.clone(),
                        source_uri: doc.source_uri.clone(),
                        kind: UnitKind::Chunk(chunk),
                    });
                }
            }
        }
        UnitMode::TableRows => {
            for doc in documents {
                let text = doc.text.as_deref().ok_or_else(|| {
                    EngineError::Processing(format!(
                        "unreadable table {}: resource is not textual",
                        doc.source_uri
                    ))
                })?;
                let filename = doc
                    .metadata
                    .get("filename")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let rows = table::parse_rows(&doc.source_uri, filename, text, &opts.table)?;
                manifest.row_counts.insert(doc.id.clone(), rows.len());
                for row in rows {
                    units.push(ExecutionUnit {
                        index: units.len(),
                        doc_id: doc.id.clone(),
                        source_uri: doc.source_uri.clone(),
                        kind: UnitKind::Row(row),
                    });
                }
            }
        }
        UnitMode::ImagesGroup => {
            let group_size = opts.group_size.max(1);
            let mut current: Vec<&Document> = Vec::new();
            let flush = |batch: &mut Vec<&Document>, units: &mut Vec<ExecutionUnit>| {
                if batch.is_empty() {
                    return;
                }
                let blobs: Vec<Blob> = batch
                    .iter()
                    .flat_map(|d| d.blobs.iter().cloned())
                    .collect();
                let source_uris: Vec<String> =
                    batch.iter().map(|d| d.source_uri.clone()).collect();
                let joined_ids = blobs
                    .iter()
                    .map(|b| b.id.as_str())
                    .collect::<Vec<_>>()
                    .join("|");
                let id = format!("grp_{}", ids::hash_bytes(joined_ids.as_bytes(), "group"));
                let first = batch[0];
                units.push(ExecutionUnit {
                    index: units.len(),
                    doc_id: first.id.clone(),
                    source_uri: first.source_uri.clone(),
                    kind: UnitKind::Group(ImageGroup {
                        id,
                        caption: None,
                        blobs,
                        source_uris,
                    }),
                });
                batch.clear();
            };
            for doc in documents.iter().filter(|d| !d.blobs.is_empty()) {
                current.push(doc);
                if current.len() >= group_size {
                    flush(&mut current, &mut units);
                }
            }
            flush(&mut current, &mut units);
        }
    }

    Ok((units, manifest))
}

fn empty_chunk(doc_id: &str) -> Chunk {
    Chunk {
        id: ids::chunk_id(doc_id, 0, ""),
        doc_id: doc_id.to_string(),
        text: String::new(),
        tokens_estimate: 0,
        offset: 0,
        metadata: Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::chunking::Splitter;
    use crate::processing::table::TextColumn;

    fn text_resource(uri: &str, name: &str) -> Resource {
        Resource {
            uri: uri.into(),
            name: name.into(),
            mime: "text/plain".into(),
            size_bytes: None,
            etag_or_hash: None,
            modified_at: None,
        }
    }

    fn image_resource(uri: &str) -> Resource {
        Resource {
            uri: uri.into(),
            name: "img.png".into(),
            mime: "image/png".into(),
            size_bytes: None,
            etag_or_hash: None,
            modified_at: None,
        }
    }

    #[test]
    fn test_load_textual_document() {
        let doc = load_document(&text_resource("file://a.txt", "a.txt"), b"hi\r\nthere");
        assert_eq!(doc.text.as_deref(), Some("hi\nthere"));
        assert!(doc.blobs.is_empty());
        assert_eq!(doc.metadata["filename"], "a.txt");
    }

    #[test]
    fn test_load_image_document() {
        let doc = load_document(&image_resource("file://i.png"), b"\x89PNG...");
        assert!(doc.text.is_none());
        assert_eq!(doc.blobs.len(), 1);
        assert!(doc.blobs[0].id.starts_with("blob_"));
    }

    #[test]
    fn test_collect_chunk_units_and_manifest() {
        let doc = load_document(
            &text_resource("file://a.txt", "a.txt"),
            b"One two. Three four. Five six.",
        );
        let opts = UnitOptions {
            chunking: ChunkOptions {
                splitter: Splitter::BySentence,
                max_tokens: 2,
                overlap: 0,
                token_multiplier: 1.0,
            },
            ..UnitOptions::default()
        };
        let (units, manifest) =
            collect_units(std::slice::from_ref(&doc), UnitMode::TextChunks, &opts).unwrap();
        assert_eq!(units.len(), 3);
        let entry = &manifest.documents[&doc.id];
        assert_eq!(entry.chunk_ids.len(), 3);
        for (i, unit) in units.iter().enumerate() {
            assert_eq!(unit.index, i);
        }
    }

    #[test]
    fn test_collect_row_units() {
        let mut resource = text_resource("file://t.csv", "t.csv");
        resource.mime = "text/csv".into();
        let doc = load_document(&resource, b"id,comment\n1,ok\n2,bad\n");
        let opts = UnitOptions {
            table: TableOptions {
                text_column: Some(TextColumn::Single("comment".into())),
                pass_through: Some(vec!["id".into()]),
                header_row: 1,
            },
            ..UnitOptions::default()
        };
        let (units, manifest) =
            collect_units(std::slice::from_ref(&doc), UnitMode::TableRows, &opts).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(manifest.row_counts[&doc.id], 2);
        match &units[1].kind {
            UnitKind::Row(row) => {
                assert_eq!(row.row_index, 1);
                assert_eq!(row.text, "bad");
            }
            other => panic!("expected row unit, got {other:?}"),
        }
    }

    #[test]
    fn test_table_mode_rejects_binary_document() {
        let doc = load_document(&image_resource("file://i.png"), b"...");
        let err = collect_units(
            std::slice::from_ref(&doc),
            UnitMode::TableRows,
            &UnitOptions::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("file://i.png"));
    }

    #[test]
    fn test_image_groups_batched_in_order() {
        let docs: Vec<Document> = (0..5)
            .map(|i| {
                load_document(
                    &image_resource(&format!("file://img{i}.png")),
                    format!("payload-{i}").as_bytes(),
                )
            })
            .collect();
        let opts = UnitOptions {
            group_size: 2,
            ..UnitOptions::default()
        };
        let (units, _) = collect_units(&docs, UnitMode::ImagesGroup, &opts).unwrap();
        assert_eq!(units.len(), 3);
        match &units[2].kind {
            UnitKind::Group(g) => assert_eq!(g.blobs.len(), 1),
            other => panic!("expected trailing short group, got {other:?}"),
        }
        match &units[0].kind {
            UnitKind::Group(g) => {
                assert_eq!(g.source_uris[0], "file://img0.png");
                assert_eq!(g.source_uris[1], "file://img1.png");
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn test_group_ids_are_deterministic() {
        let docs: Vec<Document> = (0..2)
            .map(|i| {
                load_document(
                    &image_resource(&format!("file://img{i}.png")),
                    format!("payload-{i}").as_bytes(),
                )
            })
            .collect();
        let opts = UnitOptions {
            group_size: 2,
            ..UnitOptions::default()
        };
        let (a, _) = collect_units(&docs, UnitMode::ImagesGroup, &opts).unwrap();
        let (b, _) = collect_units(&docs, UnitMode::ImagesGroup, &opts).unwrap();
        assert_eq!(a[0].unit_id(), b[0].unit_id());
    }
}
