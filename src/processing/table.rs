//! Table-row iteration over CSV sources.
//!
//! Rows preserve source column order. Header collisions are deduplicated
//! deterministically by suffixing `__N`; empty header cells become `col`.
//! A malformed data line attaches `{parse_error, raw}` to its row and
//! iteration continues; an unreadable table fails with a processing error
//! naming the resource URI.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{EngineError, Result};
use crate::types::Row;

/// The column (or ordered columns) whose values become `row.text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextColumn {
    /// A single column.
    Single(String),
    /// Multiple columns, space-joined in the given order.
    Joined(Vec<String>),
}

/// Table parsing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TableOptions {
    /// Column(s) whose string-join yields `row.text`.
    #[serde(default)]
    pub text_column: Option<TextColumn>,
    /// Columns echoed into `row.values`, in the given order. `None` echoes
    /// every column in source order.
    #[serde(default)]
    pub pass_through: Option<Vec<String>>,
    /// 1-based header row. Only 1 is supported.
    #[serde(default = "default_header_row")]
    pub header_row: usize,
}

fn default_header_row() -> usize {
    1
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            text_column: None,
            pass_through: None,
            header_row: default_header_row(),
        }
    }
}

/// Deduplicate header names: empty cells become `col`, repeats get `__N`.
fn clean_headers(raw: &csv::StringRecord) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut headers = Vec::with_capacity(raw.len());
    for cell in raw.iter() {
        let base = {
            let trimmed = cell.trim();
            if trimmed.is_empty() {
                "col".to_string()
            } else {
                trimmed.to_string()
            }
        };
        let n = seen.entry(base.clone()).or_insert(0);
        if *n == 0 {
            headers.push(base.clone());
        } else {
            headers.push(format!("{base}__{n}"));
        }
        *seen.get_mut(&base).expect("entry just inserted") += 1;
    }
    headers
}

fn row_text(record: &Map<String, Value>, text_column: &Option<TextColumn>) -> String {
    let cell = |name: &str| {
        record
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };
    match text_column {
        Some(TextColumn::Single(name)) => cell(name),
        Some(TextColumn::Joined(names)) => names
            .iter()
            .map(|n| cell(n))
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        None => String::new(),
    }
}

fn select_columns(
    full: &Map<String, Value>,
    pass_through: &Option<Vec<String>>,
) -> Map<String, Value> {
    match pass_through {
        None => full.clone(),
        Some(names) => {
            let mut out = Map::new();
            for name in names {
                if let Some(value) = full.get(name) {
                    out.insert(name.clone(), value.clone());
                }
            }
            out
        }
    }
}

/// Parse CSV text into rows.
///
/// `source_uri` and `filename` are carried onto every row for provenance.
/// Row indices are 0-based after the header and stable.
pub fn parse_rows(
    source_uri: &str,
    filename: &str,
    text: &str,
    opts: &TableOptions,
) -> Result<Vec<Row>> {
    if opts.header_row != 1 {
        return Err(EngineError::Processing(format!(
            "only header_row=1 is supported (got {} for {source_uri})",
            opts.header_row
        )));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records = reader.records();
    let headers = match records.next() {
        None => return Ok(Vec::new()),
        Some(Ok(first)) => clean_headers(&first),
        Some(Err(e)) => {
            return Err(EngineError::Processing(format!(
                "unreadable table {source_uri}: {e}"
            )))
        }
    };

    let mut rows = Vec::new();
    for (row_index, record) in records.enumerate() {
        match record {
            Ok(fields) => {
                let mut full = Map::new();
                for (i, header) in headers.iter().enumerate() {
                    let value = fields.get(i).unwrap_or("").to_string();
                    full.insert(header.clone(), Value::String(value));
                }
                let text = row_text(&full, &opts.text_column);
                rows.push(Row {
                    row_index,
                    values: select_columns(&full, &opts.pass_through),
                    source_uri: source_uri.to_string(),
                    filename: filename.to_string(),
                    text,
                });
            }
            Err(e) => {
                // Keep the slot: downstream sees the failure on the row itself.
                let mut values = Map::new();
                values.insert("parse_error".into(), Value::String(e.to_string()));
                values.insert(
                    "raw".into(),
                    Value::String(
                        e.position()
                            .map(|p| format!("line {}", p.line()))
                            .unwrap_or_default(),
                    ),
                );
                rows.push(Row {
                    row_index,
                    values,
                    source_uri: source_uri.to_string(),
                    filename: filename.to_string(),
                    text: String::new(),
                });
            }
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(text_column: Option<TextColumn>, pass_through: Option<Vec<String>>) -> TableOptions {
        TableOptions {
            text_column,
            pass_through,
            header_row: 1,
        }
    }

    #[test]
    fn test_basic_rows_in_order() {
        let csv = "id,comment\n1,ok\n2,bad\n3,ok\n";
        let rows = parse_rows(
            "file://t.csv",
            "t.csv",
            csv,
            &opts(Some(TextColumn::Single("comment".into())), None),
        )
        .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].row_index, 0);
        assert_eq!(rows[0].text, "ok");
        assert_eq!(rows[1].text, "bad");
        assert_eq!(rows[2].values["id"], "3");
    }

    #[test]
    fn test_pass_through_selects_and_orders() {
        let csv = "id,comment,extra\n1,hello,x\n";
        let rows = parse_rows(
            "u",
            "f.csv",
            csv,
            &opts(
                Some(TextColumn::Single("comment".into())),
                Some(vec!["id".into()]),
            ),
        )
        .unwrap();
        let keys: Vec<&String> = rows[0].values.keys().collect();
        assert_eq!(keys, ["id"]);
        assert_eq!(rows[0].values["id"], "1");
    }

    #[test]
    fn test_joined_text_columns() {
        let csv = "a,b\nfoo,bar\n";
        let rows = parse_rows(
            "u",
            "f.csv",
            csv,
            &opts(
                Some(TextColumn::Joined(vec!["a".into(), "b".into()])),
                None,
            ),
        )
        .unwrap();
        assert_eq!(rows[0].text, "foo bar");
    }

    #[test]
    fn test_header_dedup_suffixes() {
        let record = csv::StringRecord::from(vec!["name", "name", "", "name"]);
        let headers = clean_headers(&record);
        assert_eq!(headers, ["name", "name__1", "col", "name__2"]);
    }

    #[test]
    fn test_empty_text_cell_yields_empty_text() {
        let csv = "id,comment\n1,\n";
        let rows = parse_rows(
            "u",
            "f.csv",
            csv,
            &opts(Some(TextColumn::Single("comment".into())), None),
        )
        .unwrap();
        assert_eq!(rows[0].text, "");
    }

    #[test]
    fn test_short_row_padded() {
        let csv = "a,b,c\n1,2\n";
        let rows = parse_rows("u", "f.csv", csv, &opts(None, None)).unwrap();
        assert_eq!(rows[0].values["c"], "");
    }

    #[test]
    fn test_empty_input_yields_no_rows() {
        let rows = parse_rows("u", "f.csv", "", &TableOptions::default()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_unsupported_header_row_fails() {
        let err = parse_rows(
            "file://x.csv",
            "x.csv",
            "a\n1\n",
            &TableOptions {
                header_row: 2,
                ..TableOptions::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("file://x.csv"));
    }

    #[test]
    fn test_missing_text_column_is_empty() {
        let csv = "a\nvalue\n";
        let rows = parse_rows(
            "u",
            "f.csv",
            csv,
            &opts(Some(TextColumn::Single("nope".into())), None),
        )
        .unwrap();
        assert_eq!(rows[0].text, "");
    }
}
