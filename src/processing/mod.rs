//! Unit iteration: documents in, execution units out.
//!
//! A connector yields resources; [`load_document`](units::load_document)
//! normalizes each into a [`Document`](crate::types::Document); and
//! [`collect_units`](units::collect_units) turns the document stream into an
//! ordered unit set (text chunks, table rows, or image groups) plus the run
//! [`Manifest`](crate::types::Manifest).

pub mod chunking;
pub mod table;
pub mod units;

pub use chunking::{chunk_text, estimate_tokens, ChunkOptions, Splitter};
pub use table::{parse_rows, TableOptions, TextColumn};
pub use units::{collect_units, load_document, UnitMode, UnitOptions};
