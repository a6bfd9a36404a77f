//! Text chunking with sentence/paragraph splitting and word overlap.
//!
//! Token counts are a fast approximation: whitespace-split word count scaled
//! by a configured multiplier. Chunk ids are deterministic functions of the
//! document id, the chunk's source offset, and its text.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids;
use crate::types::Chunk;

/// How document text is split into units before packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Splitter {
    /// Split on sentence boundaries (punctuation followed by whitespace).
    #[default]
    BySentence,
    /// Split on blank-line paragraph boundaries.
    ByParagraph,
    /// No splitting: one chunk per document.
    None,
}

/// Chunking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkOptions {
    /// Splitting strategy.
    #[serde(default)]
    pub splitter: Splitter,
    /// Approximate token budget per chunk.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Words carried over between adjacent chunks.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    /// Scale applied to the whitespace word count when estimating tokens.
    #[serde(default = "default_token_multiplier")]
    pub token_multiplier: f64,
}

fn default_max_tokens() -> usize {
    800
}
fn default_overlap() -> usize {
    150
}
fn default_token_multiplier() -> f64 {
    1.0
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            splitter: Splitter::default(),
            max_tokens: default_max_tokens(),
            overlap: default_overlap(),
            token_multiplier: default_token_multiplier(),
        }
    }
}

/// Approximate token count: whitespace-split word count times `multiplier`,
/// floored at 1 for non-empty text.
pub fn estimate_tokens(text: &str, multiplier: f64) -> usize {
    let words = text.split_whitespace().count();
    if words == 0 {
        return if text.is_empty() { 0 } else { 1 };
    }
    (((words as f64) * multiplier).ceil() as usize).max(1)
}

/// Split into sentences, returning `(byte_offset, text)` per unit.
fn split_sentences(text: &str) -> Vec<(usize, &str)> {
    let bytes = text.as_bytes();
    let mut units = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        if (b == b'.' || b == b'!' || b == b'?')
            && bytes.get(i + 1).is_some_and(|n| n.is_ascii_whitespace())
        {
            push_trimmed(&mut units, text, start, i + 1);
            // skip the whitespace run
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            start = j;
            i = j;
        } else {
            i += 1;
        }
    }
    push_trimmed(&mut units, text, start, text.len());
    units
}

/// Split into paragraphs on blank lines, returning `(byte_offset, text)`.
fn split_paragraphs(text: &str) -> Vec<(usize, &str)> {
    let mut units = Vec::new();
    let mut start = 0usize;
    let mut search = 0usize;
    while let Some(pos) = text[search..].find("\n\n") {
        let abs = search + pos;
        push_trimmed(&mut units, text, start, abs);
        let mut next = abs;
        let bytes = text.as_bytes();
        while next < bytes.len() && bytes[next] == b'\n' {
            next += 1;
        }
        start = next;
        search = next;
    }
    push_trimmed(&mut units, text, start, text.len());
    units
}

fn push_trimmed<'a>(units: &mut Vec<(usize, &'a str)>, text: &'a str, start: usize, end: usize) {
    let slice = &text[start..end];
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return;
    }
    let lead = slice.len() - slice.trim_start().len();
    units.push((start + lead, trimmed));
}

/// Split document text into chunks obeying the token budget.
///
/// Units accumulate until the budget would be exceeded, then the buffer is
/// flushed; the trailing `overlap` words of a flushed chunk seed the next
/// one. Indices are contiguous from 0 and ordering is stable.
pub fn chunk_text(doc_id: &str, text: &str, opts: &ChunkOptions) -> Vec<Chunk> {
    let units: Vec<(usize, &str)> = match opts.splitter {
        Splitter::BySentence => split_sentences(text),
        Splitter::ByParagraph => split_paragraphs(text),
        Splitter::None => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                Vec::new()
            } else {
                let lead = text.len() - text.trim_start().len();
                vec![(lead, trimmed)]
            }
        }
    };

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut cur_parts: Vec<String> = Vec::new();
    let mut cur_tokens = 0usize;
    let mut chunk_offset: Option<usize> = None;
    let mut index = 0usize;

    let flush = |parts: &mut Vec<String>,
                     tokens: &mut usize,
                     offset: &mut Option<usize>,
                     index: &mut usize,
                     fallback_offset: usize,
                     chunks: &mut Vec<Chunk>| {
        let chunk_body = parts.join(" ").trim().to_string();
        if chunk_body.is_empty() {
            parts.clear();
            *tokens = 0;
            return;
        }
        let off = offset.take().unwrap_or(fallback_offset);
        let id = ids::chunk_id(doc_id, off, &chunk_body);
        let mut metadata = Map::new();
        metadata.insert("index".into(), Value::from(*index as u64));
        metadata.insert(
            "splitter".into(),
            serde_json::to_value(opts.splitter).unwrap_or(Value::Null),
        );
        metadata.insert("length_chars".into(), Value::from(chunk_body.len() as u64));
        chunks.push(Chunk {
            id,
            doc_id: doc_id.to_string(),
            text: chunk_body.clone(),
            tokens_estimate: estimate_tokens(&chunk_body, opts.token_multiplier),
            offset: off,
            metadata,
        });
        *index += 1;
        parts.clear();
        *tokens = 0;
    };

    for (off, unit) in &units {
        let unit_tokens = estimate_tokens(unit, opts.token_multiplier);
        if cur_tokens + unit_tokens > opts.max_tokens && !cur_parts.is_empty() {
            flush(
                &mut cur_parts,
                &mut cur_tokens,
                &mut chunk_offset,
                &mut index,
                *off,
                &mut chunks,
            );
            if opts.overlap > 0 {
                if let Some(last) = chunks.last() {
                    let words: Vec<&str> = last.text.split_whitespace().collect();
                    let carry_from = words.len().saturating_sub(opts.overlap);
                    let carry = words[carry_from..].join(" ");
                    if !carry.is_empty() {
                        cur_tokens = estimate_tokens(&carry, opts.token_multiplier);
                        cur_parts.push(carry);
                    }
                }
            }
        }
        if chunk_offset.is_none() {
            chunk_offset = Some(*off);
        }
        cur_parts.push((*unit).to_string());
        cur_tokens += unit_tokens;
    }

    if !cur_parts.is_empty() {
        flush(
            &mut cur_parts,
            &mut cur_tokens,
            &mut chunk_offset,
            &mut index,
            text.len(),
            &mut chunks,
        );
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(splitter: Splitter, max_tokens: usize, overlap: usize) -> ChunkOptions {
        ChunkOptions {
            splitter,
            max_tokens,
            overlap,
            token_multiplier: 1.0,
        }
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("doc_1", "Hello world.", &opts(Splitter::BySentence, 100, 0));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello world.");
        assert_eq!(chunks[0].offset, 0);
    }

    #[test]
    fn test_sentence_split_offsets() {
        let text = "One two. Three four. Five six.";
        let units = split_sentences(text);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0], (0, "One two."));
        assert_eq!(units[1], (9, "Three four."));
        assert_eq!(units[2], (21, "Five six."));
    }

    #[test]
    fn test_paragraph_split() {
        let text = "First paragraph.\n\nSecond paragraph.\n\n\nThird.";
        let units = split_paragraphs(text);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].1, "First paragraph.");
        assert_eq!(units[2].1, "Third.");
    }

    #[test]
    fn test_budget_splits_into_multiple_chunks() {
        let text = "One two. Three four. Five six. Seven eight.";
        let chunks = chunk_text("doc_1", text, &opts(Splitter::BySentence, 4, 0));
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.metadata["index"], i as u64);
        }
    }

    #[test]
    fn test_overlap_carries_words() {
        let text = "One two. Three four. Five six. Seven eight.";
        let chunks = chunk_text("doc_1", text, &opts(Splitter::BySentence, 4, 2));
        assert!(chunks.len() > 1);
        // The second chunk starts with the last two words of the first.
        let first_words: Vec<&str> = chunks[0].text.split_whitespace().collect();
        let carry = first_words[first_words.len() - 2..].join(" ");
        assert!(chunks[1].text.starts_with(&carry));
    }

    #[test]
    fn test_none_splitter_single_chunk() {
        let text = "Everything. In one. Chunk!";
        let chunks = chunk_text("doc_1", text, &opts(Splitter::None, 1, 0));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(chunk_text("doc_1", "", &ChunkOptions::default()).is_empty());
        assert!(chunk_text("doc_1", "   \n ", &ChunkOptions::default()).is_empty());
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let text = "Alpha beta. Gamma delta. Epsilon zeta. Eta theta.";
        let a = chunk_text("doc_1", text, &opts(Splitter::BySentence, 4, 1));
        let b = chunk_text("doc_1", text, &opts(Splitter::BySentence, 4, 1));
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.text, y.text);
            assert_eq!(x.offset, y.offset);
        }
    }

    #[test]
    fn test_estimate_tokens_multiplier() {
        assert_eq!(estimate_tokens("one two three", 1.0), 3);
        assert_eq!(estimate_tokens("one two three", 1.5), 5);
        assert_eq!(estimate_tokens("", 1.0), 0);
        assert_eq!(estimate_tokens("   ", 1.0), 1);
    }

    #[test]
    fn test_chunk_ids_embed_doc_id() {
        let chunks = chunk_text("doc_ab", "Hello there.", &ChunkOptions::default());
        assert!(chunks[0].id.starts_with("doc_ab_ch_"));
    }
}
