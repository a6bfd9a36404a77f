//! Deterministic content-addressed identifiers.
//!
//! Every document, chunk, and blob id is a pure function of normalized
//! content plus a namespace string, so rebuilding the same inputs yields
//! identical ids across runs and platforms. The hash algorithm is configured
//! once at startup and read-only afterwards.

use std::sync::OnceLock;

use blake2::{Blake2b512, Digest};
use chrono::Utc;
use unicode_normalization::UnicodeNormalization;

use crate::error::{EngineError, Result};

/// Supported content-hash algorithms.
///
/// `Blake2b` is the default (truncated to 64 bits). `Xxh64` is the fast
/// non-cryptographic alternative for large corpora.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgo {
    /// BLAKE2b, truncated to the first 64 bits of the digest.
    #[default]
    Blake2b,
    /// xxHash64.
    Xxh64,
}

impl HashAlgo {
    /// Parse an algorithm name from configuration.
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "blake2b" => Ok(HashAlgo::Blake2b),
            "xxh64" => Ok(HashAlgo::Xxh64),
            other => Err(EngineError::Config(format!(
                "unrecognised hash algorithm: {other:?}"
            ))),
        }
    }
}

static HASH_ALGO: OnceLock<HashAlgo> = OnceLock::new();

/// Configure the process-wide hash algorithm. First caller wins; later calls
/// with a different algorithm are a configuration error.
pub fn configure_hasher(algo: HashAlgo) -> Result<()> {
    let current = *HASH_ALGO.get_or_init(|| algo);
    if current != algo {
        return Err(EngineError::Config(format!(
            "hash algorithm already configured as {current:?}, cannot switch to {algo:?}"
        )));
    }
    Ok(())
}

fn current_algo() -> HashAlgo {
    *HASH_ALGO.get_or_init(HashAlgo::default)
}

/// Canonicalise text for hashing and persistence.
///
/// Strips a UTF-8 BOM, applies Unicode NFC, and converts CRLF/CR line
/// endings to LF. Content-bearing whitespace is preserved; no per-line
/// trimming is performed.
pub fn normalize_text(text: &str) -> String {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let normalised: String = text.nfc().collect();
    normalised.replace("\r\n", "\n").replace('\r', "\n")
}

/// Hash `namespace || data` with the configured algorithm, returning lowercase hex.
pub fn hash_bytes(data: &[u8], namespace: &str) -> String {
    match current_algo() {
        HashAlgo::Blake2b => {
            let mut hasher = Blake2b512::new();
            hasher.update(namespace.as_bytes());
            hasher.update(data);
            let digest = hasher.finalize();
            digest[..8].iter().map(|b| format!("{b:02x}")).collect()
        }
        HashAlgo::Xxh64 => {
            let mut buf = Vec::with_capacity(namespace.len() + data.len());
            buf.extend_from_slice(namespace.as_bytes());
            buf.extend_from_slice(data);
            format!("{:016x}", xxhash_rust::xxh64::xxh64(&buf, 0))
        }
    }
}

/// Identifier for a normalized document: `doc_<hex>`.
///
/// The namespace folds in the source URI and, when known, the modified
/// timestamp, mime type, and payload length.
pub fn document_id(
    source_uri: &str,
    payload: &[u8],
    modified_at: Option<&str>,
    mime: Option<&str>,
) -> String {
    let mut namespace = source_uri.to_string();
    if let Some(ts) = modified_at {
        namespace.push('|');
        namespace.push_str(ts);
    }
    if let Some(m) = mime {
        namespace.push_str(&format!("|mime={m}"));
    }
    namespace.push_str(&format!("|len={}", payload.len()));
    format!("doc_{}", hash_bytes(payload, &namespace))
}

/// Identifier for a chunk: `<doc_id>_ch_<hex12>`.
///
/// Folds in the document id, the chunk's byte offset within the document,
/// and the chunk payload length.
pub fn chunk_id(doc_id: &str, offset: usize, payload: &str) -> String {
    let namespace = format!("{doc_id}|{offset}|len={}", payload.len());
    let digest = hash_bytes(payload.as_bytes(), &namespace);
    format!("{doc_id}_ch_{}", &digest[..digest.len().min(12)])
}

/// Identifier for a blob: `blob_<hex12>`. Folds in the owning document id,
/// the mime type, and the payload length.
pub fn blob_id(doc_id: &str, mime: &str, payload: &[u8]) -> String {
    let namespace = format!("{doc_id}|{mime}|len={}", payload.len());
    let digest = hash_bytes(payload, &namespace);
    format!("blob_{}", &digest[..digest.len().min(12)])
}

/// Generate a run identifier: `YYYYMMDDTHHMMSSZ-<hex4>`, UTC.
///
/// The random suffix disambiguates runs started within the same second.
pub fn new_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    format!("{stamp}-{:04x}", fastrand::u16(..))
}

/// Current UTC timestamp in RFC 3339 with a `Z` suffix.
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
