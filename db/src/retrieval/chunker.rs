//! Artifact chunking
//!
//! Artifacts split on blank-line paragraph boundaries; paragraphs accumulate
//! into a chunk until the next one would push it past the character budget.
//! A paragraph too large to fit any chunk is dropped by the accumulator, and
//! an artifact that produced no chunks at all falls back to one truncated
//! chunk so every non-empty document is retrievable.

use std::collections::HashSet;

use docmodel::Artifact;
use sha2::{Digest, Sha256};

/// Character budget per chunk
pub const MAX_CHUNK_CHARS: usize = 1200;

/// Minimum token length kept by the tokenizer
const MIN_TOKEN_LEN: usize = 3;

/// Full hex SHA-256 of a text
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Chunk identity hash: first 16 hex chars of SHA-256(text)
pub fn snippet_hash(text: &str) -> String {
    sha256_hex(text)[..16].to_string()
}

/// Lowercased alphanumeric tokens of at least three characters
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= MIN_TOKEN_LEN)
        .map(str::to_string)
        .collect()
}

/// One retrievable slice of an artifact
#[derive(Debug, Clone)]
pub struct Chunk {
    pub source_url: String,
    pub snippet_hash: String,
    pub text: String,
    tokens: HashSet<String>,
}

impl Chunk {
    fn new(source_url: &str, text: String) -> Self {
        let tokens: HashSet<String> = tokenize(&text).into_iter().collect();
        Self {
            source_url: source_url.to_string(),
            snippet_hash: snippet_hash(&text),
            text,
            tokens,
        }
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn contains_token(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Split one artifact into chunks
pub fn chunk_artifact(artifact: &Artifact) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut acc = String::new();

    for paragraph in artifact.content.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if acc.is_empty() {
            if paragraph.chars().count() <= MAX_CHUNK_CHARS {
                acc.push_str(paragraph);
            }
            continue;
        }
        let candidate_len = acc.chars().count() + 2 + paragraph.chars().count();
        if candidate_len > MAX_CHUNK_CHARS {
            chunks.push(Chunk::new(&artifact.source_url, std::mem::take(&mut acc)));
            if paragraph.chars().count() <= MAX_CHUNK_CHARS {
                acc.push_str(paragraph);
            }
        } else {
            acc.push_str("\n\n");
            acc.push_str(paragraph);
        }
    }
    if !acc.is_empty() {
        chunks.push(Chunk::new(&artifact.source_url, acc));
    }

    // fallback: a non-empty artifact always yields at least one chunk
    if chunks.is_empty() && !artifact.content.trim().is_empty() {
        let truncated = truncate_chars(artifact.content.trim(), MAX_CHUNK_CHARS);
        chunks.push(Chunk::new(&artifact.source_url, truncated.to_string()));
    }

    chunks
}
