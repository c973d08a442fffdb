//! Retrieval index module
//!
//! Chunks artifacts on paragraph boundaries and ranks chunks against
//! queries with deterministic tie-breaks.

mod chunker;
mod index;

pub use chunker::{Chunk, MAX_CHUNK_CHARS, chunk_artifact, sha256_hex, snippet_hash, tokenize};
pub use index::{RankedChunk, RetrievalIndex};
