//! Retrieval index
//!
//! Lexical overlap scoring: `|queryTokens ∩ chunkTokens| / sqrt(|chunkTokens|)`,
//! with a lexicographic (sourceUrl, snippetHash) tie-break so top-K order is
//! deterministic. The index is phase-scoped; the optimized phase rebuilds it
//! over a re-derived artifact set.

use std::collections::HashSet;

use docmodel::Artifact;
use tracing::debug;

use super::chunker::{Chunk, chunk_artifact, tokenize};

/// One query hit
#[derive(Debug, Clone, PartialEq)]
pub struct RankedChunk {
    pub source_url: String,
    pub snippet_hash: String,
    pub text: String,
    pub score: f64,
}

/// In-memory index over the chunked artifact set
pub struct RetrievalIndex {
    chunks: Vec<Chunk>,
    identities: HashSet<(String, String)>,
}

impl RetrievalIndex {
    pub fn build(artifacts: &[Artifact]) -> Self {
        let mut chunks = Vec::new();
        for artifact in artifacts {
            chunks.extend(chunk_artifact(artifact));
        }
        let identities = chunks
            .iter()
            .map(|c| (c.source_url.clone(), c.snippet_hash.clone()))
            .collect();
        debug!(artifacts = artifacts.len(), chunks = chunks.len(), "RetrievalIndex::build");
        Self { chunks, identities }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Whether a citation's (source, snippetHash) names an indexed chunk.
    /// Comparison is exact and case sensitive.
    pub fn contains(&self, source_url: &str, snippet_hash: &str) -> bool {
        self.identities
            .contains(&(source_url.to_string(), snippet_hash.to_string()))
    }

    /// Score every chunk against the query and return the top K
    pub fn query(&self, query: &str, k: usize) -> Vec<RankedChunk> {
        let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<RankedChunk> = self
            .chunks
            .iter()
            .filter_map(|chunk| {
                let token_count = chunk.token_count();
                if token_count == 0 {
                    return None;
                }
                let overlap = query_tokens
                    .iter()
                    .filter(|t| chunk.contains_token(t))
                    .count();
                if overlap == 0 {
                    return None;
                }
                Some(RankedChunk {
                    source_url: chunk.source_url.clone(),
                    snippet_hash: chunk.snippet_hash.clone(),
                    text: chunk.text.clone(),
                    score: overlap as f64 / (token_count as f64).sqrt(),
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source_url.cmp(&b.source_url))
                .then_with(|| a.snippet_hash.cmp(&b.snippet_hash))
        });
        scored.truncate(k);
        scored
    }
}
