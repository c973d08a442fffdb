//! Documentation ingestion seam
//!
//! Network fetching lives outside this system; the orchestrator only needs
//! something that turns a base URL into text artifacts. Two implementations
//! ship here: a local-directory walker so the binary can exercise the whole
//! pipeline against a checked-out docs folder, and an in-memory fixture for
//! tests and demos.

use std::path::Path;

use async_trait::async_trait;
use docmodel::{Artifact, ArtifactType};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::retrieval::sha256_hex;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no documentation found at {0}")]
    EmptyCorpus(String),
}

/// What an ingestion produced
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub normalized_docs_url: String,
    pub artifacts: Vec<Artifact>,
    pub llms_text: Option<String>,
    pub llms_full_text: Option<String>,
    pub skill_text: Option<String>,
    pub discovered_pages: Vec<String>,
}

/// Collaborator seam for documentation fetching
#[async_trait]
pub trait Ingestor: Send + Sync {
    async fn ingest(&self, docs_url: &str) -> Result<IngestOutcome, IngestError>;
}

fn classify_file_name(name: &str) -> ArtifactType {
    match name.to_lowercase().as_str() {
        "llms.txt" => ArtifactType::LlmsText,
        "llms-full.txt" => ArtifactType::LlmsFullText,
        "skill.md" => ArtifactType::Skill,
        _ => ArtifactType::Page,
    }
}

fn make_artifact(artifact_type: ArtifactType, source_url: String, content: String) -> Artifact {
    let content_hash = sha256_hex(&content);
    Artifact {
        artifact_type,
        source_url,
        content,
        content_hash,
        metadata: None,
    }
}

fn outcome_from_artifacts(normalized_docs_url: String, artifacts: Vec<Artifact>) -> IngestOutcome {
    let pick = |kind: ArtifactType| {
        artifacts
            .iter()
            .find(|a| a.artifact_type == kind)
            .map(|a| a.content.clone())
    };
    let discovered_pages = artifacts
        .iter()
        .filter(|a| a.artifact_type == ArtifactType::Page)
        .map(|a| a.source_url.clone())
        .collect();
    IngestOutcome {
        llms_text: pick(ArtifactType::LlmsText),
        llms_full_text: pick(ArtifactType::LlmsFullText),
        skill_text: pick(ArtifactType::Skill),
        discovered_pages,
        normalized_docs_url,
        artifacts,
    }
}

/// Walks a local directory of markdown and text files
pub struct DirIngestor;

const INGESTED_EXTENSIONS: [&str; 3] = ["md", "markdown", "txt"];

#[async_trait]
impl Ingestor for DirIngestor {
    async fn ingest(&self, docs_url: &str) -> Result<IngestOutcome, IngestError> {
        let root = Path::new(docs_url);
        debug!(path = %root.display(), "DirIngestor::ingest");
        let mut artifacts = Vec::new();

        let mut entries: Vec<_> = WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .collect();
        entries.sort_by(|a, b| a.path().cmp(b.path()));

        for entry in entries {
            let path = entry.path();
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_lowercase)
                .unwrap_or_default();
            if !INGESTED_EXTENSIONS.contains(&extension.as_str()) {
                continue;
            }
            let content = std::fs::read_to_string(path)?;
            if content.trim().is_empty() {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            let artifact_type = classify_file_name(name);
            artifacts.push(make_artifact(
                artifact_type,
                format!("file://{}", path.display()),
                content,
            ));
        }

        if artifacts.is_empty() {
            return Err(IngestError::EmptyCorpus(docs_url.to_string()));
        }
        info!(count = artifacts.len(), "directory ingested");
        Ok(outcome_from_artifacts(
            format!("file://{}", root.display()),
            artifacts,
        ))
    }
}

/// In-memory corpus for tests and offline demos
#[derive(Default)]
pub struct FixtureIngestor {
    pages: Vec<(String, String)>,
    skill: Option<String>,
}

impl FixtureIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, content: impl Into<String>) -> Self {
        self.pages.push((url.into(), content.into()));
        self
    }

    pub fn with_skill(mut self, content: impl Into<String>) -> Self {
        self.skill = Some(content.into());
        self
    }
}

#[async_trait]
impl Ingestor for FixtureIngestor {
    async fn ingest(&self, docs_url: &str) -> Result<IngestOutcome, IngestError> {
        let mut artifacts: Vec<Artifact> = self
            .pages
            .iter()
            .map(|(url, content)| make_artifact(ArtifactType::Page, url.clone(), content.clone()))
            .collect();
        if let Some(skill) = &self.skill {
            artifacts.push(make_artifact(
                ArtifactType::Skill,
                format!("{}/skill.md", docs_url.trim_end_matches('/')),
                skill.clone(),
            ));
        }
        if artifacts.is_empty() {
            return Err(IngestError::EmptyCorpus(docs_url.to_string()));
        }
        Ok(outcome_from_artifacts(docs_url.to_string(), artifacts))
    }
}
