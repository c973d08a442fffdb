//! Ingestion artifact domain type

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of fetched document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    /// A regular documentation page
    Page,
    /// The llms.txt summary file
    LlmsText,
    /// The llms-full.txt expanded file
    LlmsFullText,
    /// A site-provided agent skill document
    Skill,
    /// The regenerated skill produced by the optimization phase
    OptimizedSkill,
}

impl ArtifactType {
    pub fn parse(s: &str) -> Option<ArtifactType> {
        match s {
            "page" => Some(Self::Page),
            "llms_text" => Some(Self::LlmsText),
            "llms_full_text" => Some(Self::LlmsFullText),
            "skill" => Some(Self::Skill),
            "optimized_skill" => Some(Self::OptimizedSkill),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Page => "page",
            Self::LlmsText => "llms_text",
            Self::LlmsFullText => "llms_full_text",
            Self::Skill => "skill",
            Self::OptimizedSkill => "optimized_skill",
        };
        write!(f, "{}", s)
    }
}

/// One fetched document, keyed by (artifactType, sourceUrl)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub artifact_type: ArtifactType,
    pub source_url: String,
    pub content: String,
    /// Hex SHA-256 of the content
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Artifact {
    pub fn is_skill(&self) -> bool {
        matches!(self.artifact_type, ArtifactType::Skill)
    }
}
