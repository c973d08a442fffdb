//! Skill optimization session domain type
//!
//! Exactly one session exists per run when optimization is enabled. It
//! records where the source skill came from, both phase totals and the
//! movement between them.

use serde::{Deserialize, Serialize};

use crate::run::{RunTotals, TotalsDelta};

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Skipped,
    Error,
}

impl SessionStatus {
    pub fn parse(s: &str) -> Option<SessionStatus> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "skipped" => Some(Self::Skipped),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Where the skill fed to the optimizer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SkillOrigin {
    /// The site shipped its own skill document
    SiteSkill,
    /// No site skill existed; the optimizer starts from scratch
    #[default]
    None,
}

impl SkillOrigin {
    pub fn parse(s: &str) -> Option<SkillOrigin> {
        match s {
            "site_skill" => Some(Self::SiteSkill),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

impl std::fmt::Display for SkillOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SiteSkill => write!(f, "site_skill"),
            Self::None => write!(f, "none"),
        }
    }
}

/// The baseline/optimized comparison record for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillOptimizationSession {
    pub run_id: String,
    pub status: SessionStatus,
    pub source_skill_origin: SkillOrigin,
    pub baseline_totals: Option<RunTotals>,
    pub optimized_totals: Option<RunTotals>,
    pub delta: Option<TotalsDelta>,
    pub error_message: Option<String>,
}

impl SkillOptimizationSession {
    pub fn new(run_id: &str, origin: SkillOrigin) -> Self {
        Self {
            run_id: run_id.to_string(),
            status: SessionStatus::Pending,
            source_skill_origin: origin,
            baseline_totals: None,
            optimized_totals: None,
            delta: None,
            error_message: None,
        }
    }
}
