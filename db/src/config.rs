//! DocBench configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};

use docmodel::{RunConfig, WorkerAssignment};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main DocBench configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model provider configuration
    pub provider: ProviderConfig,

    /// Defaults applied to run requests
    pub runs: RunDefaults,

    /// Storage configuration
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path)
                .context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".docbench.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("docbench").join("docbench.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Defaults for new runs, as an immutable run config skeleton
    pub fn run_defaults(&self) -> RunConfig {
        RunConfig {
            max_tasks: self.runs.max_tasks,
            max_steps_per_task: self.runs.max_steps_per_task,
            max_tokens_per_task: self.runs.max_tokens_per_task,
            hard_cost_cap_usd: self.runs.hard_cost_cap_usd,
            execution_concurrency: self.runs.execution_concurrency,
            judge_concurrency: self.runs.judge_concurrency,
            tie_break_enabled: self.runs.tie_break_enabled,
            enable_skill_optimization: self.runs.enable_skill_optimization,
            run_model: self.runs.run_model.clone(),
            judge_model: self.runs.judge_model.clone(),
            timeout_ms: self.provider.timeout_ms,
            retries: self.provider.retries,
            workers: vec![WorkerAssignment {
                provider: self.provider.name.clone(),
                model: self.runs.run_model.clone(),
                quantity: self.runs.worker_count,
                ..Default::default()
            }],
            tasks: Vec::new(),
        }
    }
}

/// Model provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider name (currently only "openai"-compatible endpoints)
    pub name: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Transient-error retries per call
    pub retries: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "openai".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: "https://api.openai.com".to_string(),
            timeout_ms: 120_000,
            retries: 2,
        }
    }
}

/// Per-run defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunDefaults {
    #[serde(rename = "max-tasks")]
    pub max_tasks: usize,
    #[serde(rename = "max-steps-per-task")]
    pub max_steps_per_task: u32,
    #[serde(rename = "max-tokens-per-task")]
    pub max_tokens_per_task: u64,
    #[serde(rename = "hard-cost-cap-usd")]
    pub hard_cost_cap_usd: f64,
    #[serde(rename = "execution-concurrency")]
    pub execution_concurrency: usize,
    #[serde(rename = "judge-concurrency")]
    pub judge_concurrency: usize,
    #[serde(rename = "tie-break-enabled")]
    pub tie_break_enabled: bool,
    #[serde(rename = "enable-skill-optimization")]
    pub enable_skill_optimization: bool,
    #[serde(rename = "run-model")]
    pub run_model: String,
    #[serde(rename = "judge-model")]
    pub judge_model: String,
    #[serde(rename = "worker-count")]
    pub worker_count: usize,
}

impl Default for RunDefaults {
    fn default() -> Self {
        let config = RunConfig::default();
        Self {
            max_tasks: config.max_tasks,
            max_steps_per_task: config.max_steps_per_task,
            max_tokens_per_task: config.max_tokens_per_task,
            hard_cost_cap_usd: config.hard_cost_cap_usd,
            execution_concurrency: config.execution_concurrency,
            judge_concurrency: config.judge_concurrency,
            tie_break_enabled: config.tie_break_enabled,
            enable_skill_optimization: config.enable_skill_optimization,
            run_model: config.run_model,
            judge_model: config.judge_model,
            worker_count: 1,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path
    #[serde(rename = "db-path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path: base.join("docbench").join("docbench.db"),
        }
    }
}
