//! Engine configuration
//!
//! [`RunnerConfig`] is the process-wide configuration surface. Defaults
//! match the documented values; `from_env` overrides them from environment
//! variables (a `.env` file is honored for local development) and
//! `validate` fails fast on out-of-range values.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ResearchError;

/// Process-wide engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Hard cap on parallel research tasks.
    pub max_parallelism_cap: usize,

    /// Hard cap on sequential research iterations.
    pub max_iterations_cap: usize,

    /// Concurrent page fetches inside the Read step.
    pub fetch_concurrency: usize,

    /// Per-fetch timeout.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Per-search timeout.
    #[serde(with = "humantime_serde")]
    pub search_timeout: Duration,

    /// Per-model-call timeout.
    #[serde(with = "humantime_serde")]
    pub model_timeout: Duration,

    /// Page bodies are truncated to this many bytes.
    pub body_truncate_bytes: usize,

    /// Target compressed-text size relative to raw finding text.
    pub compression_target_ratio: f32,

    /// Token-Jaccard threshold for clustering near-identical claims.
    pub jaccard_dedup_threshold: f32,

    /// Overall run deadline.
    #[serde(with = "humantime_serde")]
    pub overall_deadline: Duration,

    /// Accepted and carried; no tool surface exists.
    pub enable_plugin_tools: bool,

    /// Results requested per search.
    pub max_search_results: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallelism_cap: 4,
            max_iterations_cap: 3,
            fetch_concurrency: 3,
            fetch_timeout: Duration::from_millis(10_000),
            search_timeout: Duration::from_millis(15_000),
            model_timeout: Duration::from_millis(60_000),
            body_truncate_bytes: 51_200,
            compression_target_ratio: 0.5,
            jaccard_dedup_threshold: 0.75,
            overall_deadline: Duration::from_millis(180_000),
            enable_plugin_tools: false,
            max_search_results: 5,
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables, starting from the
    /// defaults. Unset variables keep their default.
    pub fn from_env() -> Result<Self, ResearchError> {
        let _ = dotenvy::dotenv();

        let mut config = Self::default();

        if let Some(v) = parse_env::<usize>("RESEARCH_MAX_PARALLELISM")? {
            config.max_parallelism_cap = v;
        }
        if let Some(v) = parse_env::<usize>("RESEARCH_MAX_ITERATIONS")? {
            config.max_iterations_cap = v;
        }
        if let Some(v) = parse_env::<usize>("RESEARCH_FETCH_CONCURRENCY")? {
            config.fetch_concurrency = v;
        }
        if let Some(v) = parse_env::<u64>("RESEARCH_FETCH_TIMEOUT_MS")? {
            config.fetch_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<u64>("RESEARCH_SEARCH_TIMEOUT_MS")? {
            config.search_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<u64>("RESEARCH_MODEL_TIMEOUT_MS")? {
            config.model_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<usize>("RESEARCH_BODY_TRUNCATE_BYTES")? {
            config.body_truncate_bytes = v;
        }
        if let Some(v) = parse_env::<u64>("RESEARCH_DEADLINE_MS")? {
            config.overall_deadline = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<bool>("RESEARCH_ENABLE_PLUGIN_TOOLS")? {
            config.enable_plugin_tools = v;
        }
        if let Some(v) = parse_env::<usize>("RESEARCH_MAX_SEARCH_RESULTS")? {
            config.max_search_results = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check all values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ResearchError> {
        if self.max_parallelism_cap == 0 || self.max_parallelism_cap > 4 {
            return Err(ResearchError::Input(format!(
                "max_parallelism_cap must be in 1..=4, got {}",
                self.max_parallelism_cap
            )));
        }
        if self.max_iterations_cap == 0 || self.max_iterations_cap > 3 {
            return Err(ResearchError::Input(format!(
                "max_iterations_cap must be in 1..=3, got {}",
                self.max_iterations_cap
            )));
        }
        if self.fetch_concurrency == 0 {
            return Err(ResearchError::Input(
                "fetch_concurrency must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jaccard_dedup_threshold) {
            return Err(ResearchError::Input(format!(
                "jaccard_dedup_threshold must be in [0, 1], got {}",
                self.jaccard_dedup_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.compression_target_ratio) {
            return Err(ResearchError::Input(format!(
                "compression_target_ratio must be in [0, 1], got {}",
                self.compression_target_ratio
            )));
        }
        if self.max_search_results == 0 {
            return Err(ResearchError::Input(
                "max_search_results must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn with_overall_deadline(mut self, deadline: Duration) -> Self {
        self.overall_deadline = deadline;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_fetch_concurrency(mut self, n: usize) -> Self {
        self.fetch_concurrency = n.max(1);
        self
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ResearchError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ResearchError::Input(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}
