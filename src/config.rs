use serde::{Deserialize, Serialize};

use crate::environment::{get_env_or, get_env_parsed};
use crate::error::PipelineError;

/// Dedup mode selects the same-batch similarity threshold. Strict favors
/// cluster purity, lenient favors recall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DedupMode {
    Strict,
    Standard,
    Lenient,
}

impl DedupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupMode::Strict => "strict",
            DedupMode::Standard => "standard",
            DedupMode::Lenient => "lenient",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "strict" => Some(DedupMode::Strict),
            "standard" => Some(DedupMode::Standard),
            "lenient" => Some(DedupMode::Lenient),
            _ => None,
        }
    }

    /// Default same-batch similarity threshold for this mode.
    pub fn similarity_threshold(&self) -> f64 {
        match self {
            DedupMode::Strict => 0.85,
            DedupMode::Standard => 0.80,
            DedupMode::Lenient => 0.75,
        }
    }
}

/// All knobs for a pipeline run, gathered from the environment and validated
/// before any state is mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub mode: DedupMode,
    /// Same-batch clustering threshold τ. Defaults from `mode`.
    pub similarity_threshold: f64,
    /// Minimum triage confidence for selection.
    pub confidence_threshold: f64,
    /// Upper bound on the working set handed to expensive downstream work.
    pub max_selected: usize,
    /// Items below the confidence threshold by at most this margin are
    /// reported as near-misses. Reporting only, never promoted.
    pub near_miss_margin: f64,
    /// How many of the most recent same-day signatures each candidate is
    /// compared against. Bounds comparison-service cost; a full-history scan
    /// is explicitly avoided.
    pub signature_window: usize,
    /// Bounded parallelism for comparison-service calls within one step.
    pub comparison_concurrency: usize,
    pub llm_timeout_secs: u64,
    pub llm_max_retries: u32,
    pub signature_retention_days: i64,
    pub run_retention_days: i64,
    pub database_path: String,
    pub ollama_host: String,
    pub ollama_port: u16,
    pub ollama_model: String,
    pub embedding_model: Option<String>,
    pub temperature: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mode = DedupMode::Standard;
        PipelineConfig {
            mode,
            similarity_threshold: mode.similarity_threshold(),
            confidence_threshold: 0.70,
            max_selected: 20,
            near_miss_margin: 0.05,
            signature_window: 10,
            comparison_concurrency: 4,
            llm_timeout_secs: 120,
            llm_max_retries: 3,
            signature_retention_days: 7,
            run_retention_days: 30,
            database_path: "vigil.db".to_string(),
            ollama_host: "localhost".to_string(),
            ollama_port: 11434,
            ollama_model: "llama3.1".to_string(),
            embedding_model: None,
            temperature: 0.0,
        }
    }
}

impl PipelineConfig {
    /// Builds a configuration from the environment and validates it.
    pub fn from_env() -> Result<Self, PipelineError> {
        let defaults = PipelineConfig::default();

        let mode_raw = get_env_or("DEDUP_MODE", defaults.mode.as_str());
        let mode = DedupMode::parse(&mode_raw).ok_or_else(|| {
            PipelineError::Configuration(format!(
                "DEDUP_MODE must be strict, standard or lenient, got '{}'",
                mode_raw
            ))
        })?;

        let config = PipelineConfig {
            mode,
            similarity_threshold: get_env_parsed(
                "SIMILARITY_THRESHOLD",
                mode.similarity_threshold(),
            ),
            confidence_threshold: get_env_parsed(
                "CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold,
            ),
            max_selected: get_env_parsed("MAX_SELECTED", defaults.max_selected),
            near_miss_margin: get_env_parsed("NEAR_MISS_MARGIN", defaults.near_miss_margin),
            signature_window: get_env_parsed("SIGNATURE_WINDOW", defaults.signature_window),
            comparison_concurrency: get_env_parsed(
                "COMPARISON_CONCURRENCY",
                defaults.comparison_concurrency,
            ),
            llm_timeout_secs: get_env_parsed("LLM_TIMEOUT_SECS", defaults.llm_timeout_secs),
            llm_max_retries: get_env_parsed("LLM_MAX_RETRIES", defaults.llm_max_retries),
            signature_retention_days: get_env_parsed(
                "SIGNATURE_RETENTION_DAYS",
                defaults.signature_retention_days,
            ),
            run_retention_days: get_env_parsed("RUN_RETENTION_DAYS", defaults.run_retention_days),
            database_path: get_env_or("DATABASE_PATH", &defaults.database_path),
            ollama_host: get_env_or("OLLAMA_HOST", &defaults.ollama_host),
            ollama_port: get_env_parsed("OLLAMA_PORT", defaults.ollama_port),
            ollama_model: get_env_or("OLLAMA_MODEL", &defaults.ollama_model),
            embedding_model: std::env::var("EMBEDDING_MODEL").ok(),
            temperature: get_env_parsed("LLM_TEMPERATURE", defaults.temperature),
        };

        config.validate()?;
        Ok(config)
    }

    /// Fails fast on invalid knobs, before the run mutates any state.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(PipelineError::Configuration(format!(
                "similarity threshold {} outside [0, 1]",
                self.similarity_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(PipelineError::Configuration(format!(
                "confidence threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.near_miss_margin) {
            return Err(PipelineError::Configuration(format!(
                "near-miss margin {} outside [0, 1]",
                self.near_miss_margin
            )));
        }
        if self.max_selected == 0 {
            return Err(PipelineError::Configuration(
                "max selected must be at least 1".to_string(),
            ));
        }
        if self.signature_window == 0 {
            return Err(PipelineError::Configuration(
                "signature window must be at least 1".to_string(),
            ));
        }
        if self.comparison_concurrency == 0 {
            return Err(PipelineError::Configuration(
                "comparison concurrency must be at least 1".to_string(),
            ));
        }
        if self.signature_retention_days < 1 || self.run_retention_days < 1 {
            return Err(PipelineError::Configuration(
                "retention windows must be at least 1 day".to_string(),
            ));
        }
        Ok(())
    }
}
