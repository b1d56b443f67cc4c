//! Agent Configuration
//!
//! Tunable thresholds and budgets. Loaded from the environment (after
//! `.env` is read by the binary) with per-dataset overrides for the values
//! that need empirical calibration.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Core agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Minimum role confidence for a binding to be usable at all
    pub confidence_floor: f64,
    /// Minimum contract confidence for a `high` tier
    pub high_confidence: f64,
    /// Upper bound for `n` in top-n plans
    pub max_n: u32,
    /// Total repair attempts per request
    pub max_repair_attempts: u32,
    pub max_execution_repairs: u32,
    pub max_semantic_repairs: u32,
    pub default_row_limit: u32,
    pub max_row_limit: u32,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// Rows per distinct grain key above which fan-out blocks
    pub fan_out_threshold: f64,
    /// Null grain-key ratio above which coverage warns (any nulls below it are info)
    pub null_warn_ratio: f64,
    /// When false, only deterministic templates are used
    pub synthesis_enabled: bool,
    pub max_concurrent_requests: usize,
    pub llm: Option<LlmSettings>,
    /// Per-dataset overrides keyed by dataset id
    pub datasets: HashMap<String, DatasetTuning>,
}

/// Model endpoint settings (Ollama-compatible `/api/generate`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

/// Per-dataset calibration overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetTuning {
    pub confidence_floor: Option<f64>,
    pub fan_out_threshold: Option<f64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.5,
            high_confidence: 0.8,
            max_n: 100,
            max_repair_attempts: 2,
            max_execution_repairs: 2,
            max_semantic_repairs: 1,
            default_row_limit: 100,
            max_row_limit: 2000,
            default_timeout_ms: 15_000,
            max_timeout_ms: 120_000,
            fan_out_threshold: 1.0,
            null_warn_ratio: 0.05,
            synthesis_enabled: true,
            max_concurrent_requests: 8,
            llm: None,
            datasets: HashMap::new(),
        }
    }
}

impl AgentConfig {
    /// Build from `SPYNE_*` / `OLLAMA_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        config.confidence_floor = env_or("SPYNE_CONFIDENCE_FLOOR", config.confidence_floor)?;
        config.high_confidence = env_or("SPYNE_HIGH_CONFIDENCE", config.high_confidence)?;
        config.max_n = env_or("SPYNE_MAX_N", config.max_n)?;
        config.max_repair_attempts = env_or("SPYNE_MAX_REPAIR_ATTEMPTS", config.max_repair_attempts)?;
        config.max_execution_repairs = env_or("SPYNE_MAX_EXECUTION_REPAIRS", config.max_execution_repairs)?;
        config.max_semantic_repairs = env_or("SPYNE_MAX_SEMANTIC_REPAIRS", config.max_semantic_repairs)?;
        config.default_row_limit = env_or("SPYNE_DEFAULT_ROW_LIMIT", config.default_row_limit)?;
        config.max_row_limit = env_or("SPYNE_MAX_ROW_LIMIT", config.max_row_limit)?;
        config.default_timeout_ms = env_or("SPYNE_DEFAULT_TIMEOUT_MS", config.default_timeout_ms)?;
        config.max_timeout_ms = env_or("SPYNE_MAX_TIMEOUT_MS", config.max_timeout_ms)?;
        config.fan_out_threshold = env_or("SPYNE_FAN_OUT_THRESHOLD", config.fan_out_threshold)?;
        config.null_warn_ratio = env_or("SPYNE_NULL_WARN_RATIO", config.null_warn_ratio)?;
        config.synthesis_enabled = env_or("SPYNE_SYNTHESIS_ENABLED", config.synthesis_enabled)?;
        config.max_concurrent_requests =
            env_or("SPYNE_MAX_CONCURRENT_REQUESTS", config.max_concurrent_requests)?;

        if let (Ok(base_url), Ok(model)) = (std::env::var("OLLAMA_BASE_URL"), std::env::var("OLLAMA_MODEL")) {
            config.llm = Some(LlmSettings {
                base_url,
                model,
                timeout_secs: env_or("OLLAMA_TIMEOUT_SEC", 20u64)?,
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject internally inconsistent settings
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("confidence_floor", self.confidence_floor),
            ("high_confidence", self.high_confidence),
            ("null_warn_ratio", self.null_warn_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AgentError::Config(format!("{} must be within [0, 1], got {}", name, value)));
            }
        }
        if self.high_confidence < self.confidence_floor {
            return Err(AgentError::Config(format!(
                "high_confidence ({}) is below confidence_floor ({})",
                self.high_confidence, self.confidence_floor
            )));
        }
        if self.fan_out_threshold < 1.0 {
            return Err(AgentError::Config(format!(
                "fan_out_threshold must be >= 1.0, got {}",
                self.fan_out_threshold
            )));
        }
        if self.default_row_limit == 0 || self.default_row_limit > self.max_row_limit {
            return Err(AgentError::Config(format!(
                "default_row_limit must be within [1, {}]",
                self.max_row_limit
            )));
        }
        if self.default_timeout_ms == 0 || self.default_timeout_ms > self.max_timeout_ms {
            return Err(AgentError::Config(format!(
                "default_timeout_ms must be within [1, {}]",
                self.max_timeout_ms
            )));
        }
        if self.max_n == 0 {
            return Err(AgentError::Config("max_n must be positive".to_string()));
        }
        if self.max_concurrent_requests == 0 {
            return Err(AgentError::Config("max_concurrent_requests must be positive".to_string()));
        }
        Ok(())
    }

    pub fn confidence_floor_for(&self, dataset_id: &str) -> f64 {
        self.datasets
            .get(dataset_id)
            .and_then(|t| t.confidence_floor)
            .unwrap_or(self.confidence_floor)
    }

    pub fn fan_out_threshold_for(&self, dataset_id: &str) -> f64 {
        self.datasets
            .get(dataset_id)
            .and_then(|t| t.fan_out_threshold)
            .unwrap_or(self.fan_out_threshold)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AgentError::Config(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_repair_attempts, 2);
        assert_eq!(config.max_semantic_repairs, 1);
    }

    #[test]
    fn test_rejects_inverted_confidence_thresholds() {
        let config = AgentConfig {
            confidence_floor: 0.9,
            high_confidence: 0.6,
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_dataset_overrides() {
        let mut config = AgentConfig::default();
        config.datasets.insert(
            "retail".to_string(),
            DatasetTuning {
                confidence_floor: Some(0.7),
                fan_out_threshold: None,
            },
        );
        assert_eq!(config.confidence_floor_for("retail"), 0.7);
        assert_eq!(config.confidence_floor_for("other"), 0.5);
        assert_eq!(config.fan_out_threshold_for("retail"), 1.0);
    }
}
