//! Pipeline configuration.
//!
//! Read from environment variables:
//! - `ENTRYFLOW_DB_PATH`: SQLite database file path (default: "entryflow.db")
//! - `ENTRYFLOW_LLM_PROVIDER`: `openai`, `openrouter` or `openai_compatible`
//!   (default: "openai_compatible")
//! - `ENTRYFLOW_LLM_BASE_URL`: chat-completions base URL (provider default)
//! - `ENTRYFLOW_LLM_API_KEY`: bearer token
//! - `ENTRYFLOW_DEFAULT_CONCURRENCY`: relabel concurrency when a node sets none (8)
//! - `ENTRYFLOW_MAX_CONCURRENCY`: upper clamp for any node (64)
//! - `ENTRYFLOW_RATE_LIMIT_CAPACITY`: token bucket burst per provider (60)
//! - `ENTRYFLOW_RATE_LIMIT_FILL_RATE`: tokens per second per provider (1.0)
//! - `ENTRYFLOW_STALE_PROCESSING_SECS`: age after which a PROCESSING claim is
//!   considered abandoned (600)

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Provider settings for the completion client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: String,
    pub base_url: Option<String>,
    /// Never serialized back out.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            provider: "openai_compatible".to_string(),
            base_url: None,
            api_key: None,
        }
    }
}

impl LlmConfig {
    /// Chat-completions base URL for the configured provider.
    pub fn resolved_base_url(&self) -> Result<String, EngineError> {
        match self.provider.as_str() {
            "openai" => Ok(self
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())),
            "openrouter" => Ok(self
                .base_url
                .clone()
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string())),
            "openai_compatible" => self.base_url.clone().ok_or_else(|| {
                EngineError::Config(
                    "openai_compatible provider requires ENTRYFLOW_LLM_BASE_URL".to_string(),
                )
            }),
            other => Err(EngineError::Config(format!(
                "unsupported provider '{}': use openai, openrouter or openai_compatible",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub db_path: String,
    pub llm: LlmConfig,
    pub default_concurrency: usize,
    pub max_concurrency: usize,
    pub rate_limit_capacity: f64,
    pub rate_limit_fill_rate: f64,
    pub stale_processing_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            db_path: "entryflow.db".to_string(),
            llm: LlmConfig::default(),
            default_concurrency: 8,
            max_concurrency: 64,
            rate_limit_capacity: 60.0,
            rate_limit_fill_rate: 1.0,
            stale_processing_secs: 600,
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = PipelineConfig::default();
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let config = PipelineConfig {
            db_path: text("ENTRYFLOW_DB_PATH").unwrap_or(defaults.db_path),
            llm: LlmConfig {
                provider: text("ENTRYFLOW_LLM_PROVIDER").unwrap_or(defaults.llm.provider),
                base_url: text("ENTRYFLOW_LLM_BASE_URL"),
                api_key: text("ENTRYFLOW_LLM_API_KEY"),
            },
            default_concurrency: parse_or(
                text("ENTRYFLOW_DEFAULT_CONCURRENCY"),
                "ENTRYFLOW_DEFAULT_CONCURRENCY",
                defaults.default_concurrency,
            )?,
            max_concurrency: parse_or(
                text("ENTRYFLOW_MAX_CONCURRENCY"),
                "ENTRYFLOW_MAX_CONCURRENCY",
                defaults.max_concurrency,
            )?,
            rate_limit_capacity: parse_or(
                text("ENTRYFLOW_RATE_LIMIT_CAPACITY"),
                "ENTRYFLOW_RATE_LIMIT_CAPACITY",
                defaults.rate_limit_capacity,
            )?,
            rate_limit_fill_rate: parse_or(
                text("ENTRYFLOW_RATE_LIMIT_FILL_RATE"),
                "ENTRYFLOW_RATE_LIMIT_FILL_RATE",
                defaults.rate_limit_fill_rate,
            )?,
            stale_processing_secs: parse_or(
                text("ENTRYFLOW_STALE_PROCESSING_SECS"),
                "ENTRYFLOW_STALE_PROCESSING_SECS",
                defaults.stale_processing_secs,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_concurrency == 0 || self.default_concurrency == 0 {
            return Err(EngineError::Config(
                "concurrency settings must be at least 1".to_string(),
            ));
        }
        if !(self.rate_limit_capacity >= 1.0) {
            return Err(EngineError::Config(
                "rate limit capacity must be at least 1".to_string(),
            ));
        }
        if !(self.rate_limit_fill_rate >= 0.0) || !self.rate_limit_fill_rate.is_finite() {
            return Err(EngineError::Config(
                "rate limit fill rate must be a non-negative number".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective concurrency for a node: its own cap or the default, clamped
    /// to `1..=max_concurrency`.
    pub fn clamp_concurrency(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_concurrency)
            .clamp(1, self.max_concurrency.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_processing_secs)
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T, EngineError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| EngineError::Config(format!("{key}: invalid value '{raw}'"))),
    }
}
