//! Configuration for the agentloom substrate.
//!
//! Configuration is loaded from a JSON file with `AGENTLOOM_*` environment
//! variable overrides. Every field has a sensible default, so an empty file
//! (or no file at all) yields a usable configuration.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Process-default configuration, set once at startup.
static DEFAULT: OnceCell<LoomConfig> = OnceCell::new();

/// Top-level configuration for a runtime instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoomConfig {
    /// Timeline size budgets and compaction thresholds
    pub timeline: TimelineConfig,
    /// AI transaction retry behavior
    pub ai: AiRetryConfig,
    /// Auto-review policy thresholds and delays
    pub review: ReviewConfig,
    /// Logging format and level
    pub logging: LoggingConfig,
}

/// Size budgets for the timeline compaction engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// How many items may stay un-summarized before shrink kicks in
    pub full_memory_count: usize,
    /// Rendered size above which an item is shrunk first
    pub item_shrink_threshold: usize,
    /// Upper bound on the rendered dump, enforced recursively
    pub total_dump_content_limit: usize,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            full_memory_count: 30,
            item_shrink_threshold: 2_048,
            total_dump_content_limit: 32_768,
        }
    }
}

impl TimelineConfig {
    /// Hard cap on live items; beyond this a prefix is reduced to one entry.
    pub fn max_timeline_limit(&self) -> usize {
        self.full_memory_count * 3
    }
}

/// Retry behavior for checkpointed AI transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiRetryConfig {
    /// Maximum retry attempts after the first failure
    pub max_retries: u32,
    /// Fixed delay between attempts, in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for AiRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
        }
    }
}

/// Thresholds for the AI-scored auto-review policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Risk score below this auto-continues after `short_delay_ms`
    pub low_threshold: f64,
    /// Risk score below this (but at/above low) auto-continues after `long_delay_ms`;
    /// at/above this the decision falls back to a human
    pub mid_threshold: f64,
    /// Delay before auto-continuing a low-risk step, in milliseconds
    pub short_delay_ms: u64,
    /// Delay before auto-continuing a medium-risk step, in milliseconds
    pub long_delay_ms: u64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            low_threshold: 0.3,
            mid_threshold: 0.6,
            short_delay_ms: 200,
            long_delay_ms: 1_000,
        }
    }
}

/// Logging output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact human-readable text
    Pretty,
    /// Structured JSON lines for log aggregators
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset (e.g. "info", "agentloom=debug")
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LoomConfig {
    /// Load configuration from a JSON file with environment overrides.
    ///
    /// A missing file yields the default configuration; environment variables
    /// still apply.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config: LoomConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            LoomConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `AGENTLOOM_*` environment variable overrides.
    ///
    /// Pattern: `AGENTLOOM_SECTION_KEY`, e.g. `AGENTLOOM_TIMELINE_FULL_MEMORY_COUNT`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("AGENTLOOM_TIMELINE_FULL_MEMORY_COUNT") {
            if let Ok(v) = val.parse() {
                self.timeline.full_memory_count = v;
            }
        }
        if let Ok(val) = std::env::var("AGENTLOOM_TIMELINE_ITEM_SHRINK_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.timeline.item_shrink_threshold = v;
            }
        }
        if let Ok(val) = std::env::var("AGENTLOOM_TIMELINE_TOTAL_DUMP_CONTENT_LIMIT") {
            if let Ok(v) = val.parse() {
                self.timeline.total_dump_content_limit = v;
            }
        }
        if let Ok(val) = std::env::var("AGENTLOOM_AI_MAX_RETRIES") {
            if let Ok(v) = val.parse() {
                self.ai.max_retries = v;
            }
        }
        if let Ok(val) = std::env::var("AGENTLOOM_AI_RETRY_DELAY_MS") {
            if let Ok(v) = val.parse() {
                self.ai.retry_delay_ms = v;
            }
        }
        if let Ok(val) = std::env::var("AGENTLOOM_REVIEW_LOW_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.review.low_threshold = v;
            }
        }
        if let Ok(val) = std::env::var("AGENTLOOM_REVIEW_MID_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.review.mid_threshold = v;
            }
        }
        if let Ok(val) = std::env::var("AGENTLOOM_LOGGING_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Install this configuration as the process default.
    ///
    /// Returns an error if a default was already set.
    pub fn set_default(self) -> Result<()> {
        DEFAULT
            .set(self)
            .map_err(|_| crate::error::LoomError::Config("default config already set".into()))
    }

    /// The process-default configuration, or built-in defaults if none was set.
    pub fn default_or_builtin() -> LoomConfig {
        DEFAULT.get().cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LoomConfig::default();
        assert_eq!(cfg.timeline.full_memory_count, 30);
        assert_eq!(cfg.timeline.max_timeline_limit(), 90);
        assert_eq!(cfg.ai.max_retries, 3);
        assert!(cfg.review.low_threshold < cfg.review.mid_threshold);
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let cfg = LoomConfig::load_from_path(Path::new("/nonexistent/agentloom.json")).unwrap();
        assert_eq!(cfg.timeline.full_memory_count, 30);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"timeline": {"full_memory_count": 5}}"#).unwrap();

        let cfg = LoomConfig::load_from_path(&path).unwrap();
        assert_eq!(cfg.timeline.full_memory_count, 5);
        // Unspecified sections keep their defaults
        assert_eq!(cfg.ai.max_retries, 3);
        assert_eq!(cfg.timeline.max_timeline_limit(), 15);
    }

    #[test]
    fn test_env_override() {
        // Env mutation is process-global; use a key no other test touches.
        std::env::set_var("AGENTLOOM_AI_MAX_RETRIES", "7");
        let mut cfg = LoomConfig::default();
        cfg.apply_env_overrides();
        std::env::remove_var("AGENTLOOM_AI_MAX_RETRIES");
        assert_eq!(cfg.ai.max_retries, 7);
    }

    #[test]
    fn test_env_override_ignores_garbage() {
        std::env::set_var("AGENTLOOM_AI_RETRY_DELAY_MS", "not-a-number");
        let mut cfg = LoomConfig::default();
        cfg.apply_env_overrides();
        std::env::remove_var("AGENTLOOM_AI_RETRY_DELAY_MS");
        assert_eq!(cfg.ai.retry_delay_ms, 1_000);
    }

    #[test]
    fn test_config_roundtrip() {
        let cfg = LoomConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: LoomConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed.timeline.total_dump_content_limit,
            cfg.timeline.total_dump_content_limit
        );
    }
}
