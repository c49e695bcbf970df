//! Engine and walker configuration types.

use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Configuration for the operation engine.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct EngineConfig {
    /// Bytes read and written per chunk when copying.
    #[builder(default = "64 * 1024")]
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Minimum interval between progress events for one file, in milliseconds.
    #[builder(default = "100")]
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// How often a transient I/O failure is retried before the operation aborts.
    #[builder(default = "3")]
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retries, in milliseconds.
    #[builder(default = "250")]
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Capacity of the event broadcast buffer per subscriber.
    #[builder(default = "1024")]
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Rate limit given to new operations (bytes/second, 0 = unlimited).
    #[builder(default = "0")]
    #[serde(default)]
    pub default_rate_limit: u64,

    /// Remove source directories left empty after a move finishes.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub prune_moved_dirs: bool,

    /// Walker settings used to expand source roots.
    #[builder(default)]
    #[serde(default)]
    pub walk: WalkConfig,
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_progress_interval_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    250
}

fn default_event_capacity() -> usize {
    1024
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.chunk_size == Some(0) {
            return Err("Chunk size must be positive".to_string());
        }
        if self.event_capacity == Some(0) {
            return Err("Event capacity must be positive".to_string());
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Create a new engine config builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Progress interval as a duration.
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Retry delay as a duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            progress_interval_ms: default_progress_interval_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            event_capacity: default_event_capacity(),
            default_rate_limit: 0,
            prune_moved_dirs: true,
            walk: WalkConfig::default(),
        }
    }
}

/// Configuration for expanding source roots.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
pub struct WalkConfig {
    /// Glob patterns matched against entry names; matches are not transferred.
    #[builder(default)]
    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    /// Include hidden files (starting with .).
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub include_hidden: bool,

    /// Maximum depth below each root (None = unlimited).
    #[builder(default)]
    #[serde(default)]
    pub max_depth: Option<u32>,
}

impl WalkConfig {
    /// Create a new walk config builder.
    pub fn builder() -> WalkConfigBuilder {
        WalkConfigBuilder::default()
    }

    /// Check if hidden files should be skipped.
    pub fn should_skip_hidden(&self, name: &str) -> bool {
        !self.include_hidden && name.starts_with('.')
    }
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: Vec::new(),
            include_hidden: true,
            max_depth: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::builder()
            .chunk_size(4096usize)
            .max_retries(1u32)
            .build()
            .unwrap();

        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.progress_interval(), Duration::from_millis(100));
        assert!(config.prune_moved_dirs);
    }

    #[test]
    fn test_config_rejects_zero_chunk() {
        assert!(EngineConfig::builder().chunk_size(0usize).build().is_err());
    }

    #[test]
    fn test_config_from_partial_json() {
        let json = r#"{"max_retries": 5, "walk": {"include_hidden": false}}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.chunk_size, 64 * 1024);
        assert!(config.walk.should_skip_hidden(".git"));
        assert!(!config.walk.should_skip_hidden("src"));
    }
}
