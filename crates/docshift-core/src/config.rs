//! Engine configuration.

use std::time::Duration;

use crate::reindex::ReindexConfig;
use crate::retry::RetryPolicy;

/// Model version the engine upgrades deployments to by default.
pub const DEFAULT_TARGET_VERSION: &str = "2";

/// Index holding the deployment's model version document.
pub const DEFAULT_MODEL_INDEX: &str = ".model";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Model version a run should reach.
    pub target_version: String,

    /// Cursor and page settings shared by every stage.
    pub reindex: ReindexConfig,

    /// Retry policy for capacity-rejected bulk items.
    pub retry: RetryPolicy,

    /// Index storing the model version.
    pub model_index: String,
}

impl EngineConfig {
    /// Create a configuration targeting `target_version`.
    pub fn new(target_version: impl Into<String>) -> Self {
        Self {
            target_version: target_version.into(),
            reindex: ReindexConfig::default(),
            retry: RetryPolicy::default(),
            model_index: DEFAULT_MODEL_INDEX.to_string(),
        }
    }

    /// Set the cursor page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.reindex = self.reindex.with_page_size(page_size);
        self
    }

    /// Set the cursor keep-alive window.
    pub fn with_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.reindex = self.reindex.with_keep_alive(keep_alive);
        self
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the number of bulk resubmissions.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retry = self.retry.with_retries(retries);
        self
    }

    /// Set the initial and maximum retry delay.
    pub fn with_retry_timeouts(mut self, min: Duration, max: Duration) -> Self {
        self.retry = self.retry.with_timeouts(min, max);
        self
    }

    /// Set the index storing the model version.
    pub fn with_model_index(mut self, index: impl Into<String>) -> Self {
        self.model_index = index.into();
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.target_version, DEFAULT_TARGET_VERSION);
        assert_eq!(config.model_index, DEFAULT_MODEL_INDEX);
        assert_eq!(config.reindex.keep_alive, "5m");
        assert_eq!(config.reindex.page_size, 500);
        assert_eq!(config.retry.retries, 5);
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new("3")
            .with_page_size(50)
            .with_keep_alive("1m")
            .with_retries(2)
            .with_retry_timeouts(Duration::from_millis(10), Duration::from_secs(1))
            .with_model_index(".deployment");

        assert_eq!(config.target_version, "3");
        assert_eq!(config.reindex.page_size, 50);
        assert_eq!(config.reindex.keep_alive, "1m");
        assert_eq!(config.retry.retries, 2);
        assert_eq!(config.retry.min_timeout, Duration::from_millis(10));
        assert_eq!(config.model_index, ".deployment");
    }
}
