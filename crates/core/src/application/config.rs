// Engine configuration (single struct, documented defaults)

use crate::application::worker::constants::{
    DEFAULT_BACKGROUND_LOAD_DELAY_SECS, DEFAULT_CLEANUP_PERIOD_SECS, DEFAULT_REPOSITORY_PATH,
};
use crate::domain::QueueConfig;
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Job engine configuration
///
/// Every field has a default, so an empty source yields a working
/// single-instance setup with only the main queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cluster instance id; generated when absent
    pub instance_id: Option<String>,
    /// Root of every job record (default `/var/eventing/jobs`)
    pub repository_path: String,
    /// Settle time before the first load pass (default 10s)
    pub background_load_delay_secs: u64,
    /// Use indexed search for load passes (default true)
    pub background_load_search: bool,
    /// Only the leader takes jobs (default false)
    pub disable_distribution: bool,
    /// Cleanup cycle period (default 60s)
    pub cleanup_period_secs: u64,
    /// Consumer topics advertised to the cluster (default `*`)
    pub consumer_whitelist: Vec<String>,
    pub consumer_blacklist: Vec<String>,
    pub main_queue: QueueConfig,
    pub queues: Vec<QueueConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            repository_path: DEFAULT_REPOSITORY_PATH.to_string(),
            background_load_delay_secs: DEFAULT_BACKGROUND_LOAD_DELAY_SECS,
            background_load_search: true,
            disable_distribution: false,
            cleanup_period_secs: DEFAULT_CLEANUP_PERIOD_SECS,
            consumer_whitelist: vec!["*".to_string()],
            consumer_blacklist: Vec::new(),
            main_queue: QueueConfig::main_queue(),
            queues: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Validate the whole configuration
    ///
    /// # Errors
    /// - AppError::Config describing the first problem found
    pub fn validate(&self) -> Result<()> {
        let path = self.repository_path.trim_end_matches('/');
        if !path.starts_with('/') || path.is_empty() {
            return Err(AppError::Config(format!(
                "repository_path must be an absolute, non-root path: '{}'",
                self.repository_path
            )));
        }
        if self.cleanup_period_secs == 0 {
            return Err(AppError::Config(
                "cleanup_period_secs must be greater than zero".to_string(),
            ));
        }
        self.main_queue
            .validate(false)
            .map_err(|e| AppError::Config(e.to_string()))?;

        let mut names = HashSet::new();
        for queue in &self.queues {
            queue
                .validate(true)
                .map_err(|e| AppError::Config(e.to_string()))?;
            if !names.insert(queue.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate queue name: {}",
                    queue.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QueueType;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.repository_path, "/var/eventing/jobs");
        assert_eq!(config.background_load_delay_secs, 10);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = EngineConfig {
            repository_path: "relative/path".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.repository_path = "/jobs".to_string();
        config.queues = vec![
            QueueConfig::new("q", QueueType::Ordered, &["a/*"]),
            QueueConfig::new("q", QueueType::Unordered, &["b/*"]),
        ];
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"background_load_delay_secs": 0,
                "queues": [{"name": "imports", "type": "ORDERED", "topics": ["import/*"]}]}"#,
        )
        .unwrap();
        assert_eq!(config.background_load_delay_secs, 0);
        assert_eq!(config.queues[0].queue_type, QueueType::Ordered);
        assert_eq!(config.queues[0].retries, 10);
        assert!(config.validate().is_ok());
    }
}
