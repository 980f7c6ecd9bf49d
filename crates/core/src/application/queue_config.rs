// Queue configuration registry
use crate::domain::queue::DEFAULT_MAX_PARALLEL;
use crate::domain::{keys, JobProperties, QueueConfig, QueueType};
use crate::error::{AppError, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

struct ConfigState {
    main_queue: Arc<QueueConfig>,
    /// Highest ranking first, declaration order within a ranking
    configs: Vec<Arc<QueueConfig>>,
}

/// Holds the static queue configurations and hands out versions
///
/// A version identifies one configuration generation. Reloading keeps the
/// version of configurations whose content did not change, so their live
/// queues are not outdated.
pub struct QueueConfigurationManager {
    state: RwLock<ConfigState>,
    next_version: AtomicU64,
}

impl QueueConfigurationManager {
    pub fn new(main_queue: QueueConfig, configs: Vec<QueueConfig>) -> Result<Self> {
        let manager = Self {
            state: RwLock::new(ConfigState {
                main_queue: Arc::new(QueueConfig::main_queue()),
                configs: Vec::new(),
            }),
            next_version: AtomicU64::new(1),
        };
        manager.update(main_queue, configs)?;
        Ok(manager)
    }

    /// Replace the configuration set
    ///
    /// # Errors
    /// - AppError::Config if a configuration is invalid (nothing is replaced)
    pub fn update(&self, main_queue: QueueConfig, configs: Vec<QueueConfig>) -> Result<()> {
        main_queue
            .validate(false)
            .map_err(|e| AppError::Config(e.to_string()))?;
        for config in &configs {
            config
                .validate(true)
                .map_err(|e| AppError::Config(e.to_string()))?;
        }
        for config in std::iter::once(&main_queue).chain(&configs) {
            if config.is_single_slot_parallel() {
                warn!(
                    queue = %config.name,
                    "Parallel queue limited to one job at a time, order is still not guaranteed"
                );
            }
        }

        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        let main_queue = self.versioned(main_queue, std::slice::from_ref(&state.main_queue));
        let mut versioned: Vec<Arc<QueueConfig>> = configs
            .into_iter()
            .map(|config| self.versioned(config, &state.configs))
            .collect();
        // Stable sort keeps declaration order within a ranking
        versioned.sort_by(|a, b| b.ranking.cmp(&a.ranking));

        info!(
            queues = versioned.len(),
            main_queue_version = main_queue.version,
            "Queue configurations loaded"
        );
        state.main_queue = main_queue;
        state.configs = versioned;
        Ok(())
    }

    fn versioned(&self, config: QueueConfig, previous: &[Arc<QueueConfig>]) -> Arc<QueueConfig> {
        let unchanged = previous
            .iter()
            .find(|old| old.version != 0 && QueueConfig { version: old.version, ..config.clone() } == ***old);
        match unchanged {
            Some(old) => Arc::clone(old),
            None => Arc::new(config.with_version(self.allocate_version())),
        }
    }

    fn allocate_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    pub fn main_queue(&self) -> Arc<QueueConfig> {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&state.main_queue)
    }

    pub fn configurations(&self) -> Vec<Arc<QueueConfig>> {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        state.configs.clone()
    }

    /// First static configuration matching the topic with its resolved name
    pub fn match_topic(&self, topic: &str) -> Option<(String, Arc<QueueConfig>)> {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        state
            .configs
            .iter()
            .find_map(|config| config.match_topic(topic).map(|name| (name, Arc::clone(config))))
    }

    /// Ad-hoc configuration for a custom queue named by the job itself
    pub fn custom_config(&self, queue_name: &str, properties: &JobProperties) -> Arc<QueueConfig> {
        let main = self.main_queue();
        let ordered = matches!(properties.get(keys::QUEUE_ORDERED), Some(v) if truthy(v));
        let (queue_type, max_parallel) = if ordered {
            (QueueType::Ordered, 1)
        } else {
            let max_parallel = match properties.get(keys::PARALLEL) {
                Some(Value::Bool(true)) => -1,
                Some(Value::Bool(false)) => 1,
                Some(Value::Number(n)) => n.as_i64().map_or(DEFAULT_MAX_PARALLEL, |n| n.max(1) as i32),
                _ => DEFAULT_MAX_PARALLEL,
            };
            (QueueType::Unordered, max_parallel)
        };
        Arc::new(QueueConfig {
            name: queue_name.to_string(),
            queue_type,
            topics: Vec::new(),
            max_parallel,
            retries: main.retries,
            retry_delay_ms: main.retry_delay_ms,
            priority: main.priority,
            run_local: false,
            keep_jobs: main.keep_jobs,
            ranking: 0,
            version: self.allocate_version(),
        })
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        Value::Null => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ranked(name: &str, ranking: i32, topics: &[&str]) -> QueueConfig {
        QueueConfig {
            ranking,
            ..QueueConfig::new(name, QueueType::Unordered, topics)
        }
    }

    #[test]
    fn test_ranking_then_declaration_order() {
        let manager = QueueConfigurationManager::new(
            QueueConfig::main_queue(),
            vec![
                ranked("first", 0, &["a/*"]),
                ranked("second", 0, &["a/*"]),
                ranked("ranked", 5, &["a/b"]),
            ],
        )
        .unwrap();

        assert_eq!(manager.match_topic("a/b").unwrap().0, "ranked");
        assert_eq!(manager.match_topic("a/c").unwrap().0, "first");
        assert!(manager.match_topic("z").is_none());
    }

    #[test]
    fn test_reload_keeps_versions_of_unchanged_configs() {
        let manager = QueueConfigurationManager::new(
            QueueConfig::main_queue(),
            vec![ranked("keep", 0, &["a/*"]), ranked("change", 0, &["b/*"])],
        )
        .unwrap();
        let keep_before = manager.match_topic("a/x").unwrap().1.version;
        let change_before = manager.match_topic("b/x").unwrap().1.version;
        let main_before = manager.main_queue().version;

        let mut changed = ranked("change", 0, &["b/*"]);
        changed.retries = 1;
        manager
            .update(QueueConfig::main_queue(), vec![ranked("keep", 0, &["a/*"]), changed])
            .unwrap();

        assert_eq!(manager.match_topic("a/x").unwrap().1.version, keep_before);
        assert_ne!(manager.match_topic("b/x").unwrap().1.version, change_before);
        assert_eq!(manager.main_queue().version, main_before);
    }

    #[test]
    fn test_invalid_update_is_rejected() {
        let manager = QueueConfigurationManager::new(QueueConfig::main_queue(), vec![]).unwrap();
        let result = manager.update(QueueConfig::main_queue(), vec![ranked("bad", 0, &[])]);
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_custom_config_from_properties() {
        let manager = QueueConfigurationManager::new(QueueConfig::main_queue(), vec![]).unwrap();

        let mut props = JobProperties::new();
        props.insert(keys::QUEUE_ORDERED.into(), json!(true));
        let config = manager.custom_config("custom", &props);
        assert_eq!(config.queue_type, QueueType::Ordered);
        assert_eq!(config.effective_max_parallel(), 1);

        let mut props = JobProperties::new();
        props.insert(keys::PARALLEL.into(), json!(3));
        let config = manager.custom_config("custom", &props);
        assert_eq!(config.queue_type, QueueType::Unordered);
        assert_eq!(config.max_parallel, 3);
    }
}
