// Queue Domain Model

use crate::domain::error::DomainError;
use crate::domain::topic::TopicMatcher;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Name of the queue that takes every job no configuration claims
pub const MAIN_QUEUE_NAME: &str = "<main queue>";

pub const DEFAULT_MAX_PARALLEL: i32 = 15;
pub const DEFAULT_RETRIES: i32 = 10;
pub const DEFAULT_RETRY_DELAY_MS: i64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueType {
    #[default]
    Unordered,
    Ordered,
    TopicRoundRobin,
    /// Jobs are cancelled on arrival without being stored
    Drop,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Unordered => "UNORDERED",
            QueueType::Ordered => "ORDERED",
            QueueType::TopicRoundRobin => "TOPIC_ROUND_ROBIN",
            QueueType::Drop => "DROP",
        }
    }
}

/// Scheduling priority hint for queue workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueuePriority {
    #[default]
    Norm,
    Min,
    Max,
}

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// May contain `{0}`, replaced by the unmatched part of the topic
    pub name: String,
    #[serde(rename = "type")]
    pub queue_type: QueueType,
    pub topics: Vec<String>,
    /// `-1` means one worker per CPU
    pub max_parallel: i32,
    /// `-1` means unlimited
    pub retries: i32,
    pub retry_delay_ms: i64,
    pub priority: QueuePriority,
    pub run_local: bool,
    /// Keep succeeded jobs in history
    pub keep_jobs: bool,
    pub ranking: i32,
    /// Assigned on (re)load; compared by value to detect reconfiguration
    #[serde(skip)]
    pub version: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            queue_type: QueueType::Unordered,
            topics: Vec::new(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            retries: DEFAULT_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            priority: QueuePriority::Norm,
            run_local: false,
            keep_jobs: false,
            ranking: 0,
            version: 0,
        }
    }
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, queue_type: QueueType, topics: &[&str]) -> Self {
        Self {
            name: name.into(),
            queue_type,
            topics: topics.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn main_queue() -> Self {
        Self {
            name: MAIN_QUEUE_NAME.to_string(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Check the configuration
    ///
    /// A parallel queue with a max parallel of 1 is accepted. It runs one job
    /// at a time but keeps its type, so retries do not hold back later jobs.
    pub fn validate(&self, require_topics: bool) -> Result<(), DomainError> {
        let invalid = |reason: &str| DomainError::InvalidQueueConfig {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name is required"));
        }
        if require_topics && self.topics.iter().all(|t| t.trim().is_empty()) {
            return Err(invalid("at least one topic matcher is required"));
        }
        if self.retries < -1 {
            return Err(invalid("retries must be -1 or greater"));
        }
        if self.retry_delay_ms < 0 {
            return Err(invalid("retry delay must not be negative"));
        }
        if matches!(
            self.queue_type,
            QueueType::Unordered | QueueType::TopicRoundRobin
        ) && self.max_parallel != -1
            && self.max_parallel < 1
        {
            return Err(invalid("max parallel must be -1 or at least 1"));
        }
        Ok(())
    }

    pub fn matchers(&self) -> Vec<TopicMatcher> {
        self.topics
            .iter()
            .filter(|t| !t.trim().is_empty())
            .map(|t| TopicMatcher::parse(t))
            .collect()
    }

    /// Match a topic; returns the resolved queue name
    pub fn match_topic(&self, topic: &str) -> Option<String> {
        self.matchers().iter().find_map(|m| m.match_topic(topic)).map(|rest| {
            if self.name.contains("{0}") {
                self.name.replace("{0}", &rest.replace('/', "."))
            } else {
                self.name.clone()
            }
        })
    }

    /// Unordered or round-robin queue that can only ever run one job
    pub fn is_single_slot_parallel(&self) -> bool {
        self.queue_type != QueueType::Ordered && self.max_parallel == 1
    }

    /// Worker pool size for this queue
    pub fn effective_max_parallel(&self) -> usize {
        match self.queue_type {
            QueueType::Ordered => 1,
            _ if self.max_parallel == -1 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            _ => self.max_parallel.max(1) as usize,
        }
    }

    pub fn has_unlimited_retries(&self) -> bool {
        self.retries == -1
    }
}

/// Outcome of one queue resolution for a job (not persisted)
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub queue_name: String,
    pub config: Arc<QueueConfig>,
    pub target_id: Option<String>,
}

impl QueueInfo {
    pub fn new(queue_name: impl Into<String>, config: Arc<QueueConfig>) -> Self {
        Self {
            queue_name: queue_name.into(),
            config,
            target_id: None,
        }
    }
}
