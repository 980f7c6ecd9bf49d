// Consumer registry
use crate::domain::topic::{self, TopicMatcher, BRIDGE_TOPIC};
use crate::domain::Job;
use crate::port::{JobConsumer, PendingCompletion};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info};

/// One bound consumer
pub struct ConsumerRegistration {
    service_id: u64,
    ranking: i32,
    topics: Vec<String>,
    consumer: Arc<dyn JobConsumer>,
    pending: Mutex<Vec<PendingCompletion>>,
}

impl ConsumerRegistration {
    pub fn service_id(&self) -> u64 {
        self.service_id
    }

    pub fn ranking(&self) -> i32 {
        self.ranking
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn consumer(&self) -> Arc<dyn JobConsumer> {
        Arc::clone(&self.consumer)
    }

    /// Remember an outstanding async completion so unbinding can fail it
    pub fn track_async(&self, completion: PendingCompletion) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.retain(PendingCompletion::is_pending);
        pending.push(completion);
    }

    fn fail_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|p| p.into_inner()));
        pending.iter().filter(|completion| completion.fail()).count()
    }
}

#[derive(Default)]
struct Registry {
    registrations: Vec<Arc<ConsumerRegistration>>,
    /// topic pattern -> consumers, best first
    by_topic: HashMap<String, Vec<Arc<ConsumerRegistration>>>,
}

impl Registry {
    fn rebuild(&mut self) {
        let mut by_topic: HashMap<String, Vec<Arc<ConsumerRegistration>>> = HashMap::new();
        for registration in &self.registrations {
            for topic in &registration.topics {
                by_topic
                    .entry(topic.clone())
                    .or_default()
                    .push(Arc::clone(registration));
            }
        }
        for consumers in by_topic.values_mut() {
            consumers.sort_by(|a, b| {
                b.ranking
                    .cmp(&a.ranking)
                    .then_with(|| b.service_id.cmp(&a.service_id))
            });
        }
        self.by_topic = by_topic;
    }
}

/// Topic pattern -> consumer registry
///
/// Registrations are sorted by ranking, then by service id (newest first).
/// Lookups try the exact topic, then its category wildcard.
pub struct JobConsumerManager {
    registry: RwLock<Registry>,
    next_service_id: AtomicU64,
    whitelist: Vec<TopicMatcher>,
    blacklist: Vec<TopicMatcher>,
    changes: watch::Sender<u64>,
}

impl JobConsumerManager {
    pub fn new(whitelist: &[String], blacklist: &[String]) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            registry: RwLock::new(Registry::default()),
            next_service_id: AtomicU64::new(1),
            whitelist: whitelist.iter().map(|p| TopicMatcher::parse(p)).collect(),
            blacklist: blacklist.iter().map(|p| TopicMatcher::parse(p)).collect(),
            changes,
        }
    }

    /// Register a consumer for topic patterns; returns its service id
    pub fn bind(&self, topics: &[&str], ranking: i32, consumer: Arc<dyn JobConsumer>) -> u64 {
        let service_id = self.next_service_id.fetch_add(1, Ordering::Relaxed);
        let registration = Arc::new(ConsumerRegistration {
            service_id,
            ranking,
            topics: topics
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            consumer,
            pending: Mutex::new(Vec::new()),
        });
        info!(
            service_id = service_id,
            ranking = ranking,
            topics = ?registration.topics,
            "Job consumer bound"
        );
        {
            let mut registry = self.registry.write().unwrap_or_else(|p| p.into_inner());
            registry.registrations.push(registration);
            registry.rebuild();
        }
        self.notify_changed();
        service_id
    }

    /// Remove a consumer; outstanding async jobs of it fail
    pub fn unbind(&self, service_id: u64) -> bool {
        let removed = {
            let mut registry = self.registry.write().unwrap_or_else(|p| p.into_inner());
            let position = registry
                .registrations
                .iter()
                .position(|r| r.service_id == service_id);
            let removed = position.map(|index| registry.registrations.remove(index));
            registry.rebuild();
            removed
        };
        match removed {
            Some(registration) => {
                let failed = registration.fail_pending();
                info!(
                    service_id = service_id,
                    failed_async_jobs = failed,
                    "Job consumer unbound"
                );
                self.notify_changed();
                true
            }
            None => false,
        }
    }

    /// Best consumer for a topic
    pub fn get_executor(&self, topic: &str) -> Option<Arc<ConsumerRegistration>> {
        let registry = self.registry.read().unwrap_or_else(|p| p.into_inner());
        let best = |key: &str| registry.by_topic.get(key).and_then(|c| c.first().cloned());
        best(topic).or_else(|| topic::category(topic).and_then(|category| best(&category)))
    }

    /// Consumer for a job, falling back to the bridge consumer for bridged jobs
    pub fn executor_for(&self, job: &Job) -> Option<Arc<ConsumerRegistration>> {
        self.get_executor(&job.topic).or_else(|| {
            if job.is_bridged() {
                let registry = self.registry.read().unwrap_or_else(|p| p.into_inner());
                registry
                    .by_topic
                    .get(BRIDGE_TOPIC)
                    .and_then(|c| c.first().cloned())
            } else {
                None
            }
        })
    }

    pub fn supports_bridged_events(&self) -> bool {
        let registry = self.registry.read().unwrap_or_else(|p| p.into_inner());
        registry.by_topic.contains_key(BRIDGE_TOPIC)
    }

    /// Sorted, comma-joined topics this instance advertises
    pub fn topics(&self) -> String {
        let registry = self.registry.read().unwrap_or_else(|p| p.into_inner());
        let mut topics: Vec<&String> = registry
            .by_topic
            .keys()
            .filter(|topic| self.is_advertised(topic))
            .collect();
        topics.sort();
        let joined = topics
            .into_iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",");
        debug!(topics = %joined, "Advertised consumer topics");
        joined
    }

    fn is_advertised(&self, topic: &str) -> bool {
        self.whitelist.iter().any(|m| m.matches(topic))
            && !self.blacklist.iter().any(|m| m.matches(topic))
    }

    /// Bumped on every bind/unbind
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify_changed(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }
}
