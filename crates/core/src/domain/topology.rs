//! Cluster topology snapshot and job target selection.
//!
//! A [`TopologyCapabilities`] is built once per topology change and never
//! updated in place. Round-robin cursors live inside the snapshot, so a new
//! snapshot starts every topic from the first candidate again.

use crate::domain::job::is_bridged;
use crate::domain::queue::{QueueInfo, QueueType};
use crate::domain::resource::PropertyMap;
use crate::domain::topic::{self, BRIDGE_TOPIC};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// One cluster member as seen by the topology view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    pub id: String,
    pub leader: bool,
    /// Advertised consumer topics (exact, `prefix/*` or `/`)
    pub topics: Vec<String>,
}

impl InstanceDescription {
    /// Build from the comma joined advertisement string
    pub fn new(id: impl Into<String>, leader: bool, topics: &str) -> Self {
        Self {
            id: id.into(),
            leader,
            topics: topics
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Cluster view delivered with topology events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyView {
    pub local_instance_id: String,
    pub instances: Vec<InstanceDescription>,
}

impl TopologyView {
    /// View of a cluster with a single (leading) member
    pub fn single(local_instance_id: impl Into<String>, topics: &str) -> Self {
        let id = local_instance_id.into();
        Self {
            instances: vec![InstanceDescription::new(id.clone(), true, topics)],
            local_instance_id: id,
        }
    }

    fn topics_by_instance(&self) -> BTreeMap<String, Vec<String>> {
        self.instances
            .iter()
            .map(|i| (i.id.clone(), i.topics.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TopologyEventKind {
    Init,
    Changing,
    Changed,
    PropertiesChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyEvent {
    pub kind: TopologyEventKind,
    pub view: Option<TopologyView>,
}

impl TopologyEvent {
    pub fn new(kind: TopologyEventKind, view: Option<TopologyView>) -> Self {
        Self { kind, view }
    }
}

/// Immutable capability snapshot of the cluster
pub struct TopologyCapabilities {
    change_count: u64,
    local_instance_id: String,
    leader: bool,
    disable_distribution: bool,
    /// advertised topic -> capable instances, leader first then by id
    instance_capabilities: HashMap<String, Vec<InstanceDescription>>,
    all_instances: BTreeMap<String, Vec<String>>,
    round_robin: Mutex<HashMap<String, usize>>,
    active: AtomicBool,
}

impl TopologyCapabilities {
    pub fn new(view: &TopologyView, change_count: u64, disable_distribution: bool) -> Self {
        let mut instance_capabilities: HashMap<String, Vec<InstanceDescription>> = HashMap::new();
        for instance in &view.instances {
            for topic in &instance.topics {
                instance_capabilities
                    .entry(topic.clone())
                    .or_default()
                    .push(instance.clone());
            }
        }
        for candidates in instance_capabilities.values_mut() {
            candidates.sort_by(compare_instances);
        }

        let leader = view
            .instances
            .iter()
            .any(|i| i.id == view.local_instance_id && i.leader);

        Self {
            change_count,
            local_instance_id: view.local_instance_id.clone(),
            leader,
            disable_distribution,
            instance_capabilities,
            all_instances: view.topics_by_instance(),
            round_robin: Mutex::new(HashMap::new()),
            active: AtomicBool::new(true),
        }
    }

    pub fn change_count(&self) -> u64 {
        self.change_count
    }

    pub fn local_instance_id(&self) -> &str {
        &self.local_instance_id
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Instance id -> advertised topics
    pub fn all_instances(&self) -> &BTreeMap<String, Vec<String>> {
        &self.all_instances
    }

    /// True if the view advertises exactly the same capabilities
    pub fn is_same(&self, view: &TopologyView) -> bool {
        self.all_instances == view.topics_by_instance()
    }

    /// Instances able to process `topic`: exact registrations, then the
    /// category wildcard, then (bridged jobs only) the bridge topic.
    pub fn potential_targets(
        &self,
        topic: &str,
        properties: &PropertyMap,
    ) -> Vec<InstanceDescription> {
        let mut lookups = vec![topic.to_string()];
        if let Some(category) = topic::category(topic) {
            lookups.push(category);
        }
        if is_bridged(properties) {
            lookups.push(BRIDGE_TOPIC.to_string());
        }

        let mut targets: Vec<InstanceDescription> = Vec::new();
        for key in lookups {
            if let Some(candidates) = self.instance_capabilities.get(&key) {
                for candidate in candidates {
                    if !targets.iter().any(|t| t.id == candidate.id) {
                        targets.push(candidate.clone());
                    }
                }
            }
        }
        targets.sort_by(compare_instances);

        if self.disable_distribution {
            targets.retain(|t| t.leader);
        }
        targets
    }

    /// Pick the instance that should own a job; `None` leaves it unassigned
    pub fn detect_target(
        &self,
        topic: &str,
        properties: &PropertyMap,
        queue_info: &QueueInfo,
    ) -> Option<String> {
        let targets = self.potential_targets(topic, properties);
        if targets.is_empty() {
            return None;
        }
        if queue_info.config.queue_type == QueueType::Ordered {
            return Some(targets[0].id.clone());
        }
        if queue_info.config.run_local && targets.iter().any(|t| t.id == self.local_instance_id)
        {
            return Some(self.local_instance_id.clone());
        }

        let mut cursors = self
            .round_robin
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let index = match cursors.get(topic) {
            Some(previous) if previous + 1 < targets.len() => previous + 1,
            _ => 0,
        };
        cursors.insert(topic.to_string(), index);
        Some(targets[index].id.clone())
    }
}

fn compare_instances(a: &InstanceDescription, b: &InstanceDescription) -> CmpOrdering {
    b.leader.cmp(&a.leader).then_with(|| a.id.cmp(&b.id))
}
