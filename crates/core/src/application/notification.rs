// Job lifecycle notifications and per-topic statistics
use crate::application::worker::constants::NOTIFICATION_CHANNEL_CAPACITY;
use crate::domain::{Job, JobId, JobProperties, TopicStatistics};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Started,
    Finished,
    Failed,
    Cancelled,
    Removed,
}

/// Event published on a job state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNotification {
    pub kind: NotificationKind,
    pub job_id: JobId,
    pub topic: String,
    pub name: Option<String>,
    /// User properties only
    pub properties: JobProperties,
    /// Waiting time for STARTED, processing time for FINISHED
    pub time_ms: Option<i64>,
}

/// Broadcast hub that also feeds topic statistics
pub struct JobEvents {
    sender: broadcast::Sender<JobNotification>,
    topic_statistics: Mutex<HashMap<String, TopicStatistics>>,
}

impl JobEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self {
            sender,
            topic_statistics: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobNotification> {
        self.sender.subscribe()
    }

    pub fn emit(&self, kind: NotificationKind, job: &Job, time_ms: Option<i64>, now: i64) {
        {
            let mut stats = self
                .topic_statistics
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            let entry = stats
                .entry(job.topic.clone())
                .or_insert_with(|| TopicStatistics::new(job.topic.clone()));
            match kind {
                NotificationKind::Started => entry.job_activated(time_ms, now),
                NotificationKind::Finished => entry.job_finished(time_ms, now),
                NotificationKind::Failed => entry.job_failed(),
                NotificationKind::Cancelled => entry.job_cancelled(),
                NotificationKind::Removed => {}
            }
        }

        let notification = JobNotification {
            kind,
            job_id: job.id.clone(),
            topic: job.topic.clone(),
            name: job.name.clone(),
            properties: job.properties.clone(),
            time_ms,
        };
        // No subscribers is fine
        if self.sender.send(notification).is_err() {
            debug!(job_id = %job.id, kind = ?kind, "Notification without subscribers");
        }
    }

    /// Snapshot sorted by topic
    pub fn topic_statistics(&self) -> Vec<TopicStatistics> {
        let stats = self
            .topic_statistics
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let mut all: Vec<TopicStatistics> = stats.values().cloned().collect();
        all.sort_by(|a, b| a.topic.cmp(&b.topic));
        all
    }
}

impl Default for JobEvents {
    fn default() -> Self {
        Self::new()
    }
}
