// Job statistics (per queue, aggregated, per topic)

use serde::{Deserialize, Serialize};

/// Counters of one queue or of the whole engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub start_time: i64,
    pub last_activated_at: Option<i64>,
    pub last_finished_at: Option<i64>,
    pub queued_jobs: i64,
    pub active_jobs: i64,
    pub finished_jobs: i64,
    /// Failed attempts that were rescheduled
    pub failed_jobs: i64,
    pub cancelled_jobs: i64,
    pub waiting_time_total_ms: i64,
    pub waiting_count: i64,
    pub processing_time_total_ms: i64,
    pub processing_count: i64,
}

impl Statistics {
    pub fn new(start_time: i64) -> Self {
        Self {
            start_time,
            ..Default::default()
        }
    }

    pub fn processed_jobs(&self) -> i64 {
        self.finished_jobs + self.failed_jobs + self.cancelled_jobs
    }

    pub fn average_waiting_time_ms(&self) -> i64 {
        average(self.waiting_time_total_ms, self.waiting_count)
    }

    pub fn average_processing_time_ms(&self) -> i64 {
        average(self.processing_time_total_ms, self.processing_count)
    }

    pub fn job_queued(&mut self) {
        self.queued_jobs += 1;
    }

    pub fn job_dequeued(&mut self) {
        self.queued_jobs = (self.queued_jobs - 1).max(0);
    }

    pub fn job_started(&mut self, waiting_ms: i64, now: i64) {
        self.job_dequeued();
        self.active_jobs += 1;
        self.waiting_time_total_ms += waiting_ms.max(0);
        self.waiting_count += 1;
        self.last_activated_at = Some(now);
    }

    pub fn job_finished(&mut self, processing_ms: i64, now: i64) {
        self.active_jobs = (self.active_jobs - 1).max(0);
        self.finished_jobs += 1;
        self.processing_time_total_ms += processing_ms.max(0);
        self.processing_count += 1;
        self.last_finished_at = Some(now);
    }

    pub fn job_failed(&mut self) {
        self.active_jobs = (self.active_jobs - 1).max(0);
        self.failed_jobs += 1;
    }

    pub fn job_cancelled(&mut self) {
        self.active_jobs = (self.active_jobs - 1).max(0);
        self.cancelled_jobs += 1;
    }

    pub fn clear_queued(&mut self) {
        self.queued_jobs = 0;
    }

    /// Fold another set of counters into this one
    pub fn add(&mut self, other: &Statistics) {
        self.start_time = match (self.start_time, other.start_time) {
            (0, theirs) => theirs,
            (ours, 0) => ours,
            (ours, theirs) => ours.min(theirs),
        };
        self.last_activated_at = self.last_activated_at.max(other.last_activated_at);
        self.last_finished_at = self.last_finished_at.max(other.last_finished_at);
        self.queued_jobs += other.queued_jobs;
        self.active_jobs += other.active_jobs;
        self.finished_jobs += other.finished_jobs;
        self.failed_jobs += other.failed_jobs;
        self.cancelled_jobs += other.cancelled_jobs;
        self.waiting_time_total_ms += other.waiting_time_total_ms;
        self.waiting_count += other.waiting_count;
        self.processing_time_total_ms += other.processing_time_total_ms;
        self.processing_count += other.processing_count;
    }

    pub fn reset(&mut self, now: i64) {
        *self = Statistics::new(now);
    }
}

/// Counters of a single topic, fed from job notifications
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStatistics {
    pub topic: String,
    pub last_activated_at: Option<i64>,
    pub last_finished_at: Option<i64>,
    pub finished_jobs: i64,
    pub failed_jobs: i64,
    pub cancelled_jobs: i64,
    pub waiting_time_total_ms: i64,
    pub waiting_count: i64,
    pub processing_time_total_ms: i64,
    pub processing_count: i64,
}

impl TopicStatistics {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn processed_jobs(&self) -> i64 {
        self.finished_jobs + self.failed_jobs + self.cancelled_jobs
    }

    pub fn average_waiting_time_ms(&self) -> i64 {
        average(self.waiting_time_total_ms, self.waiting_count)
    }

    pub fn average_processing_time_ms(&self) -> i64 {
        average(self.processing_time_total_ms, self.processing_count)
    }

    pub fn job_activated(&mut self, waiting_ms: Option<i64>, now: i64) {
        self.last_activated_at = Some(now);
        if let Some(waiting_ms) = waiting_ms {
            self.waiting_time_total_ms += waiting_ms.max(0);
            self.waiting_count += 1;
        }
    }

    pub fn job_finished(&mut self, processing_ms: Option<i64>, now: i64) {
        self.finished_jobs += 1;
        self.last_finished_at = Some(now);
        if let Some(processing_ms) = processing_ms {
            self.processing_time_total_ms += processing_ms.max(0);
            self.processing_count += 1;
        }
    }

    pub fn job_failed(&mut self) {
        self.failed_jobs += 1;
    }

    pub fn job_cancelled(&mut self) {
        self.cancelled_jobs += 1;
    }
}

fn average(total: i64, count: i64) -> i64 {
    if count == 0 {
        0
    } else {
        total / count
    }
}
