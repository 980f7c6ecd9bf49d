//! Storage layout and job identity.
//!
//! Everything lives below the repository path:
//!
//! ```text
//! <base>/assigned/<instance>/<topic.flat>/<Y>/<M>/<D>/<H>/<m>/<leaf>
//! <base>/unassigned/<topic.flat>/...
//! <base>/locks/<topic.flat>/<name>
//! <base>/finished/<topic.flat>/<id>    (succeeded history)
//! <base>/cancelled/<topic.flat>/<id>   (every other terminal state)
//! ```
//!
//! Job ids carry the time buckets, so the id doubles as the tail of the
//! resource path and the loader can walk buckets chronologically.

use crate::application::config::EngineConfig;
use crate::domain::job::is_bridged;
use crate::domain::resource::PropertyMap;
use crate::domain::topic;
use crate::port::{InstanceIdentity, TimeProvider};
use chrono::{Datelike, TimeZone, Timelike, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Topic segment used for bridged legacy events
pub const BRIDGED_TOPIC_SEGMENT: &str = "bridged.events";

pub struct JobManagerConfiguration {
    identity: InstanceIdentity,
    time_provider: Arc<dyn TimeProvider>,
    repository_path: String,
    assigned_jobs_path: String,
    unassigned_jobs_path: String,
    locks_path: String,
    local_jobs_path: String,
    stored_successful_jobs_path: String,
    stored_cancelled_jobs_path: String,
    background_load_delay: Duration,
    background_load_search: bool,
    disable_distribution: bool,
    cleanup_period: Duration,
    job_counter: AtomicU64,
}

impl JobManagerConfiguration {
    pub fn new(
        config: &EngineConfig,
        identity: InstanceIdentity,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let base = config.repository_path.trim_end_matches('/').to_string();
        let assigned_jobs_path = format!("{}/assigned", base);
        Self {
            local_jobs_path: format!("{}/{}", assigned_jobs_path, identity.id()),
            unassigned_jobs_path: format!("{}/unassigned", base),
            locks_path: format!("{}/locks", base),
            stored_successful_jobs_path: format!("{}/finished", base),
            stored_cancelled_jobs_path: format!("{}/cancelled", base),
            assigned_jobs_path,
            repository_path: base,
            identity,
            time_provider,
            background_load_delay: Duration::from_secs(config.background_load_delay_secs),
            background_load_search: config.background_load_search,
            disable_distribution: config.disable_distribution,
            cleanup_period: Duration::from_secs(config.cleanup_period_secs),
            job_counter: AtomicU64::new(0),
        }
    }

    pub fn instance_id(&self) -> &str {
        self.identity.id()
    }

    pub fn repository_path(&self) -> &str {
        &self.repository_path
    }

    pub fn assigned_jobs_path(&self) -> &str {
        &self.assigned_jobs_path
    }

    pub fn unassigned_jobs_path(&self) -> &str {
        &self.unassigned_jobs_path
    }

    pub fn locks_path(&self) -> &str {
        &self.locks_path
    }

    /// Jobs assigned to this instance
    pub fn local_jobs_path(&self) -> &str {
        &self.local_jobs_path
    }

    pub fn stored_successful_jobs_path(&self) -> &str {
        &self.stored_successful_jobs_path
    }

    pub fn stored_cancelled_jobs_path(&self) -> &str {
        &self.stored_cancelled_jobs_path
    }

    pub fn background_load_delay(&self) -> Duration {
        self.background_load_delay
    }

    pub fn background_load_search(&self) -> bool {
        self.background_load_search
    }

    pub fn disable_distribution(&self) -> bool {
        self.disable_distribution
    }

    pub fn cleanup_period(&self) -> Duration {
        self.cleanup_period
    }

    /// New job id bucketed by the current wall clock
    pub fn unique_id(&self, topic: &str) -> String {
        self.unique_id_at(topic, self.time_provider.now_millis())
    }

    /// New job id bucketed by `millis`
    pub fn unique_id_at(&self, topic: &str, millis: i64) -> String {
        let [year, month, day, hour, minute] = time_buckets(millis);
        let counter = self.job_counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}/{}/{}/{}/{}/{}_{}_{}",
            year,
            month,
            day,
            hour,
            minute,
            topic::flatten(topic),
            self.identity.id(),
            counter
        )
    }

    /// Resource path of an active job
    pub fn unique_path(
        &self,
        target_instance: Option<&str>,
        topic: &str,
        job_id: &str,
        properties: &PropertyMap,
    ) -> String {
        let topic_segment = if is_bridged(properties) {
            BRIDGED_TOPIC_SEGMENT.to_string()
        } else {
            topic::flatten(topic)
        };
        let area = match target_instance {
            Some(target) => format!("{}/{}", self.assigned_jobs_path, target),
            None => self.unassigned_jobs_path.clone(),
        };
        format!("{}/{}/{}", area, topic_segment, job_id)
    }

    /// Resource path of a finished job in the history area
    pub fn storage_path(&self, topic: &str, job_id: &str, success: bool) -> String {
        let area = if success {
            &self.stored_successful_jobs_path
        } else {
            &self.stored_cancelled_jobs_path
        };
        format!("{}/{}/{}", area, topic::flatten(topic), job_id)
    }

    /// Lock record guarding a unique job name
    ///
    /// `%` and `/` are percent-encoded so distinct names never share a lock.
    pub fn lock_path(&self, topic: &str, name: &str) -> String {
        let mut encoded = String::with_capacity(name.len());
        for c in name.chars() {
            match c {
                '%' => encoded.push_str("%25"),
                '/' => encoded.push_str("%2F"),
                c => encoded.push(c),
            }
        }
        format!("{}/{}/{}", self.locks_path, topic::flatten(topic), encoded)
    }

    pub fn is_local_job(&self, path: &str) -> bool {
        has_prefix(path, &self.local_jobs_path)
    }

    pub fn is_unassigned_job(&self, path: &str) -> bool {
        has_prefix(path, &self.unassigned_jobs_path)
    }

    pub fn is_job(&self, path: &str) -> bool {
        has_prefix(path, &self.repository_path) && !self.is_lock(path)
    }

    pub fn is_lock(&self, path: &str) -> bool {
        has_prefix(path, &self.locks_path)
    }

    pub fn is_storage_path(&self, path: &str) -> bool {
        has_prefix(path, &self.stored_successful_jobs_path)
            || has_prefix(path, &self.stored_cancelled_jobs_path)
    }
}

/// Exact-prefix test on a path boundary
fn has_prefix(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .map_or(false, |rest| rest.starts_with('/'))
}

/// Year, month, day, hour and minute (UTC) of a timestamp
pub fn time_buckets(millis: i64) -> [i64; 5] {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(time) => [
            i64::from(time.year()),
            i64::from(time.month()),
            i64::from(time.day()),
            i64::from(time.hour()),
            i64::from(time.minute()),
        ],
        None => [1970, 1, 1, 0, 0],
    }
}
