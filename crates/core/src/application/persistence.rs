// Job record lifecycle against the resource store
use crate::application::configuration::JobManagerConfiguration;
use crate::domain::{keys, Job, JobState, PropertyMap, ResourceType};
use crate::error::{AppError, Result};
use crate::port::{PropertyUpdate, ResourceStore, TimeProvider};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reads and writes job records
///
/// Every multi-step transition is a sequence of single-record writes; each
/// step can be repeated safely.
pub struct JobPersistence {
    store: Arc<dyn ResourceStore>,
    configuration: Arc<JobManagerConfiguration>,
    time_provider: Arc<dyn TimeProvider>,
}

impl JobPersistence {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        configuration: Arc<JobManagerConfiguration>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            configuration,
            time_provider,
        }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn configuration(&self) -> &Arc<JobManagerConfiguration> {
        &self.configuration
    }

    pub fn now(&self) -> i64 {
        self.time_provider.now_millis()
    }

    pub async fn write_new(&self, job: &Job) -> Result<()> {
        self.store
            .create(&job.path, ResourceType::Job, &job.to_properties())
            .await?;
        debug!(job_id = %job.id, path = %job.path, "Job persisted");
        Ok(())
    }

    /// Record the start of an attempt; `false` means the record is gone
    pub async fn start_processing(&self, job: &mut Job, queue_name: &str) -> Result<bool> {
        let now = self.now();
        let update = PropertyUpdate::new()
            .set(keys::STARTED, now)
            .set(keys::QUEUE, queue_name);
        if !self.store.update(&job.path, &update).await? {
            info!(job_id = %job.id, path = %job.path, "Job record vanished before start");
            return Ok(false);
        }
        job.started_at = Some(now);
        job.queue_name = Some(queue_name.to_string());
        Ok(true)
    }

    /// Persist a retry; the job must already carry its bumped retry count
    pub async fn reschedule(&self, job: &mut Job, message: Option<String>) -> Result<bool> {
        let now = self.now();
        let mut update = PropertyUpdate::new()
            .set(keys::RETRY_COUNT, job.retry_count)
            .set(keys::QUEUED, now)
            .remove(keys::STARTED);
        if let Some(message) = &message {
            update = update.set(keys::RESULT_MESSAGE, message.as_str());
        }
        let updated = self.store.update(&job.path, &update).await?;
        job.started_at = None;
        job.queued_at = Some(now);
        if message.is_some() {
            job.result_message = message;
        }
        Ok(updated)
    }

    /// Terminal transition
    ///
    /// With `keep_history` the record is copied to the history area first.
    /// Returns the history copy when one was written.
    pub async fn finish(
        &self,
        job: &Job,
        state: JobState,
        keep_history: bool,
        processing_ms: Option<i64>,
    ) -> Result<Option<Job>> {
        let in_history = self.configuration.is_storage_path(&job.path);
        if !in_history && self.store.read(&job.path).await?.is_none() {
            // Removed while running; the removal already wrote the final state
            debug!(job_id = %job.id, state = %state, "Job record gone, skipping finish");
            return Ok(None);
        }

        let mut stored = None;
        if keep_history && !in_history {
            let now = self.now();
            let finished_at = match (state, job.started_at, processing_ms) {
                (JobState::Succeeded, Some(started), Some(duration)) => started + duration,
                _ => now,
            };
            let mut finished = job.clone();
            finished.path = self.configuration.storage_path(
                &job.topic,
                &job.id,
                state == JobState::Succeeded,
            );
            finished.finished_state = Some(state);
            finished.finished_at = Some(finished_at);

            let properties = finished.to_properties();
            match self
                .store
                .create(&finished.path, ResourceType::Job, &properties)
                .await
            {
                Err(AppError::Conflict(_)) => {
                    // A retried finish left an older copy behind
                    self.store.delete(&finished.path).await?;
                    self.store
                        .create(&finished.path, ResourceType::Job, &properties)
                        .await?;
                }
                other => other?,
            }
            stored = Some(finished);
        }

        self.store.delete(&job.path).await?;
        if let Some(name) = &job.name {
            self.store
                .delete(&self.configuration.lock_path(&job.topic, name))
                .await?;
        }
        info!(
            job_id = %job.id,
            topic = %job.topic,
            state = %state,
            kept = stored.is_some(),
            "Job finished"
        );
        Ok(stored)
    }

    /// Move an active record to another owner (or to `unassigned`)
    pub async fn reassign(&self, job: &Job, target: Option<&str>) -> Result<Job> {
        let path = self
            .configuration
            .unique_path(target, &job.topic, &job.id, &job.properties);
        if path == job.path {
            return Ok(job.clone());
        }

        let mut moved = job.clone();
        moved.path = path;
        moved.target_instance = target.map(str::to_string);
        moved.started_at = None;
        moved.queue_name = None;

        match self
            .store
            .create(&moved.path, ResourceType::Job, &moved.to_properties())
            .await
        {
            Err(AppError::Conflict(_)) => {
                debug!(job_id = %job.id, path = %moved.path, "Job already at new owner");
            }
            other => other?,
        }
        self.store.delete(&job.path).await?;
        info!(
            job_id = %job.id,
            target = target.unwrap_or("<unassigned>"),
            "Job reassigned"
        );
        Ok(moved)
    }

    /// Read one job record
    ///
    /// Records missing their identity are deleted. Records with read errors
    /// are returned as-is; callers defer them.
    pub async fn read_job(&self, path: &str) -> Result<Option<Job>> {
        let Some(resource) = self.store.read(path).await? else {
            return Ok(None);
        };
        if resource.resource_type != ResourceType::Job {
            return Ok(None);
        }
        match Job::from_resource(&resource) {
            Ok(job) => Ok(Some(job)),
            Err(e) if resource.has_read_errors() => {
                debug!(path = %path, error = %e, "Job record not readable yet");
                Ok(None)
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Discarding invalid job record");
                self.store.delete(path).await?;
                Ok(None)
            }
        }
    }

    /// Take the unique-name lock; `false` if another job holds it
    pub async fn lock(&self, topic: &str, name: &str) -> Result<bool> {
        let mut properties = PropertyMap::new();
        properties.insert(keys::LOCK_CREATED.into(), Value::from(self.now()));
        properties.insert(
            keys::LOCK_CREATED_INSTANCE.into(),
            Value::from(self.configuration.instance_id()),
        );
        match self
            .store
            .create(
                &self.configuration.lock_path(topic, name),
                ResourceType::Lock,
                &properties,
            )
            .await
        {
            Ok(()) => Ok(true),
            Err(AppError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn unlock(&self, topic: &str, name: &str) -> Result<()> {
        self.store
            .delete(&self.configuration.lock_path(topic, name))
            .await?;
        Ok(())
    }

    /// Delete a record outright
    pub async fn remove(&self, job: &Job) -> Result<bool> {
        self.store.delete(&job.path).await
    }
}
