// Job submission
use super::JobManager;
use crate::application::notification::NotificationKind;
use crate::domain::{keys, topic, Job, JobProperties, QueueType};
use crate::error::Result;
use serde_json::Value;
use tracing::{debug, info, warn};

enum Submission {
    Created(Job),
    /// DROP queue; nothing stored
    Dropped,
    /// Another job already holds the name
    Duplicate,
}

/// Fluent submission of one job
pub struct JobBuilder<'a> {
    manager: &'a JobManager,
    topic: String,
    name: Option<String>,
    properties: JobProperties,
}

impl<'a> JobBuilder<'a> {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn properties(mut self, properties: JobProperties) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Submit; validation and persistence problems come back as messages
    pub async fn add(self) -> std::result::Result<Job, Vec<String>> {
        let mut errors = Vec::new();
        match self
            .manager
            .add_job(
                Some(&self.topic),
                self.name.as_deref(),
                Some(self.properties),
                &mut errors,
            )
            .await
        {
            Some(job) => Ok(job),
            None => Err(errors),
        }
    }
}

impl JobManager {
    pub fn create_job(&self, topic: impl Into<String>) -> JobBuilder<'_> {
        JobBuilder {
            manager: self,
            topic: topic.into(),
            name: None,
            properties: JobProperties::new(),
        }
    }

    /// Submit a job
    ///
    /// Returns `None` when the job is rejected, dropped by its queue or could
    /// not be stored; rejections and storage failures append a message to
    /// `errors`. A duplicate name returns the job already holding it, or
    /// `None` plus a message when that job cannot be found.
    pub async fn add_job(
        &self,
        topic: Option<&str>,
        name: Option<&str>,
        properties: Option<JobProperties>,
        errors: &mut Vec<String>,
    ) -> Option<Job> {
        let mut properties = properties.unwrap_or_default();
        let topic = match check_job(topic, &properties) {
            Ok(topic) => topic,
            Err(message) => {
                warn!(reason = %message, "Job rejected");
                errors.push(message);
                return None;
            }
        };
        // Engine-owned keys cannot be supplied by callers
        properties.retain(|key, _| !keys::ENGINE_KEYS.contains(&key.as_str()));

        match self.add_job_internal(topic, name, properties).await {
            Ok(Submission::Created(job)) => Some(job),
            Ok(Submission::Dropped) => None,
            Ok(Submission::Duplicate) => {
                let name = name.unwrap_or_default();
                let existing = self.get_job_by_name(name).await;
                if existing.is_none() {
                    warn!(topic = %topic, name = %name, "Name is locked but no job holds it");
                    errors.push(format!("Job name '{}' is locked by an unknown job.", name));
                }
                existing
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Unable to persist new job");
                errors.push("Unable to persist new job.".to_string());
                None
            }
        }
    }

    async fn add_job_internal(
        &self,
        topic: &str,
        name: Option<&str>,
        properties: JobProperties,
    ) -> Result<Submission> {
        let info = self.queue_info(topic, &properties);
        let now = self.time_provider.now_millis();

        if info.config.queue_type == QueueType::Drop {
            let job = self.new_job(topic, name, properties, None, info.config.retries, now);
            info!(topic = %topic, queue = %info.queue_name, "Dropping job");
            self.events
                .emit(NotificationKind::Cancelled, &job, None, now);
            return Ok(Submission::Dropped);
        }

        if let Some(name) = name {
            if !self.persistence.lock(topic, name).await? {
                debug!(topic = %topic, name = %name, "Discarding duplicate job");
                return Ok(Submission::Duplicate);
            }
        }

        let target = self
            .capabilities()
            .and_then(|caps| caps.detect_target(topic, &properties, &info));
        let mut job = self.new_job(topic, name, properties, target, info.config.retries, now);
        job.queue_name = Some(info.queue_name.clone());

        if let Err(e) = self.persistence.write_new(&job).await {
            if let Some(name) = name {
                if let Err(unlock) = self.persistence.unlock(topic, name).await {
                    debug!(name = %name, error = %unlock, "Unable to release name lock");
                }
            }
            return Err(e);
        }
        info!(
            job_id = %job.id,
            topic = %job.topic,
            queue = %info.queue_name,
            target = job.target_instance.as_deref().unwrap_or("<unassigned>"),
            "Job added"
        );

        if job.target_instance.as_deref() == Some(self.instance_id()) {
            self.loader.add_job(job.clone());
        }
        Ok(Submission::Created(job))
    }

    fn new_job(
        &self,
        topic: &str,
        name: Option<&str>,
        properties: JobProperties,
        target: Option<String>,
        max_retries: i32,
        now: i64,
    ) -> Job {
        let id = self.configuration.unique_id(topic);
        Job {
            path: self
                .configuration
                .unique_path(target.as_deref(), topic, &id, &properties),
            id,
            topic: topic.to_string(),
            name: name.map(str::to_string),
            queue_name: None,
            created_at: now,
            created_instance: Some(self.instance_id().to_string()),
            target_instance: target,
            retry_count: 0,
            max_retries,
            queued_at: Some(now),
            started_at: None,
            finished_state: None,
            finished_at: None,
            result_message: None,
            properties,
            read_errors: Vec::new(),
        }
    }
}

/// Validate a submission; returns the topic or a message for the caller
fn check_job<'t>(
    topic: Option<&'t str>,
    properties: &JobProperties,
) -> std::result::Result<&'t str, String> {
    let topic = topic.ok_or_else(|| "Job topic is missing".to_string())?;
    topic::validate(topic)
        .map_err(|e| format!("Discarding job - topic is not valid: {} ({})", topic, e))?;
    if let Some((key, _)) = properties.iter().find(|(_, value)| value.is_null()) {
        return Err(format!(
            "Discarding job - property '{}' has no storable value",
            key
        ));
    }
    Ok(topic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_check_job_messages() {
        let empty = JobProperties::new();
        assert_eq!(check_job(None, &empty), Err("Job topic is missing".to_string()));
        assert!(check_job(Some("a//b"), &empty)
            .unwrap_err()
            .starts_with("Discarding job - topic is not valid"));
        assert_eq!(check_job(Some("a/b"), &empty), Ok("a/b"));

        let mut properties = JobProperties::new();
        properties.insert("payload".into(), json!(null));
        assert!(check_job(Some("a/b"), &properties)
            .unwrap_err()
            .contains("payload"));
    }
}
