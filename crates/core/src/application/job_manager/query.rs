// Job lookups, removal, stop and retry
use super::JobManager;
use crate::application::notification::NotificationKind;
use crate::application::queue::JobQueue;
use crate::application::worker::constants::{FORCE_REMOVE_BACKOFF, FORCE_REMOVE_MAX_ATTEMPTS};
use crate::domain::{
    keys, Job, JobState, PropertyMap, Predicate, QueryType, Resource, ResourceType, SortOrder,
    Template,
};
use crate::error::Result;
use crate::port::StoreQuery;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl JobManager {
    /// Find jobs
    ///
    /// Templates are OR'ed; the keys of one template are AND'ed and may carry
    /// an operator prefix. A `limit` below one means no limit. Unfinished
    /// queries are ordered by creation, history queries newest finish first.
    pub async fn find_jobs(
        &self,
        query_type: QueryType,
        topic: Option<&str>,
        limit: i64,
        templates: &[PropertyMap],
    ) -> Vec<Job> {
        let mut query = StoreQuery::new(self.configuration.repository_path())
            .of_type(ResourceType::Job);
        if let Some(topic) = topic {
            query = query.filter(Predicate::Equals(
                keys::TOPIC.to_string(),
                Value::from(topic),
            ));
        }

        let finished = keys::FINISHED_STATE.to_string();
        query = match query_type {
            QueryType::All => query,
            QueryType::Active => query
                .filter(Predicate::Exists(keys::STARTED.to_string()))
                .filter(Predicate::Missing(finished)),
            QueryType::Queued => query
                .filter(Predicate::Missing(keys::STARTED.to_string()))
                .filter(Predicate::Missing(finished)),
            history => match history.finished_states() {
                Some(states) => query.filter(Predicate::OneOf(
                    finished,
                    states.iter().map(|s| Value::from(s.as_str())).collect(),
                )),
                None => query.filter(Predicate::Exists(finished)),
            },
        };

        let templates: Vec<Template> = templates
            .iter()
            .map(Template::from_properties)
            .filter(|t| !t.is_empty())
            .collect();
        if !templates.is_empty() {
            query = query.any_of(templates);
        }
        query = if query_type.is_history() {
            query.order_by(keys::FINISHED_DATE, SortOrder::Descending)
        } else {
            query.order_by(keys::CREATED, SortOrder::Ascending)
        };
        if limit > 0 {
            query = query.limit(limit as usize);
        }

        let resources = match self.run_query(&query).await {
            Ok(resources) => resources,
            Err(e) => {
                warn!(error = %e, "Job query failed");
                return Vec::new();
            }
        };
        resources
            .iter()
            .filter(|r| self.configuration.is_job(&r.path))
            .filter_map(|r| match Job::from_resource(r) {
                Ok(job) => Some(job),
                Err(e) => {
                    debug!(path = %r.path, error = %e, "Skipping unreadable job");
                    None
                }
            })
            .collect()
    }

    /// Indexed search, or a walk of the subtree when the store refuses it
    async fn run_query(&self, query: &StoreQuery) -> Result<Vec<Resource>> {
        let store = self.persistence.store();
        match store.query(query).await {
            Err(e) if e.is_unsupported() => {
                debug!(error = %e, "Search unsupported, walking the tree");
                let mut found = Vec::new();
                let mut pending = vec![query.path_prefix.clone()];
                while let Some(path) = pending.pop() {
                    for child in store.list_children(&path).await? {
                        if query.matches(&child) {
                            found.push(child.clone());
                        }
                        if child.resource_type == ResourceType::Folder {
                            pending.push(child.path);
                        }
                    }
                }
                query.arrange(&mut found);
                Ok(found)
            }
            other => other,
        }
    }

    pub async fn get_job_by_id(&self, job_id: &str) -> Option<Job> {
        let mut template = PropertyMap::new();
        template.insert(keys::JOB_ID.to_string(), Value::from(job_id));
        let job = self
            .find_jobs(QueryType::All, None, 1, &[template])
            .await
            .into_iter()
            .next();
        if job.is_none() {
            debug!(job_id = %job_id, "Job not found");
        }
        job
    }

    /// Job holding `name`, unfinished ones first
    pub async fn get_job_by_name(&self, name: &str) -> Option<Job> {
        let mut template = PropertyMap::new();
        template.insert(keys::NAME.to_string(), Value::from(name));
        let jobs = self
            .find_jobs(QueryType::All, None, -1, std::slice::from_ref(&template))
            .await;
        jobs.iter()
            .find(|job| !job.is_finished())
            .or_else(|| jobs.first())
            .cloned()
    }

    /// First job of `topic` matching `template`
    pub async fn get_job(&self, topic: &str, template: Option<PropertyMap>) -> Option<Job> {
        let templates: Vec<PropertyMap> = template.into_iter().collect();
        self.find_jobs(QueryType::All, Some(topic), 1, &templates)
            .await
            .into_iter()
            .next()
    }

    /// Remove a job that is not running
    ///
    /// History records are deleted, active records move to history as
    /// DROPPED. Returns `false` for a running job or a store failure; an
    /// unknown id counts as removed.
    pub async fn remove_job_by_id(&self, job_id: &str) -> bool {
        self.remove_job(job_id, false).await
    }

    /// Remove a job even while it runs, retrying store failures
    pub async fn force_remove_job(&self, job_id: &str) -> bool {
        for attempt in 1..=FORCE_REMOVE_MAX_ATTEMPTS {
            if self.remove_job(job_id, true).await {
                return true;
            }
            debug!(job_id = %job_id, attempt = attempt, "Forced removal failed, retrying");
            tokio::time::sleep(FORCE_REMOVE_BACKOFF).await;
        }
        error!(
            job_id = %job_id,
            attempts = FORCE_REMOVE_MAX_ATTEMPTS,
            "Giving up forced removal"
        );
        false
    }

    async fn remove_job(&self, job_id: &str, force: bool) -> bool {
        let Some(job) = self.get_job_by_id(job_id).await else {
            debug!(job_id = %job_id, "Job for removal does not exist (anymore)");
            return true;
        };
        if !force && job.started_at.is_some() && !job.is_finished() {
            debug!(job_id = %job_id, "Unable to remove job - job is started");
            return false;
        }

        let now = self.time_provider.now_millis();
        if self.configuration.is_storage_path(&job.path) {
            if let Err(e) = self.persistence.remove(&job).await {
                warn!(job_id = %job_id, error = %e, "Unable to remove job");
                return false;
            }
            info!(job_id = %job_id, "Removed history job");
            self.events.emit(NotificationKind::Removed, &job, None, now);
            return true;
        }

        for queue in self.all_queues() {
            queue.remove_waiting(job_id);
            if force {
                queue.stop_job(job_id);
            }
        }
        match self
            .persistence
            .finish(&job, JobState::Dropped, true, None)
            .await
        {
            Ok(_) => {
                info!(job_id = %job_id, "Removed job");
                self.events.emit(NotificationKind::Removed, &job, None, now);
                true
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Unable to remove job");
                false
            }
        }
    }

    /// Stop a job
    ///
    /// A running job is signalled cooperatively; anything else that is still
    /// active is finished as STOPPED right away.
    pub async fn stop_job_by_id(&self, job_id: &str) {
        let Some(job) = self.get_job_by_id(job_id).await else {
            return;
        };
        if self.configuration.is_storage_path(&job.path) {
            return;
        }

        let mut signalled = false;
        for queue in self.all_queues() {
            signalled |= queue.stop_job(job_id);
        }
        if signalled {
            return;
        }

        for queue in self.all_queues() {
            queue.remove_waiting(job_id);
        }
        info!(job_id = %job_id, "Job not running, finishing as stopped");
        match self
            .persistence
            .finish(&job, JobState::Stopped, true, None)
            .await
        {
            Ok(_) => {
                let now = self.time_provider.now_millis();
                self.events.emit(NotificationKind::Cancelled, &job, None, now);
            }
            Err(e) => error!(job_id = %job_id, error = %e, "Unable to stop job"),
        }
    }

    /// Re-submit a finished job with the same topic, name and properties
    pub async fn retry_job_by_id(&self, job_id: &str) -> Option<Job> {
        let job = self.get_job_by_id(job_id).await?;
        if !self.configuration.is_storage_path(&job.path) {
            return None;
        }
        if !self.force_remove_job(job_id).await {
            return None;
        }
        let mut errors = Vec::new();
        let retried = self
            .add_job(
                Some(&job.topic),
                job.name.as_deref(),
                Some(job.properties.clone()),
                &mut errors,
            )
            .await;
        if retried.is_none() {
            warn!(job_id = %job_id, errors = ?errors, "Unable to retry job");
        }
        retried
    }

    fn all_queues(&self) -> Vec<Arc<JobQueue>> {
        self.lock_queues().values().cloned().collect()
    }
}
