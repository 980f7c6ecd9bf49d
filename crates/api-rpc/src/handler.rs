//! RPC Method Handlers
//!
//! Thin adapters from JSON-RPC parameters to `JobManager` calls.

use crate::error::{job_not_found, rejected, to_rpc_error};
use crate::types::{
    AddJobRequest, AddJobResponse, FindJobsRequest, FindJobsResponse, JobIdRequest, JobInfo,
    QueuesResponse, RemoveJobRequest, RemoveJobResponse, StatsResponse, StopJobResponse,
    TopologyResponse,
};
use eventjobs_core::application::JobManager;
use eventjobs_core::error::AppError;
use jsonrpsee::types::ErrorObjectOwned;
use std::sync::Arc;
use tracing::info;

/// RPC Handler with injected dependencies
pub struct RpcHandler {
    manager: Arc<JobManager>,
    start_time: std::time::Instant,
}

impl RpcHandler {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self {
            manager,
            start_time: std::time::Instant::now(),
        }
    }

    /// jobs.add.v1
    pub async fn add_job(&self, params: AddJobRequest) -> Result<AddJobResponse, ErrorObjectOwned> {
        let mut errors = Vec::new();
        let job = self
            .manager
            .add_job(
                params.topic.as_deref(),
                params.name.as_deref(),
                params.properties,
                &mut errors,
            )
            .await;
        if !errors.is_empty() {
            return Err(rejected(errors));
        }
        Ok(AddJobResponse {
            job: job.map(JobInfo::from),
        })
    }

    /// jobs.get.v1
    pub async fn get_job(&self, params: JobIdRequest) -> Result<JobInfo, ErrorObjectOwned> {
        self.manager
            .get_job_by_id(&params.job_id)
            .await
            .map(JobInfo::from)
            .ok_or_else(|| job_not_found(&params.job_id))
    }

    /// jobs.find.v1
    pub async fn find_jobs(
        &self,
        params: FindJobsRequest,
    ) -> Result<FindJobsResponse, ErrorObjectOwned> {
        let jobs = self
            .manager
            .find_jobs(
                params.query_type,
                params.topic.as_deref(),
                params.limit,
                &params.templates,
            )
            .await;
        Ok(FindJobsResponse {
            jobs: jobs.into_iter().map(JobInfo::from).collect(),
        })
    }

    /// jobs.remove.v1
    pub async fn remove_job(
        &self,
        params: RemoveJobRequest,
    ) -> Result<RemoveJobResponse, ErrorObjectOwned> {
        let removed = if params.force {
            self.manager.force_remove_job(&params.job_id).await
        } else {
            self.manager.remove_job_by_id(&params.job_id).await
        };
        info!(job_id = %params.job_id, force = params.force, removed = removed, "RPC remove");
        Ok(RemoveJobResponse {
            job_id: params.job_id,
            removed,
        })
    }

    /// jobs.stop.v1
    pub async fn stop_job(&self, params: JobIdRequest) -> Result<StopJobResponse, ErrorObjectOwned> {
        if self.manager.get_job_by_id(&params.job_id).await.is_none() {
            return Err(job_not_found(&params.job_id));
        }
        self.manager.stop_job_by_id(&params.job_id).await;
        Ok(StopJobResponse {
            job_id: params.job_id,
            stop_requested: true,
        })
    }

    /// jobs.retry.v1
    pub async fn retry_job(&self, params: JobIdRequest) -> Result<JobInfo, ErrorObjectOwned> {
        let Some(job) = self.manager.get_job_by_id(&params.job_id).await else {
            return Err(job_not_found(&params.job_id));
        };
        if !job.is_finished() {
            return Err(to_rpc_error(AppError::InvalidState(format!(
                "Job {} is not finished",
                params.job_id
            ))));
        }
        self.manager
            .retry_job_by_id(&params.job_id)
            .await
            .map(JobInfo::from)
            .ok_or_else(|| rejected(vec![format!("Unable to retry job {}", params.job_id)]))
    }

    /// admin.stats.v1
    pub async fn stats(&self) -> Result<StatsResponse, ErrorObjectOwned> {
        let statistics = self.manager.statistics();
        Ok(StatsResponse {
            average_waiting_time_ms: statistics.average_waiting_time_ms(),
            average_processing_time_ms: statistics.average_processing_time_ms(),
            statistics,
            topics: self.manager.topic_statistics(),
            uptime_seconds: self.start_time.elapsed().as_secs() as i64,
        })
    }

    /// admin.queues.v1
    pub async fn queues(&self) -> Result<QueuesResponse, ErrorObjectOwned> {
        Ok(QueuesResponse {
            queues: self.manager.queue_states(),
        })
    }

    /// admin.topology.v1
    pub async fn topology(&self) -> Result<TopologyResponse, ErrorObjectOwned> {
        Ok(TopologyResponse {
            instance_id: self.manager.instance_id().to_string(),
            active: self.manager.capabilities().is_some(),
            leader: self.manager.is_leader(),
            instances: self.manager.topology_instances(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;
    use eventjobs_core::application::{EngineConfig, JobConsumerManager};
    use eventjobs_core::domain::{JobState, QueryType};
    use eventjobs_core::port::resource_store::mocks::InMemoryResourceStore;
    use eventjobs_core::port::SystemTimeProvider;
    use serde_json::json;

    fn handler() -> RpcHandler {
        let config = EngineConfig {
            instance_id: Some("local".into()),
            repository_path: "/jobs".into(),
            background_load_delay_secs: 0,
            ..Default::default()
        };
        let manager = JobManager::new(
            &config,
            Arc::new(InMemoryResourceStore::new()),
            Arc::new(JobConsumerManager::new(&["*".to_string()], &[])),
            Arc::new(SystemTimeProvider),
        )
        .unwrap();
        manager.spawn_standalone_topology();
        RpcHandler::new(manager)
    }

    fn add_request(topic: Option<&str>) -> AddJobRequest {
        AddJobRequest {
            topic: topic.map(str::to_string),
            name: None,
            properties: json!({"n": 1}).as_object().cloned(),
        }
    }

    #[tokio::test]
    async fn test_add_get_and_find() {
        let handler = handler();
        let added = handler.add_job(add_request(Some("a/b"))).await.unwrap();
        let job = added.job.unwrap();
        assert_eq!(job.state, JobState::Queued);

        let fetched = handler
            .get_job(JobIdRequest {
                job_id: job.job_id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(fetched.properties["n"], json!(1));

        let found = handler
            .find_jobs(FindJobsRequest {
                query_type: QueryType::Queued,
                topic: Some("a/b".into()),
                limit: -1,
                templates: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(found.jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_submission() {
        let handler = handler();
        let err = handler.add_job(add_request(None)).await.unwrap_err();
        assert_eq!(err.code(), code::REJECTED);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let handler = handler();
        let err = handler
            .get_job(JobIdRequest {
                job_id: "missing".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), code::NOT_FOUND);
        assert!(handler
            .stop_job(JobIdRequest {
                job_id: "missing".into()
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stop_then_retry() {
        let handler = handler();
        let job = handler
            .add_job(add_request(Some("a/b")))
            .await
            .unwrap()
            .job
            .unwrap();

        // Unfinished jobs cannot be retried
        let err = handler
            .retry_job(JobIdRequest {
                job_id: job.job_id.clone(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), code::CONFLICT);

        handler
            .stop_job(JobIdRequest {
                job_id: job.job_id.clone(),
            })
            .await
            .unwrap();
        let retried = handler
            .retry_job(JobIdRequest {
                job_id: job.job_id.clone(),
            })
            .await
            .unwrap();
        assert_ne!(retried.job_id, job.job_id);
        assert_eq!(retried.state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_admin_views() {
        let handler = handler();
        let topology = handler.topology().await.unwrap();
        assert_eq!(topology.instance_id, "local");
        assert!(topology.active);
        assert!(topology.leader);

        assert!(handler.queues().await.unwrap().queues.is_empty());
        assert_eq!(handler.stats().await.unwrap().statistics.finished_jobs, 0);
    }
}
