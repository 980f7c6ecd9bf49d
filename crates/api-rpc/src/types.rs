//! RPC Request/Response Types
//!
//! Defines the JSON-RPC method parameters and results.

use eventjobs_core::application::QueueStateInfo;
use eventjobs_core::domain::{
    Job, JobProperties, JobState, PropertyMap, QueryType, Statistics, TopicStatistics,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Job as reported to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub topic: String,
    pub name: Option<String>,
    pub state: JobState,
    pub queue: Option<String>,
    pub target_instance: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub result_message: Option<String>,
    pub properties: JobProperties,
}

impl From<Job> for JobInfo {
    fn from(job: Job) -> Self {
        Self {
            state: job.state(),
            job_id: job.id,
            topic: job.topic,
            name: job.name,
            queue: job.queue_name,
            target_instance: job.target_instance,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            result_message: job.result_message,
            properties: job.properties,
        }
    }
}

/// jobs.add.v1 - Submit a job
#[derive(Debug, Deserialize)]
pub struct AddJobRequest {
    pub topic: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub properties: Option<JobProperties>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddJobResponse {
    /// `None` when a DROP queue discarded the job
    pub job: Option<JobInfo>,
}

/// jobs.get.v1 / jobs.stop.v1 / jobs.retry.v1
#[derive(Debug, Deserialize)]
pub struct JobIdRequest {
    pub job_id: String,
}

/// jobs.find.v1 - Query jobs
#[derive(Debug, Deserialize)]
pub struct FindJobsRequest {
    #[serde(default = "default_query_type")]
    pub query_type: QueryType,
    #[serde(default)]
    pub topic: Option<String>,
    /// Below one means unlimited
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// OR'ed; keys may carry `<`, `<=`, `>`, `>=` or `=` prefixes
    #[serde(default)]
    pub templates: Vec<PropertyMap>,
}

fn default_query_type() -> QueryType {
    QueryType::All
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Clone, Serialize)]
pub struct FindJobsResponse {
    pub jobs: Vec<JobInfo>,
}

/// jobs.remove.v1 - Remove a job
#[derive(Debug, Deserialize)]
pub struct RemoveJobRequest {
    pub job_id: String,
    /// Also remove a running job
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveJobResponse {
    pub job_id: String,
    pub removed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopJobResponse {
    pub job_id: String,
    pub stop_requested: bool,
}

/// admin.stats.v1 - Engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub statistics: Statistics,
    pub average_waiting_time_ms: i64,
    pub average_processing_time_ms: i64,
    pub topics: Vec<TopicStatistics>,
    pub uptime_seconds: i64,
}

/// admin.queues.v1 - Live queues
#[derive(Debug, Clone, Serialize)]
pub struct QueuesResponse {
    pub queues: Vec<QueueStateInfo>,
}

/// admin.topology.v1 - Current topology snapshot
#[derive(Debug, Clone, Serialize)]
pub struct TopologyResponse {
    pub instance_id: String,
    /// False while processing is stopped
    pub active: bool,
    pub leader: bool,
    /// Instance id -> advertised topics
    pub instances: BTreeMap<String, Vec<String>>,
}
