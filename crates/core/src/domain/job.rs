// Job Domain Model

use crate::domain::error::DomainError;
use crate::domain::resource::{PropertyMap, Resource, ResourceType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Unique identifier (time-bucketed, instance-salted)
pub type JobId = String;

/// User supplied job properties
pub type JobProperties = PropertyMap;

/// Reserved property keys of a stored job record
pub mod keys {
    pub const JOB_ID: &str = "eventjobs:jobId";
    pub const TOPIC: &str = "event.job.topic";
    pub const NAME: &str = "event.job.name";
    pub const QUEUE: &str = "event.job.queue";
    pub const RETRY_COUNT: &str = "event.job.retrycount";
    pub const RETRIES: &str = "event.job.retries";
    pub const CREATED: &str = "event.job.created";
    pub const QUEUED: &str = "event.job.queued.time";
    pub const STARTED: &str = "event.job.started.time";
    pub const CREATED_INSTANCE: &str = "event.job.created.instance";
    pub const TARGET_INSTANCE: &str = "event.job.target.instance";
    pub const FINISHED_STATE: &str = "eventjobs:finishedState";
    pub const FINISHED_DATE: &str = "eventjobs:finishedDate";
    pub const RESULT_MESSAGE: &str = "event.job.resultMessage";

    // Keys a submitter may set
    pub const QUEUE_NAME: &str = "event.job.queuename";
    pub const QUEUE_ORDERED: &str = "event.job.queueordered";
    pub const PARALLEL: &str = "event.job.parallel";
    pub const RETRY_DELAY: &str = "event.job.retrydelay";
    pub const BRIDGED: &str = "event.job.bridged";

    // Lock records
    pub const LOCK_CREATED: &str = "eventjobs:lockCreated";
    pub const LOCK_CREATED_INSTANCE: &str = "eventjobs:lockInstance";

    /// Keys owned by the engine (never part of the user property map)
    pub const ENGINE_KEYS: &[&str] = &[
        JOB_ID,
        TOPIC,
        NAME,
        QUEUE,
        RETRY_COUNT,
        RETRIES,
        CREATED,
        QUEUED,
        STARTED,
        CREATED_INSTANCE,
        TARGET_INSTANCE,
        FINISHED_STATE,
        FINISHED_DATE,
        RESULT_MESSAGE,
    ];
}

/// Lifecycle state; the last six are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Active,
    Succeeded,
    Stopped,
    GivenUp,
    Error,
    Dropped,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Active => "ACTIVE",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Stopped => "STOPPED",
            JobState::GivenUp => "GIVEN_UP",
            JobState::Error => "ERROR",
            JobState::Dropped => "DROPPED",
            JobState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, JobState::Queued | JobState::Active)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobState::Queued),
            "ACTIVE" => Ok(JobState::Active),
            "SUCCEEDED" => Ok(JobState::Succeeded),
            "STOPPED" => Ok(JobState::Stopped),
            "GIVEN_UP" => Ok(JobState::GivenUp),
            "ERROR" => Ok(JobState::Error),
            "DROPPED" => Ok(JobState::Dropped),
            "CANCELLED" => Ok(JobState::Cancelled),
            other => Err(DomainError::UnknownState(other.to_string())),
        }
    }
}

/// A persisted unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub topic: String,
    pub name: Option<String>,
    /// Resource path; stable until the job moves to history
    pub path: String,
    pub queue_name: Option<String>,
    pub created_at: i64,
    pub created_instance: Option<String>,
    /// `None` means unassigned (claimable by any capable instance)
    pub target_instance: Option<String>,
    pub retry_count: i32,
    /// `-1` means unlimited
    pub max_retries: i32,
    pub queued_at: Option<i64>,
    pub started_at: Option<i64>,
    pub finished_state: Option<JobState>,
    pub finished_at: Option<i64>,
    pub result_message: Option<String>,
    pub properties: JobProperties,
    #[serde(skip)]
    pub read_errors: Vec<String>,
}

impl Job {
    /// Current lifecycle state derived from the timestamps
    pub fn state(&self) -> JobState {
        match (self.finished_state, self.started_at) {
            (Some(state), _) => state,
            (None, Some(_)) => JobState::Active,
            (None, None) => JobState::Queued,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_state.is_some()
    }

    pub fn is_bridged(&self) -> bool {
        is_bridged(&self.properties)
    }

    pub fn has_read_errors(&self) -> bool {
        !self.read_errors.is_empty()
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Retry delay requested through the job properties
    pub fn retry_delay_override(&self) -> Option<i64> {
        self.properties.get(keys::RETRY_DELAY).and_then(Value::as_i64)
    }

    /// Prepare for another attempt
    pub fn retry(&mut self) {
        self.retry_count += 1;
        self.started_at = None;
    }

    /// Build a job from its stored record
    pub fn from_resource(resource: &Resource) -> Result<Job, DomainError> {
        let invalid = |reason: &str| DomainError::InvalidJobRecord {
            path: resource.path.clone(),
            reason: reason.to_string(),
        };
        if resource.resource_type != ResourceType::Job {
            return Err(invalid("not a job resource"));
        }
        let id = resource.get_str(keys::JOB_ID).ok_or_else(|| invalid("missing id"))?;
        let topic = resource
            .get_str(keys::TOPIC)
            .ok_or_else(|| invalid("missing topic"))?;

        let finished_state = match resource.get_str(keys::FINISHED_STATE) {
            Some(state) => Some(state.parse::<JobState>()?),
            None => None,
        };

        let properties = resource
            .properties
            .iter()
            .filter(|(key, _)| !keys::ENGINE_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Job {
            id: id.to_string(),
            topic: topic.to_string(),
            name: resource.get_str(keys::NAME).map(str::to_string),
            path: resource.path.clone(),
            queue_name: resource.get_str(keys::QUEUE).map(str::to_string),
            created_at: resource.get_i64(keys::CREATED).unwrap_or_default(),
            created_instance: resource.get_str(keys::CREATED_INSTANCE).map(str::to_string),
            target_instance: resource.get_str(keys::TARGET_INSTANCE).map(str::to_string),
            retry_count: resource.get_i64(keys::RETRY_COUNT).unwrap_or(0) as i32,
            max_retries: resource.get_i64(keys::RETRIES).unwrap_or(0) as i32,
            queued_at: resource.get_i64(keys::QUEUED),
            started_at: resource.get_i64(keys::STARTED),
            finished_state,
            finished_at: resource.get_i64(keys::FINISHED_DATE),
            result_message: resource.get_str(keys::RESULT_MESSAGE).map(str::to_string),
            properties,
            read_errors: resource.read_errors.clone(),
        })
    }

    /// Full stored property map (user properties plus engine keys)
    pub fn to_properties(&self) -> PropertyMap {
        let mut map = self.properties.clone();
        map.insert(keys::JOB_ID.into(), Value::from(self.id.clone()));
        map.insert(keys::TOPIC.into(), Value::from(self.topic.clone()));
        map.insert(keys::CREATED.into(), Value::from(self.created_at));
        map.insert(keys::RETRY_COUNT.into(), Value::from(self.retry_count));
        map.insert(keys::RETRIES.into(), Value::from(self.max_retries));

        let optional_strings = [
            (keys::NAME, &self.name),
            (keys::QUEUE, &self.queue_name),
            (keys::CREATED_INSTANCE, &self.created_instance),
            (keys::TARGET_INSTANCE, &self.target_instance),
            (keys::RESULT_MESSAGE, &self.result_message),
        ];
        for (key, value) in optional_strings {
            if let Some(value) = value {
                map.insert(key.into(), Value::from(value.clone()));
            }
        }
        let optional_times = [
            (keys::QUEUED, self.queued_at),
            (keys::STARTED, self.started_at),
            (keys::FINISHED_DATE, self.finished_at),
        ];
        for (key, value) in optional_times {
            if let Some(value) = value {
                map.insert(key.into(), Value::from(value));
            }
        }
        if let Some(state) = self.finished_state {
            map.insert(keys::FINISHED_STATE.into(), Value::from(state.as_str()));
        }
        map
    }
}

/// Bridged legacy events carry a truthy marker property
pub fn is_bridged(properties: &PropertyMap) -> bool {
    match properties.get(keys::BRIDGED) {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}
