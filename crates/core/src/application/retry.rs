// Retry policy for failed job attempts
use crate::domain::{Job, QueueConfig};
use tracing::{info, warn};

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue the job after the delay (ms)
    Retry(i64),
    /// Retries exhausted; the job is GIVEN_UP
    GiveUp,
}

/// Retry policy
///
/// A failed attempt counts against the job's retry limit (`-1` =
/// unlimited). The delay comes from the consumer result, then the job's
/// `event.job.retrydelay` property, then the queue configuration.
pub struct RetryPolicy;

impl RetryPolicy {
    /// Decide what happens after a failed attempt
    pub fn should_retry(
        job: &Job,
        config: &QueueConfig,
        delay_override: Option<i64>,
    ) -> RetryDecision {
        let attempts = job.retry_count + 1;
        if job.max_retries != -1 && attempts > job.max_retries {
            warn!(
                job_id = %job.id,
                retry_count = job.retry_count,
                max_retries = job.max_retries,
                "Retries exhausted"
            );
            return RetryDecision::GiveUp;
        }

        let delay_ms = Self::retry_delay(job, config, delay_override);
        info!(
            job_id = %job.id,
            attempt = attempts,
            max_retries = job.max_retries,
            delay_ms = delay_ms,
            "Scheduling retry"
        );
        RetryDecision::Retry(delay_ms)
    }

    /// Effective retry delay in ms
    pub fn retry_delay(job: &Job, config: &QueueConfig, delay_override: Option<i64>) -> i64 {
        delay_override
            .or_else(|| job.retry_delay_override())
            .unwrap_or(config.retry_delay_ms)
            .max(0)
    }

    /// Prepare a job for retry (bump retry count, clear started time)
    pub fn prepare_for_retry(job: &mut Job) {
        job.retry();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{keys, JobProperties, QueueType};
    use serde_json::json;

    fn job(retry_count: i32, max_retries: i32) -> Job {
        Job {
            id: "j".into(),
            topic: "t".into(),
            name: None,
            path: "/jobs/t/j".into(),
            queue_name: None,
            created_at: 0,
            created_instance: None,
            target_instance: None,
            retry_count,
            max_retries,
            queued_at: None,
            started_at: Some(1),
            finished_state: None,
            finished_at: None,
            result_message: None,
            properties: JobProperties::new(),
            read_errors: vec![],
        }
    }

    #[test]
    fn test_exhaustion_after_max_retries() {
        let config = QueueConfig::new("q", QueueType::Unordered, &["t"]);
        assert_eq!(
            RetryPolicy::should_retry(&job(0, 2), &config, None),
            RetryDecision::Retry(config.retry_delay_ms)
        );
        assert!(matches!(
            RetryPolicy::should_retry(&job(1, 2), &config, None),
            RetryDecision::Retry(_)
        ));
        assert_eq!(
            RetryPolicy::should_retry(&job(2, 2), &config, None),
            RetryDecision::GiveUp
        );
        assert!(matches!(
            RetryPolicy::should_retry(&job(500, -1), &config, None),
            RetryDecision::Retry(_)
        ));
    }

    #[test]
    fn test_delay_precedence() {
        let config = QueueConfig::new("q", QueueType::Unordered, &["t"]);
        let mut job = job(0, 5);
        assert_eq!(RetryPolicy::retry_delay(&job, &config, None), 2000);

        job.properties.insert(keys::RETRY_DELAY.into(), json!(300));
        assert_eq!(RetryPolicy::retry_delay(&job, &config, None), 300);
        assert_eq!(RetryPolicy::retry_delay(&job, &config, Some(7)), 7);
    }

    #[test]
    fn test_prepare_for_retry() {
        let mut job = job(1, 5);
        RetryPolicy::prepare_for_retry(&mut job);
        assert_eq!(job.retry_count, 2);
        assert!(job.started_at.is_none());
    }
}
