// Periodic cleanup of the job manager
// Re-queues stuck jobs, evicts idle queues and lets the leader assign jobs

use crate::application::job_manager::JobManager;
use crate::application::worker::ShutdownToken;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Drives `JobManager::maintain` on a fixed period
pub struct CleanupScheduler {
    manager: Arc<JobManager>,
    period: Duration,
}

impl CleanupScheduler {
    /// Uses the configured cleanup period of the manager
    pub fn new(manager: Arc<JobManager>) -> Self {
        let period = manager.configuration().cleanup_period();
        Self::with_period(manager, period)
    }

    pub fn with_period(manager: Arc<JobManager>, period: Duration) -> Self {
        Self {
            manager,
            // interval() panics on zero
            period: period.max(Duration::from_millis(1)),
        }
    }

    /// Run until the token fires; spawn with `tokio::spawn`
    pub async fn run(self, mut shutdown: ShutdownToken) {
        info!(period_secs = self.period.as_secs(), "Cleanup scheduler started");

        let mut tick = interval(self.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    debug!("Running job manager cleanup");
                    self.manager.maintain().await;
                }
                _ = shutdown.wait() => {
                    info!("Cleanup scheduler stopped");
                    return;
                }
            }
        }
    }

    /// One cycle right away
    pub async fn run_now(&self) {
        self.manager.maintain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::config::EngineConfig;
    use crate::application::consumer_manager::JobConsumerManager;
    use crate::application::worker::shutdown_channel;
    use crate::port::consumer::mocks::MockConsumer;
    use crate::port::resource_store::mocks::InMemoryResourceStore;
    use crate::port::SystemTimeProvider;

    fn manager() -> (Arc<JobManager>, Arc<MockConsumer>) {
        let config = EngineConfig {
            instance_id: Some("local".into()),
            repository_path: "/jobs".into(),
            background_load_delay_secs: 0,
            ..Default::default()
        };
        let consumers = Arc::new(JobConsumerManager::new(&["*".to_string()], &[]));
        let consumer = Arc::new(MockConsumer::new_success());
        consumers.bind(&["a/b"], 0, consumer.clone());
        let manager = JobManager::new(
            &config,
            Arc::new(InMemoryResourceStore::new()),
            consumers,
            Arc::new(SystemTimeProvider),
        )
        .unwrap();
        (manager, consumer)
    }

    #[tokio::test]
    async fn test_scheduler_evicts_idle_queue_and_stops() {
        let (manager, consumer) = manager();
        manager.spawn_standalone_topology();
        manager.create_job("a/b").add().await.unwrap();
        for _ in 0..500 {
            if consumer.call_count() == 1 && !manager.queue_names().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.queue_names().len(), 1);

        let (tx, token) = shutdown_channel();
        let scheduler = CleanupScheduler::with_period(manager.clone(), Duration::from_millis(5));
        let handle = tokio::spawn(scheduler.run(token));
        for _ in 0..500 {
            if manager.queue_names().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.queue_names().is_empty());

        tx.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
