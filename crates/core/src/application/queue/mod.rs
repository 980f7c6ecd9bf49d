//! Job queues.
//!
//! A queue owns a buffer of waiting jobs and one dispatcher task. ORDERED
//! queues run one job at a time and retry in place, so a failing job keeps
//! its position. UNORDERED and TOPIC_ROUND_ROBIN queues hand each job to its
//! own task, bounded by a semaphore of `max_parallel` permits; the
//! round-robin variant only differs in its buffer.
//!
//! Jobs finish in one of four ways: stored with a terminal state, put back
//! for a retry, handed back to the manager for reassignment, or left in the
//! store untouched (the next load pass picks them up).

mod buffer;
mod handler;

pub use buffer::{FifoBuffer, JobBuffer, TopicRoundRobinBuffer};
pub use handler::JobHandler;

use crate::application::consumer_manager::JobConsumerManager;
use crate::application::notification::{JobEvents, NotificationKind};
use crate::application::persistence::JobPersistence;
use crate::application::retry::{RetryDecision, RetryPolicy};
use crate::application::worker::constants::{
    MAX_SUSPEND_MS, SUSPEND_POLL_INTERVAL, UNPROCESSED_JOB_TIMEOUT_MS,
};
use crate::application::worker::{
    classify_join_error, shutdown_channel, ShutdownSender, ShutdownToken, TaskFailure,
};
use crate::domain::{Job, JobId, JobState, QueueConfig, QueueType, Statistics};
use crate::port::{AsyncCompletion, JobExecutionContext, JobResult, TimeProvider};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

const NOT_SUSPENDED: i64 = -1;

/// Suffix counter for outdated queue names
static OUTDATED_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Takes back jobs that no local consumer can process
#[async_trait]
pub trait JobReassigner: Send + Sync {
    async fn reassign(&self, job: Job);
}

/// Collaborators shared by every queue
pub struct QueueServices {
    pub persistence: Arc<JobPersistence>,
    pub consumers: Arc<JobConsumerManager>,
    pub events: Arc<JobEvents>,
    pub time_provider: Arc<dyn TimeProvider>,
    pub reassigner: Weak<dyn JobReassigner>,
}

/// How one dispatch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Terminal state written (or the record vanished)
    Finished,
    /// Put back after the delay (ms)
    Reschedule(i64),
    /// Left for the manager or the next load pass
    Discarded,
    /// Start could not be recorded; the unprocessed check re-queues it
    Pending,
}

/// Point-in-time view for admin surfaces
#[derive(Debug, Clone, Serialize)]
pub struct QueueStateInfo {
    pub name: String,
    pub queue_type: QueueType,
    pub running: bool,
    pub suspended: bool,
    pub outdated: bool,
    pub waiting: usize,
    pub processing: usize,
    pub async_jobs: usize,
    pub statistics: Statistics,
}

pub struct JobQueue {
    name: RwLock<String>,
    config: Arc<QueueConfig>,
    services: Arc<QueueServices>,
    buffer: Mutex<Box<dyn JobBuffer>>,
    available: Notify,
    permits: Arc<Semaphore>,
    /// Dispatched jobs, started or not
    processing: Mutex<HashMap<JobId, Arc<JobHandler>>>,
    /// Every job held anywhere in this queue
    known: Mutex<HashSet<JobId>>,
    statistics: Mutex<Statistics>,
    running: AtomicBool,
    outdated: AtomicBool,
    close_marker: AtomicBool,
    suspended_since: AtomicI64,
    resumed: Notify,
    async_jobs: AtomicUsize,
    pending_retries: AtomicUsize,
    shutdown: ShutdownSender,
}

impl JobQueue {
    pub fn new(name: &str, config: Arc<QueueConfig>, services: Arc<QueueServices>) -> Arc<Self> {
        let buffer: Box<dyn JobBuffer> = match config.queue_type {
            QueueType::TopicRoundRobin => Box::new(TopicRoundRobinBuffer::default()),
            _ => Box::new(FifoBuffer::default()),
        };
        let (shutdown, _) = shutdown_channel();
        let now = services.time_provider.now_millis();
        Arc::new(Self {
            name: RwLock::new(name.to_string()),
            permits: Arc::new(Semaphore::new(config.effective_max_parallel())),
            config,
            services,
            buffer: Mutex::new(buffer),
            available: Notify::new(),
            processing: Mutex::new(HashMap::new()),
            known: Mutex::new(HashSet::new()),
            statistics: Mutex::new(Statistics::new(now)),
            running: AtomicBool::new(false),
            outdated: AtomicBool::new(false),
            close_marker: AtomicBool::new(false),
            suspended_since: AtomicI64::new(NOT_SUSPENDED),
            resumed: Notify::new(),
            async_jobs: AtomicUsize::new(0),
            pending_retries: AtomicUsize::new(0),
            shutdown,
        })
    }

    /// Spawn the dispatcher
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            queue = %self.name(),
            queue_type = self.config.queue_type.as_str(),
            max_parallel = self.config.effective_max_parallel(),
            "Starting job queue"
        );
        let queue = Arc::clone(self);
        let token = self.shutdown.token();
        if self.config.queue_type == QueueType::Ordered {
            tokio::spawn(async move { queue.run_ordered(token).await });
        } else {
            tokio::spawn(async move { queue.run_parallel(token).await });
        }
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn config(&self) -> &Arc<QueueConfig> {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_outdated(&self) -> bool {
        self.outdated.load(Ordering::Acquire)
    }

    pub fn statistics(&self) -> Statistics {
        self.statistics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn reset_statistics(&self) {
        let now = self.services.time_provider.now_millis();
        self.statistics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .reset(now);
    }

    pub fn state_info(&self) -> QueueStateInfo {
        QueueStateInfo {
            name: self.name(),
            queue_type: self.config.queue_type,
            running: self.is_running(),
            suspended: self.is_suspended(),
            outdated: self.is_outdated(),
            waiting: self.waiting(),
            processing: self.lock_processing().len(),
            async_jobs: self.async_jobs.load(Ordering::Acquire),
            statistics: self.statistics(),
        }
    }

    /// Accept a job; `false` if the queue is closed
    pub fn process(&self, job: Job) -> bool {
        if !self.is_running() {
            return false;
        }
        self.close_marker.store(false, Ordering::Release);
        if !self.lock_known().insert(job.id.clone()) {
            debug!(job_id = %job.id, queue = %self.name(), "Job already queued");
            return true;
        }
        self.enqueue(JobHandler::new(job));
        true
    }

    fn enqueue(&self, handler: Arc<JobHandler>) {
        handler.clear_dispatched();
        self.update_statistics(Statistics::job_queued);
        self.lock_buffer().push(handler);
        self.available.notify_one();
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lock_known().contains(job_id)
    }

    /// Request a stop of a running job; `false` if it is not running here
    pub fn stop_job(&self, job_id: &str) -> bool {
        match self.lock_processing().get(job_id) {
            Some(handler) => {
                info!(job_id = %job_id, queue = %self.name(), "Stopping job");
                handler.stop();
                true
            }
            None => false,
        }
    }

    /// Take a waiting job out of the queue
    pub fn remove_waiting(&self, job_id: &str) -> Option<Job> {
        let handler = self.lock_buffer().remove(job_id)?;
        self.forget(job_id);
        self.update_statistics(Statistics::job_dequeued);
        Some(handler.job())
    }

    /// Forget all waiting jobs; their records stay for the next load pass
    pub fn clear(&self) {
        let drained = self.lock_buffer().drain();
        for handler in &drained {
            self.forget(&handler.id());
        }
        self.update_statistics(Statistics::clear_queued);
        debug!(queue = %self.name(), cleared = drained.len(), "Queue cleared");
    }

    /// Cancel every waiting job
    pub async fn remove_all(&self) -> usize {
        let was_suspended = self.is_suspended();
        self.suspend();
        let drained = self.lock_buffer().drain();
        self.update_statistics(Statistics::clear_queued);
        for handler in &drained {
            let job = handler.job();
            self.forget(&job.id);
            if let Err(e) = self
                .services
                .persistence
                .finish(&job, JobState::Cancelled, true, None)
                .await
            {
                error!(job_id = %job.id, error = %e, "Failed to cancel job");
            }
            self.emit(NotificationKind::Cancelled, &job, None);
        }
        if !was_suspended {
            self.resume();
        }
        drained.len()
    }

    pub fn suspend(&self) {
        let now = self.services.time_provider.now_millis();
        if self
            .suspended_since
            .compare_exchange(NOT_SUSPENDED, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(queue = %self.name(), "Queue suspended");
        }
    }

    pub fn resume(&self) {
        if self.suspended_since.swap(NOT_SUSPENDED, Ordering::AcqRel) != NOT_SUSPENDED {
            info!(queue = %self.name(), "Queue resumed");
            self.resumed.notify_waiters();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_since.load(Ordering::Acquire) != NOT_SUSPENDED
    }

    /// Stop dispatching; running consumers finish on their own
    pub fn close(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.resume();
        self.shutdown.shutdown();
        self.lock_processing().clear();
        info!(queue = %self.name(), "Stopped job queue");
    }

    fn can_be_closed(&self) -> bool {
        self.lock_buffer().is_empty()
            && self.lock_processing().is_empty()
            && !self.is_suspended()
            && self.async_jobs.load(Ordering::Acquire) == 0
            && self.pending_retries.load(Ordering::Acquire) == 0
    }

    /// Close if idle on two consecutive calls
    pub fn try_to_close(&self) -> bool {
        self.resume();
        if self.can_be_closed() {
            if self.close_marker.swap(true, Ordering::AcqRel) {
                self.close();
                return true;
            }
        } else {
            self.close_marker.store(false, Ordering::Release);
        }
        false
    }

    /// Rename so a fresh queue can take over the name; returns the new name
    pub fn outdate(&self) -> String {
        let mut name = self.name.write().unwrap_or_else(|p| p.into_inner());
        if !self.outdated.swap(true, Ordering::AcqRel) {
            let renamed = format!(
                "{}<outdated>({})",
                name,
                OUTDATED_COUNTER.fetch_add(1, Ordering::Relaxed)
            );
            info!(queue = %name, renamed = %renamed, "Outdating queue");
            *name = renamed;
        }
        name.clone()
    }

    /// Re-queue dispatched jobs whose start was never recorded
    pub fn check_for_unprocessed_jobs(&self) -> usize {
        if !self.is_running() {
            return 0;
        }
        let too_old = self.services.time_provider.now_millis() - UNPROCESSED_JOB_TIMEOUT_MS;
        let stale: Vec<Arc<JobHandler>> = {
            let mut processing = self.lock_processing();
            let ids: Vec<JobId> = processing
                .iter()
                .filter(|(_, handler)| {
                    handler.job().started_at.is_none()
                        && handler.dispatched_at().map_or(false, |at| at <= too_old)
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| processing.remove(id)).collect()
        };
        for handler in &stale {
            info!(job_id = %handler.id(), queue = %self.name(), "Start never recorded, requeueing job");
            self.enqueue(Arc::clone(handler));
        }
        stale.len()
    }

    fn waiting(&self) -> usize {
        self.lock_buffer().len()
    }

    async fn next_job(&self) -> Arc<JobHandler> {
        loop {
            let notified = self.available.notified();
            if let Some(handler) = self.lock_buffer().pop() {
                return handler;
            }
            notified.await;
        }
    }

    async fn wait_while_suspended(&self, token: &mut ShutdownToken) {
        loop {
            let since = self.suspended_since.load(Ordering::Acquire);
            if since == NOT_SUSPENDED {
                return;
            }
            if self.services.time_provider.now_millis() - since > MAX_SUSPEND_MS {
                self.resume();
                return;
            }
            tokio::select! {
                _ = self.resumed.notified() => {}
                _ = tokio::time::sleep(SUSPEND_POLL_INTERVAL) => {}
                _ = token.wait() => return,
            }
        }
    }

    async fn run_ordered(self: Arc<Self>, mut token: ShutdownToken) {
        loop {
            let handler = tokio::select! {
                handler = self.next_job() => handler,
                _ = token.wait() => break,
            };
            self.wait_while_suspended(&mut token).await;
            if token.is_shutdown() {
                self.lock_buffer().push(handler);
                break;
            }

            // Retries happen in place to keep the order
            while let JobOutcome::Reschedule(delay) = self.run_job(&handler, None).await {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay as u64)) => {}
                    _ = token.wait() => {
                        self.forget(&handler.id());
                        break;
                    }
                }
                if token.is_shutdown() {
                    break;
                }
                self.update_statistics(Statistics::job_queued);
            }
        }
        debug!(queue = %self.name(), "Ordered dispatcher stopped");
    }

    async fn run_parallel(self: Arc<Self>, mut token: ShutdownToken) {
        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = token.wait() => break,
            };
            let handler = tokio::select! {
                handler = self.next_job() => handler,
                _ = token.wait() => break,
            };
            self.wait_while_suspended(&mut token).await;
            if token.is_shutdown() {
                self.lock_buffer().push(handler);
                break;
            }

            let queue = Arc::clone(&self);
            tokio::spawn(async move {
                if let JobOutcome::Reschedule(delay) = queue.run_job(&handler, Some(permit)).await {
                    queue.schedule_retry(handler, delay);
                }
            });
        }
        debug!(queue = %self.name(), "Parallel dispatcher stopped");
    }

    fn schedule_retry(self: &Arc<Self>, handler: Arc<JobHandler>, delay_ms: i64) {
        self.pending_retries.fetch_add(1, Ordering::AcqRel);
        let queue = Arc::clone(self);
        let mut token = self.shutdown.token();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms as u64)) => {
                    queue.enqueue(handler);
                }
                _ = token.wait() => {
                    queue.forget(&handler.id());
                }
            }
            queue.pending_retries.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Dispatch one job and apply its result
    pub async fn run_job(
        &self,
        handler: &Arc<JobHandler>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> JobOutcome {
        let services = &self.services;
        let mut job = handler.job();
        let queue_name = self.name();

        let Some(registration) = services.consumers.executor_for(&job) else {
            debug!(job_id = %job.id, topic = %job.topic, "No local consumer, handing job back");
            self.forget(&job.id);
            self.update_statistics(Statistics::job_dequeued);
            if let Some(reassigner) = services.reassigner.upgrade() {
                reassigner.reassign(job).await;
            }
            return JobOutcome::Discarded;
        };

        handler.mark_dispatched(services.time_provider.now_millis());
        self.lock_processing().insert(job.id.clone(), Arc::clone(handler));
        match services.persistence.start_processing(&mut job, &queue_name).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job.id, "Discarding removed job");
                self.lock_processing().remove(&job.id);
                self.forget(&job.id);
                self.update_statistics(Statistics::job_dequeued);
                return JobOutcome::Discarded;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Unable to record job start");
                self.update_statistics(Statistics::job_dequeued);
                return JobOutcome::Pending;
            }
        }
        handler.set_job(job.clone());

        let started = job.started_at.unwrap_or_else(|| services.time_provider.now_millis());
        let waiting = started - job.queued_at.unwrap_or(job.created_at);
        self.update_statistics(|stats| stats.job_started(waiting, started));
        self.emit(NotificationKind::Started, &job, Some(waiting));
        info!(
            job_id = %job.id,
            topic = %job.topic,
            queue = %queue_name,
            retry_count = job.retry_count,
            "Starting job"
        );

        let (completion, completion_rx) = AsyncCompletion::channel();
        let context = JobExecutionContext::new(
            handler.stop_receiver(),
            completion.clone(),
            handler.message_slot(),
        );
        let consumer = registration.consumer();
        let snapshot = job.clone();
        let task = tokio::spawn(async move { consumer.process(&snapshot, context).await });

        let result = match task.await {
            Ok(JobResult::Async) => {
                registration.track_async(completion.downgrade());
                drop(completion);
                drop(permit);
                self.async_jobs.fetch_add(1, Ordering::AcqRel);
                debug!(job_id = %job.id, "Job continues asynchronously");
                // A dropped handle counts as a failure
                let result = completion_rx.await.unwrap_or_else(|_| JobResult::failed());
                self.async_jobs.fetch_sub(1, Ordering::AcqRel);
                Ok(result)
            }
            Ok(result) => Ok(result),
            Err(e) => Err(classify_join_error(e)),
        };

        self.complete(handler, job, result).await
    }

    async fn complete(
        &self,
        handler: &Arc<JobHandler>,
        mut job: Job,
        result: Result<JobResult, TaskFailure>,
    ) -> JobOutcome {
        let persistence = &self.services.persistence;
        let now = self.services.time_provider.now_millis();
        let processing_ms = job.started_at.map(|started| now - started);
        let message = handler.take_message();
        if message.is_some() {
            job.result_message = message.clone();
        }
        self.lock_processing().remove(&job.id);

        let state = match result {
            Ok(JobResult::Succeeded) => JobState::Succeeded,
            Ok(JobResult::Failed { .. } | JobResult::Cancelled) if handler.is_stopped() => {
                JobState::Stopped
            }
            Ok(JobResult::Failed { retry_delay_ms }) => {
                match RetryPolicy::should_retry(&job, &self.config, retry_delay_ms) {
                    RetryDecision::Retry(delay) => {
                        RetryPolicy::prepare_for_retry(&mut job);
                        self.update_statistics(Statistics::job_failed);
                        self.emit(NotificationKind::Failed, &job, None);
                        return match persistence.reschedule(&mut job, message).await {
                            Ok(true) => {
                                handler.set_job(job);
                                JobOutcome::Reschedule(delay)
                            }
                            Ok(false) => {
                                self.forget(&job.id);
                                JobOutcome::Finished
                            }
                            Err(e) => {
                                error!(job_id = %job.id, error = %e, "Unable to reschedule job");
                                self.forget(&job.id);
                                JobOutcome::Discarded
                            }
                        };
                    }
                    RetryDecision::GiveUp => JobState::GivenUp,
                }
            }
            Ok(JobResult::Cancelled) => JobState::Error,
            Ok(JobResult::Async) => JobState::Error,
            Err(TaskFailure::Panicked(reason)) => {
                error!(job_id = %job.id, topic = %job.topic, reason = %reason, "Job consumer panicked");
                job.result_message.get_or_insert(reason);
                JobState::Error
            }
            Err(TaskFailure::Cancelled) => {
                warn!(job_id = %job.id, "Job task cancelled, leaving record for reload");
                self.forget(&job.id);
                return JobOutcome::Discarded;
            }
        };

        let keep_history = state != JobState::Succeeded || self.config.keep_jobs;
        if let Err(e) = persistence.finish(&job, state, keep_history, processing_ms).await {
            error!(job_id = %job.id, state = %state, error = %e, "Unable to finish job");
        }
        self.forget(&job.id);

        if state == JobState::Succeeded {
            let processing_ms = processing_ms.unwrap_or_default();
            self.update_statistics(|stats| stats.job_finished(processing_ms, now));
            self.emit(NotificationKind::Finished, &job, Some(processing_ms));
        } else {
            self.update_statistics(Statistics::job_cancelled);
            self.emit(NotificationKind::Cancelled, &job, None);
        }
        JobOutcome::Finished
    }

    fn emit(&self, kind: NotificationKind, job: &Job, time_ms: Option<i64>) {
        let now = self.services.time_provider.now_millis();
        self.services.events.emit(kind, job, time_ms, now);
    }

    fn forget(&self, job_id: &str) {
        self.lock_known().remove(job_id);
    }

    fn update_statistics(&self, update: impl FnOnce(&mut Statistics)) {
        update(&mut self.statistics.lock().unwrap_or_else(|p| p.into_inner()));
    }

    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, Box<dyn JobBuffer>> {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_processing(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Arc<JobHandler>>> {
        self.processing.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_known(&self) -> std::sync::MutexGuard<'_, HashSet<JobId>> {
        self.known.lock().unwrap_or_else(|p| p.into_inner())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::config::EngineConfig;
    use crate::application::configuration::JobManagerConfiguration;
    use crate::domain::{JobProperties, ResourceType};
    use crate::port::consumer::mocks::{MockBehavior, MockConsumer};
    use crate::port::resource_store::mocks::InMemoryResourceStore;
    use crate::port::time_provider::mocks::ManualTimeProvider;
    use crate::port::{InstanceIdentity, JobConsumer, ResourceStore, SystemTimeProvider};

    #[derive(Default)]
    struct RecordingReassigner {
        jobs: Mutex<Vec<Job>>,
    }

    #[async_trait]
    impl JobReassigner for RecordingReassigner {
        async fn reassign(&self, job: Job) {
            self.jobs.lock().unwrap().push(job);
        }
    }

    struct Fixture {
        store: Arc<InMemoryResourceStore>,
        services: Arc<QueueServices>,
        reassigner: Arc<RecordingReassigner>,
    }

    fn fixture_with_clock(time_provider: Arc<dyn TimeProvider>) -> Fixture {
        let store = Arc::new(InMemoryResourceStore::new());
        let configuration = Arc::new(JobManagerConfiguration::new(
            &EngineConfig {
                repository_path: "/jobs".into(),
                ..Default::default()
            },
            InstanceIdentity::new("local"),
            time_provider.clone(),
        ));
        let reassigner = Arc::new(RecordingReassigner::default());
        let reassigner_dyn: Arc<dyn JobReassigner> = reassigner.clone();
        let services = Arc::new(QueueServices {
            persistence: Arc::new(JobPersistence::new(
                store.clone(),
                configuration,
                time_provider.clone(),
            )),
            consumers: Arc::new(JobConsumerManager::new(&["*".to_string()], &[])),
            events: Arc::new(JobEvents::new()),
            time_provider,
            reassigner: Arc::downgrade(&reassigner_dyn),
        });
        Fixture {
            store,
            services,
            reassigner,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_clock(Arc::new(SystemTimeProvider))
    }

    impl Fixture {
        fn bind(&self, topic: &str, consumer: Arc<MockConsumer>) {
            let consumer: Arc<dyn JobConsumer> = consumer;
            self.services.consumers.bind(&[topic], 0, consumer);
        }

        async fn new_job(&self, topic: &str, max_retries: i32) -> Job {
            let configuration = self.services.persistence.configuration();
            let id = configuration.unique_id(topic);
            let properties = JobProperties::new();
            let now = self.services.time_provider.now_millis();
            let job = Job {
                path: configuration.unique_path(Some("local"), topic, &id, &properties),
                id,
                topic: topic.into(),
                name: None,
                queue_name: None,
                created_at: now,
                created_instance: Some("local".into()),
                target_instance: Some("local".into()),
                retry_count: 0,
                max_retries,
                queued_at: Some(now),
                started_at: None,
                finished_state: None,
                finished_at: None,
                result_message: None,
                properties,
                read_errors: Vec::new(),
            };
            self.services.persistence.write_new(&job).await.unwrap();
            job
        }

        fn queue(&self, config: QueueConfig) -> Arc<JobQueue> {
            let queue = JobQueue::new(&config.name.clone(), Arc::new(config), self.services.clone());
            queue.start();
            queue
        }

        async fn history(&self, success: bool, job: &Job) -> Option<Job> {
            let path = self
                .services
                .persistence
                .configuration()
                .storage_path(&job.topic, &job.id, success);
            self.services.persistence.read_job(&path).await.unwrap()
        }
    }

    fn config(queue_type: QueueType) -> QueueConfig {
        QueueConfig {
            retry_delay_ms: 0,
            ..QueueConfig::new("test", queue_type, &["a/*"])
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_successful_job_is_removed() {
        let f = fixture();
        f.bind("a/b", Arc::new(MockConsumer::new_success()));
        let queue = f.queue(config(QueueType::Unordered));

        let job = f.new_job("a/b", 10).await;
        assert!(queue.process(job.clone()));
        wait_until(|| queue.statistics().finished_jobs == 1).await;

        assert!(f.store.read(&job.path).await.unwrap().is_none());
        assert!(f.history(true, &job).await.is_none());
        let stats = queue.statistics();
        assert_eq!(stats.queued_jobs, 0);
        assert_eq!(stats.active_jobs, 0);
    }

    #[tokio::test]
    async fn test_retries_until_given_up() {
        let f = fixture();
        let consumer = Arc::new(MockConsumer::new_fail());
        f.bind("a/b", consumer.clone());
        let queue = f.queue(config(QueueType::Unordered));

        let job = f.new_job("a/b", 2).await;
        queue.process(job.clone());
        wait_until(|| queue.statistics().cancelled_jobs == 1).await;

        assert_eq!(consumer.call_count(), 3);
        let retry_counts: Vec<i32> = consumer.processed().iter().map(|j| j.retry_count).collect();
        assert_eq!(retry_counts, vec![0, 1, 2]);
        assert_eq!(queue.statistics().failed_jobs, 2);

        let stored = f.history(false, &job).await.unwrap();
        assert_eq!(stored.state(), JobState::GivenUp);
        assert_eq!(stored.retry_count, 2);
    }

    #[tokio::test]
    async fn test_ordered_queue_keeps_order_across_retries() {
        let f = fixture();
        let consumer = Arc::new(MockConsumer::scripted(
            vec![MockBehavior::Return(JobResult::failed_with_delay(20))],
            MockBehavior::Return(JobResult::Succeeded),
        ));
        f.bind("a/b", consumer.clone());
        let queue = f.queue(config(QueueType::Ordered));

        let mut ids = Vec::new();
        for _ in 0..3 {
            let job = f.new_job("a/b", 5).await;
            ids.push(job.id.clone());
            queue.process(job);
        }
        wait_until(|| queue.statistics().finished_jobs == 3).await;

        let seen: Vec<String> = consumer.processed().into_iter().map(|j| j.id).collect();
        assert_eq!(seen, vec![ids[0].clone(), ids[0].clone(), ids[1].clone(), ids[2].clone()]);
    }

    #[tokio::test]
    async fn test_panic_finishes_as_error() {
        let f = fixture();
        f.bind("a/b", Arc::new(MockConsumer::new(MockBehavior::Panic("boom".into()))));
        let queue = f.queue(config(QueueType::Unordered));

        let job = f.new_job("a/b", 10).await;
        queue.process(job.clone());
        wait_until(|| queue.statistics().cancelled_jobs == 1).await;

        let stored = f.history(false, &job).await.unwrap();
        assert_eq!(stored.state(), JobState::Error);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.result_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_stop_job_finishes_as_stopped() {
        let f = fixture();
        f.bind("a/b", Arc::new(MockConsumer::new(MockBehavior::WaitForStop)));
        let queue = f.queue(config(QueueType::Unordered));

        let job = f.new_job("a/b", 10).await;
        assert!(!queue.stop_job(&job.id));
        queue.process(job.clone());
        wait_until(|| queue.statistics().active_jobs == 1).await;

        assert!(queue.stop_job(&job.id));
        wait_until(|| queue.statistics().cancelled_jobs == 1).await;
        let stored = f.history(false, &job).await.unwrap();
        assert_eq!(stored.state(), JobState::Stopped);
    }

    #[tokio::test]
    async fn test_cancelled_result_without_stop_is_error() {
        let f = fixture();
        f.bind("a/b", Arc::new(MockConsumer::new(MockBehavior::Return(JobResult::Cancelled))));
        let queue = f.queue(config(QueueType::Unordered));

        let job = f.new_job("a/b", 10).await;
        queue.process(job.clone());
        wait_until(|| queue.statistics().cancelled_jobs == 1).await;
        assert_eq!(f.history(false, &job).await.unwrap().state(), JobState::Error);
    }

    #[tokio::test]
    async fn test_async_job_frees_its_slot() {
        let f = fixture();
        let consumer = Arc::new(MockConsumer::scripted(
            vec![MockBehavior::Async(200, JobResult::Succeeded)],
            MockBehavior::Return(JobResult::Succeeded),
        ));
        f.bind("a/b", consumer.clone());
        let queue = f.queue(QueueConfig {
            max_parallel: 1,
            ..config(QueueType::Unordered)
        });

        let slow = f.new_job("a/b", 10).await;
        let fast = f.new_job("a/b", 10).await;
        queue.process(slow);
        queue.process(fast);

        // The second job completes while the first is still pending
        wait_until(|| queue.statistics().finished_jobs == 1).await;
        assert_eq!(queue.state_info().async_jobs, 1);
        wait_until(|| queue.statistics().finished_jobs == 2).await;
        assert_eq!(queue.state_info().async_jobs, 0);
    }

    #[tokio::test]
    async fn test_round_robin_queue_shares_between_topics() {
        let f = fixture();
        let consumer = Arc::new(MockConsumer::new_success());
        f.bind("a/*", consumer.clone());
        let queue = JobQueue::new(
            "rr",
            Arc::new(QueueConfig {
                max_parallel: 1,
                ..config(QueueType::TopicRoundRobin)
            }),
            f.services.clone(),
        );

        // Fill before starting so the buffer decides the order
        queue.running.store(true, Ordering::Release);
        for topic in ["a/x", "a/x", "a/y"] {
            queue.process(f.new_job(topic, 0).await);
        }
        queue.running.store(false, Ordering::Release);
        queue.start();
        wait_until(|| queue.statistics().finished_jobs == 3).await;

        let topics: Vec<String> = consumer.processed().into_iter().map(|j| j.topic).collect();
        assert_eq!(topics, vec!["a/x", "a/y", "a/x"]);
    }

    #[tokio::test]
    async fn test_job_without_consumer_is_handed_back() {
        let f = fixture();
        let queue = f.queue(config(QueueType::Unordered));
        let job = f.new_job("a/b", 10).await;
        queue.process(job.clone());

        wait_until(|| f.reassigner.jobs.lock().unwrap().len() == 1).await;
        assert!(!queue.contains(&job.id));
        assert!(f.store.read(&job.path).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_job_is_ignored() {
        let f = fixture();
        let queue = JobQueue::new("q", Arc::new(config(QueueType::Unordered)), f.services.clone());
        queue.running.store(true, Ordering::Release);
        let job = f.new_job("a/b", 10).await;
        assert!(queue.process(job.clone()));
        assert!(queue.process(job));
        assert_eq!(queue.state_info().waiting, 1);
        assert_eq!(queue.statistics().queued_jobs, 1);
    }

    #[tokio::test]
    async fn test_try_to_close_needs_two_idle_passes() {
        let f = fixture();
        let queue = f.queue(config(QueueType::Unordered));

        assert!(!queue.try_to_close());
        assert!(queue.is_running());
        assert!(queue.try_to_close());
        assert!(!queue.is_running());

        let job = f.new_job("a/b", 10).await;
        assert!(!queue.process(job));
    }

    #[tokio::test]
    async fn test_new_job_resets_close_marker() {
        let f = fixture();
        let queue = JobQueue::new("q", Arc::new(config(QueueType::Unordered)), f.services.clone());
        queue.running.store(true, Ordering::Release);

        assert!(!queue.try_to_close());
        queue.process(f.new_job("a/b", 10).await);
        assert!(!queue.try_to_close());
        queue.clear();
        assert!(!queue.try_to_close());
        assert!(queue.try_to_close());
    }

    #[tokio::test]
    async fn test_outdate_renames_once() {
        let f = fixture();
        let queue = f.queue(config(QueueType::Unordered));
        let renamed = queue.outdate();
        assert!(renamed.starts_with("test<outdated>("));
        assert_eq!(queue.outdate(), renamed);
        assert!(queue.is_outdated());
    }

    #[tokio::test]
    async fn test_suspended_queue_holds_jobs() {
        let f = fixture();
        let consumer = Arc::new(MockConsumer::new_success());
        f.bind("a/b", consumer.clone());
        let queue = f.queue(config(QueueType::Unordered));

        queue.suspend();
        queue.process(f.new_job("a/b", 10).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(consumer.call_count(), 0);

        queue.resume();
        wait_until(|| queue.statistics().finished_jobs == 1).await;
    }

    #[tokio::test]
    async fn test_remove_all_cancels_waiting_jobs() {
        let f = fixture();
        let queue = JobQueue::new("q", Arc::new(config(QueueType::Unordered)), f.services.clone());
        queue.running.store(true, Ordering::Release);
        let job = f.new_job("a/b", 10).await;
        queue.process(job.clone());

        assert_eq!(queue.remove_all().await, 1);
        assert!(!queue.is_suspended());
        assert_eq!(f.history(false, &job).await.unwrap().state(), JobState::Cancelled);
        assert!(f.store.paths_of_type(ResourceType::Job).len() == 1);
    }

    #[tokio::test]
    async fn test_unrecorded_start_is_requeued() {
        let clock = Arc::new(ManualTimeProvider::new(1_000_000));
        let f = fixture_with_clock(clock.clone());
        let consumer = Arc::new(MockConsumer::new_success());
        f.bind("a/b", consumer.clone());
        let queue = JobQueue::new("q", Arc::new(config(QueueType::Unordered)), f.services.clone());
        queue.running.store(true, Ordering::Release);

        let job = f.new_job("a/b", 10).await;
        let handler = JobHandler::new(job.clone());
        queue.lock_known().insert(job.id.clone());
        f.store.set_fail_writes(true);
        assert_eq!(queue.run_job(&handler, None).await, JobOutcome::Pending);
        f.store.set_fail_writes(false);

        assert_eq!(queue.check_for_unprocessed_jobs(), 0);
        clock.advance(UNPROCESSED_JOB_TIMEOUT_MS);
        assert_eq!(queue.check_for_unprocessed_jobs(), 1);
        assert_eq!(queue.state_info().waiting, 1);
        assert_eq!(consumer.call_count(), 0);
    }
}
