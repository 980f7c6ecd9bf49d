//! Job manager: the orchestrator behind the public job API.
//!
//! Owns the queue registry, the topology snapshot and the background loader.
//! Submission lives in `submit`, lookups and admin operations in `query`.

mod query;
mod submit;

pub use submit::JobBuilder;

use crate::application::background_loader::{BackgroundLoader, JobProcessor};
use crate::application::config::EngineConfig;
use crate::application::configuration::JobManagerConfiguration;
use crate::application::consumer_manager::JobConsumerManager;
use crate::application::notification::{JobEvents, JobNotification};
use crate::application::persistence::JobPersistence;
use crate::application::queue::{JobQueue, JobReassigner, QueueServices, QueueStateInfo};
use crate::application::queue_config::QueueConfigurationManager;
use crate::application::worker::constants::FULL_CLEANUP_EVERY_N_RUNS;
use crate::application::worker::{shutdown_channel, ShutdownSender};
use crate::domain::{
    keys, Job, JobProperties, JobState, Predicate, QueueConfig, QueueInfo, QueueType, ResourceType,
    SortOrder, Statistics, TopicStatistics, TopologyCapabilities, TopologyEvent,
    TopologyEventKind, TopologyView,
};
use crate::error::Result;
use crate::port::{InstanceIdentity, ResourceStore, StoreQuery, TimeProvider};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

type QueueRegistry = HashMap<String, Arc<JobQueue>>;

pub struct JobManager {
    configuration: Arc<JobManagerConfiguration>,
    queue_configs: QueueConfigurationManager,
    persistence: Arc<JobPersistence>,
    consumers: Arc<JobConsumerManager>,
    events: Arc<JobEvents>,
    time_provider: Arc<dyn TimeProvider>,
    queue_services: Arc<QueueServices>,
    loader: Arc<BackgroundLoader>,
    /// One live queue per name; also guards create / evict / outdate
    queues: Mutex<QueueRegistry>,
    /// Statistics of retired queues
    base_statistics: Mutex<Statistics>,
    topology: RwLock<Option<Arc<TopologyCapabilities>>>,
    topology_changes: AtomicU64,
    cleanup_runs: AtomicU64,
    active: ShutdownSender,
}

impl JobManager {
    /// Build the manager and spawn its background loader
    ///
    /// Must be called inside a tokio runtime. Processing starts with the
    /// first topology event.
    ///
    /// # Errors
    /// - AppError::Config if the configuration is invalid
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn ResourceStore>,
        consumers: Arc<JobConsumerManager>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let identity = match &config.instance_id {
            Some(id) => InstanceIdentity::new(id.clone()),
            None => InstanceIdentity::generate(),
        };
        let configuration = Arc::new(JobManagerConfiguration::new(
            config,
            identity,
            time_provider.clone(),
        ));
        let queue_configs =
            QueueConfigurationManager::new(config.main_queue.clone(), config.queues.clone())?;
        let persistence = Arc::new(JobPersistence::new(
            store.clone(),
            configuration.clone(),
            time_provider.clone(),
        ));
        let events = Arc::new(JobEvents::new());
        let now = time_provider.now_millis();

        let manager = Arc::new_cyclic(|weak: &std::sync::Weak<JobManager>| {
            let reassigner: std::sync::Weak<dyn JobReassigner> = weak.clone();
            let processor: std::sync::Weak<dyn JobProcessor> = weak.clone();
            let (active, _) = shutdown_channel();
            Self {
                queue_services: Arc::new(QueueServices {
                    persistence: persistence.clone(),
                    consumers: consumers.clone(),
                    events: events.clone(),
                    time_provider: time_provider.clone(),
                    reassigner,
                }),
                loader: BackgroundLoader::new(
                    store,
                    configuration.clone(),
                    time_provider.clone(),
                    processor,
                ),
                configuration,
                queue_configs,
                persistence,
                consumers,
                events,
                time_provider,
                queues: Mutex::new(HashMap::new()),
                base_statistics: Mutex::new(Statistics::new(now)),
                topology: RwLock::new(None),
                topology_changes: AtomicU64::new(0),
                cleanup_runs: AtomicU64::new(0),
                active,
            }
        });
        manager.loader.activate();
        info!(
            instance_id = %manager.configuration.instance_id(),
            repository = %manager.configuration.repository_path(),
            "Job manager created"
        );
        Ok(manager)
    }

    pub fn instance_id(&self) -> &str {
        self.configuration.instance_id()
    }

    pub fn configuration(&self) -> &Arc<JobManagerConfiguration> {
        &self.configuration
    }

    pub fn consumers(&self) -> &Arc<JobConsumerManager> {
        &self.consumers
    }

    pub fn loader(&self) -> &Arc<BackgroundLoader> {
        &self.loader
    }

    /// Subscribe to job notifications
    pub fn subscribe(&self) -> broadcast::Receiver<JobNotification> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    pub fn handle_topology_event(&self, event: TopologyEvent) {
        if self.active.is_shutdown() {
            return;
        }
        debug!(kind = ?event.kind, "Received topology event");
        match (event.kind, event.view) {
            (TopologyEventKind::Changing, _) => self.stop_processing(),
            (TopologyEventKind::PropertiesChanged, Some(view))
                if self.capabilities().map_or(false, |caps| caps.is_same(&view)) =>
            {
                debug!("Topology properties unchanged, ignoring event");
            }
            (_, Some(view)) => {
                self.stop_processing();
                self.start_processing(&view);
            }
            (kind, None) => warn!(kind = ?kind, "Topology event without view ignored"),
        }
    }

    /// Follow local consumer changes with a single-instance topology
    ///
    /// Used when no cluster view is delivered from outside.
    pub fn spawn_standalone_topology(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut changes = self.consumers.subscribe_changes();
        let mut token = self.active.token();
        manager.handle_topology_event(TopologyEvent::new(
            TopologyEventKind::Init,
            Some(manager.local_view()),
        ));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        manager.handle_topology_event(TopologyEvent::new(
                            TopologyEventKind::PropertiesChanged,
                            Some(manager.local_view()),
                        ));
                        // A new consumer may make deferred records usable
                        manager.loader.try_to_reload_unloaded_jobs();
                    }
                    _ = token.wait() => break,
                }
            }
            debug!("Standalone topology tracking stopped");
        });
    }

    fn local_view(&self) -> TopologyView {
        TopologyView::single(self.instance_id(), &self.consumers.topics())
    }

    fn start_processing(&self, view: &TopologyView) {
        let change_count = self.topology_changes.fetch_add(1, Ordering::AcqRel) + 1;
        let capabilities = Arc::new(TopologyCapabilities::new(
            view,
            change_count,
            self.configuration.disable_distribution(),
        ));
        info!(
            change_count = change_count,
            leader = capabilities.is_leader(),
            instances = view.instances.len(),
            "Starting job processing"
        );
        *self.topology.write().unwrap_or_else(|p| p.into_inner()) = Some(capabilities);
        self.loader.start();
    }

    fn stop_processing(&self) {
        let previous = self
            .topology
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(capabilities) = previous {
            info!(change_count = capabilities.change_count(), "Stopping job processing");
            capabilities.deactivate();
        }
        self.loader.stop();
        self.retire_all_queues();
    }

    /// Current snapshot, `None` while processing is stopped
    pub fn capabilities(&self) -> Option<Arc<TopologyCapabilities>> {
        self.topology
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn is_leader(&self) -> bool {
        self.capabilities().map_or(false, |caps| caps.is_leader())
    }

    /// Instance id -> advertised topics of the current view
    pub fn topology_instances(&self) -> BTreeMap<String, Vec<String>> {
        self.capabilities()
            .map(|caps| caps.all_instances().clone())
            .unwrap_or_default()
    }

    /// Drop all in-memory queue state and reload from the store
    pub fn restart(&self) {
        info!("Restarting job manager");
        self.loader.stop();
        self.retire_all_queues();
        let now = self.time_provider.now_millis();
        self.lock_base_statistics().reset(now);
        for queue in self.lock_queues().values() {
            queue.reset_statistics();
        }
        if self.capabilities().is_some() {
            self.loader.start();
        }
    }

    /// Replace the queue configurations
    ///
    /// Live queues whose configuration changed are outdated when the next
    /// job for them arrives; their waiting jobs keep draining.
    pub fn update_queue_configurations(
        &self,
        main_queue: QueueConfig,
        queues: Vec<QueueConfig>,
    ) -> Result<()> {
        self.queue_configs.update(main_queue, queues)?;
        info!(
            queues = self.queue_configs.configurations().len(),
            "Queue configurations updated"
        );
        Ok(())
    }

    pub fn queue_configurations(&self) -> Vec<Arc<QueueConfig>> {
        self.queue_configs.configurations()
    }

    // ------------------------------------------------------------------
    // Queue routing
    // ------------------------------------------------------------------

    /// Resolve the queue for a topic: static configuration, then a custom
    /// queue named by the job, then the main queue
    pub fn queue_info(&self, topic: &str, properties: &JobProperties) -> QueueInfo {
        let queues = self.lock_queues();
        self.resolve_queue_info(&queues, topic, properties)
    }

    fn resolve_queue_info(
        &self,
        queues: &QueueRegistry,
        topic: &str,
        properties: &JobProperties,
    ) -> QueueInfo {
        if let Some((name, config)) = self.queue_configs.match_topic(topic) {
            return QueueInfo::new(name, config);
        }
        if let Some(custom) = properties
            .get(keys::QUEUE_NAME)
            .and_then(|v| v.as_str())
            .filter(|name| !name.trim().is_empty())
        {
            return match queues.get(custom) {
                Some(queue) => QueueInfo::new(custom, queue.config().clone()),
                None => QueueInfo::new(
                    custom,
                    self.queue_configs.custom_config(custom, properties),
                ),
            };
        }
        let main = self.queue_configs.main_queue();
        QueueInfo::new(main.name.clone(), main)
    }

    /// Hand a loaded job to its queue
    async fn process_job(&self, job: Job) {
        let Some(capabilities) = self.capabilities() else {
            debug!(job_id = %job.id, "Processing stopped, job stays in the store");
            return;
        };

        if self.consumers.executor_for(&job).is_none() {
            self.reassign_job(&capabilities, job).await;
            return;
        }

        let dropped = {
            let mut queues = self.lock_queues();
            let info = self.resolve_queue_info(&queues, &job.topic, &job.properties);
            if info.config.queue_type == QueueType::Drop {
                Some(job)
            } else {
                let queue = self.queue_for(&mut queues, &info);
                if !queue.process(job) {
                    debug!(queue = %info.queue_name, "Queue closed while adding job");
                }
                None
            }
        };

        if let Some(job) = dropped {
            info!(job_id = %job.id, topic = %job.topic, "Dropping job");
            if let Err(e) = self
                .persistence
                .finish(&job, JobState::Dropped, false, None)
                .await
            {
                error!(job_id = %job.id, error = %e, "Unable to drop job");
            }
        }
    }

    /// Live queue for `info`, replacing one with an older configuration
    fn queue_for(&self, queues: &mut QueueRegistry, info: &QueueInfo) -> Arc<JobQueue> {
        if let Some(queue) = queues.get(&info.queue_name) {
            if queue.config().version == info.config.version && queue.is_running() {
                return Arc::clone(queue);
            }
        }
        if let Some(previous) = queues.remove(&info.queue_name) {
            self.retire_queue(queues, previous);
        }
        info!(
            queue = %info.queue_name,
            queue_type = ?info.config.queue_type,
            max_parallel = info.config.effective_max_parallel(),
            "Starting job queue"
        );
        let queue = JobQueue::new(
            &info.queue_name,
            info.config.clone(),
            self.queue_services.clone(),
        );
        queue.start();
        queues.insert(info.queue_name.clone(), Arc::clone(&queue));
        queue
    }

    /// Close an idle queue, otherwise keep it draining under a new name
    fn retire_queue(&self, queues: &mut QueueRegistry, queue: Arc<JobQueue>) {
        if !queue.is_running() || queue.try_to_close() {
            self.lock_base_statistics().add(&queue.statistics());
        } else {
            let renamed = queue.outdate();
            queues.insert(renamed, queue);
        }
    }

    fn retire_all_queues(&self) {
        let mut queues = self.lock_queues();
        let current: Vec<Arc<JobQueue>> = queues.drain().map(|(_, queue)| queue).collect();
        for queue in current {
            queue.clear();
            self.retire_queue(&mut queues, queue);
        }
    }

    async fn reassign_job(&self, capabilities: &TopologyCapabilities, job: Job) {
        let info = self.queue_info(&job.topic, &job.properties);
        let target = capabilities.detect_target(&job.topic, &job.properties, &info);
        if target.as_deref() == Some(self.instance_id()) {
            warn!(
                job_id = %job.id,
                topic = %job.topic,
                "No local consumer although this instance is advertised, leaving job"
            );
            return;
        }
        if let Err(e) = self.persistence.reassign(&job, target.as_deref()).await {
            error!(job_id = %job.id, error = %e, "Unable to reassign job");
        }
    }

    pub fn queue(&self, name: &str) -> Option<Arc<JobQueue>> {
        self.lock_queues().get(name).cloned()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_queues().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_states(&self) -> Vec<QueueStateInfo> {
        let mut states: Vec<QueueStateInfo> = self
            .lock_queues()
            .values()
            .map(|queue| queue.state_info())
            .collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    // ------------------------------------------------------------------
    // Maintenance and statistics
    // ------------------------------------------------------------------

    /// One cleanup cycle
    ///
    /// Every run re-queues stuck jobs. Every fifth run evicts queues that
    /// were idle on two consecutive full passes, and the leader assigns
    /// unassigned jobs.
    pub async fn maintain(&self) {
        let run = self.cleanup_runs.fetch_add(1, Ordering::AcqRel) + 1;
        let queues: Vec<Arc<JobQueue>> = self.lock_queues().values().cloned().collect();
        for queue in &queues {
            queue.check_for_unprocessed_jobs();
        }

        if run % FULL_CLEANUP_EVERY_N_RUNS == 0 {
            let evicted = self.evict_idle_queues();
            if !evicted.is_empty() {
                info!(queues = ?evicted, "Removed idle queues");
            }
            if let Some(capabilities) = self.capabilities() {
                if capabilities.is_leader() {
                    self.assign_unassigned_jobs(&capabilities).await;
                }
            }
        }
    }

    fn evict_idle_queues(&self) -> Vec<String> {
        let mut queues = self.lock_queues();
        let idle: Vec<String> = queues
            .iter()
            .filter(|(_, queue)| queue.try_to_close())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &idle {
            if let Some(queue) = queues.remove(name) {
                self.lock_base_statistics().add(&queue.statistics());
            }
        }
        idle
    }

    async fn assign_unassigned_jobs(&self, capabilities: &TopologyCapabilities) {
        let query = StoreQuery::new(self.configuration.unassigned_jobs_path())
            .of_type(ResourceType::Job)
            .filter(Predicate::Missing(keys::FINISHED_STATE.to_string()))
            .order_by(keys::CREATED, SortOrder::Ascending);
        let resources = match self.persistence.store().query(&query).await {
            Ok(resources) => resources,
            Err(e) => {
                warn!(error = %e, "Unable to look up unassigned jobs");
                return;
            }
        };

        let mut assigned = 0usize;
        for resource in &resources {
            let Ok(job) = Job::from_resource(resource) else {
                continue;
            };
            if job.has_read_errors() {
                continue;
            }
            let info = self.queue_info(&job.topic, &job.properties);
            let Some(target) = capabilities.detect_target(&job.topic, &job.properties, &info)
            else {
                continue;
            };
            match self.persistence.reassign(&job, Some(&target)).await {
                Ok(moved) => {
                    assigned += 1;
                    if target == self.instance_id() {
                        self.loader.add_job(moved);
                    }
                }
                Err(e) => error!(job_id = %job.id, error = %e, "Unable to assign job"),
            }
        }
        if assigned > 0 {
            info!(count = assigned, "Assigned unassigned jobs");
        }
    }

    /// Global statistics: retired queues plus every live queue
    pub fn statistics(&self) -> Statistics {
        let mut total = self.lock_base_statistics().clone();
        for queue in self.lock_queues().values() {
            total.add(&queue.statistics());
        }
        total
    }

    pub fn topic_statistics(&self) -> Vec<TopicStatistics> {
        self.events.topic_statistics()
    }

    /// Feed a record written by another instance into the loader
    pub fn handle_resource_added(&self, path: &str) {
        if self.configuration.is_local_job(path) {
            debug!(path = %path, "Local job added externally");
            self.loader.load_job(path);
        }
    }

    /// Stop everything; the manager cannot be restarted
    pub fn shutdown(&self) {
        if self.active.is_shutdown() {
            return;
        }
        info!("Shutting down job manager");
        self.active.shutdown();
        self.loader.deactivate();
        if let Some(capabilities) = self
            .topology
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            capabilities.deactivate();
        }
        let queues: Vec<Arc<JobQueue>> = self.lock_queues().drain().map(|(_, q)| q).collect();
        for queue in queues {
            queue.close();
        }
    }

    fn lock_queues(&self) -> MutexGuard<'_, QueueRegistry> {
        self.queues.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_base_statistics(&self) -> MutexGuard<'_, Statistics> {
        self.base_statistics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl JobReassigner for JobManager {
    async fn reassign(&self, job: Job) {
        match self.capabilities() {
            Some(capabilities) => self.reassign_job(&capabilities, job).await,
            None => debug!(job_id = %job.id, "Processing stopped, not reassigning"),
        }
    }
}

#[async_trait]
impl JobProcessor for JobManager {
    async fn process(&self, job: Job) {
        self.process_job(job).await;
    }
}
