//! Background loading of locally assigned jobs.
//!
//! One worker task per manager. After `start` it waits for the configured
//! settle delay, loads every unfinished local job once (indexed search, or a
//! chronological walk of the time buckets once the store refuses the search),
//! then drains the action channel until `stop` closes it.

use crate::application::configuration::{time_buckets, JobManagerConfiguration};
use crate::application::worker::{shutdown_channel, ShutdownSender, ShutdownToken};
use crate::domain::{keys, Job, Predicate, Resource, ResourceType, SortOrder};
use crate::port::{PropertyUpdate, ResourceStore, StoreQuery, TimeProvider};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Depth of the time buckets below a topic folder (year .. minute)
const BUCKET_LEVELS: usize = 5;

/// Receives jobs found by the loader
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: Job);
}

#[derive(Debug)]
enum LoadAction {
    Path(String),
    Job(Job),
}

pub struct BackgroundLoader {
    store: Arc<dyn ResourceStore>,
    configuration: Arc<JobManagerConfiguration>,
    time_provider: Arc<dyn TimeProvider>,
    processor: Weak<dyn JobProcessor>,
    running: watch::Sender<bool>,
    /// Producer side of the current action channel, `None` while stopped
    actions: Mutex<Option<mpsc::UnboundedSender<LoadAction>>>,
    /// Consumer side waiting to be picked up by the worker
    next_receiver: Mutex<Option<mpsc::UnboundedReceiver<LoadAction>>>,
    unloaded: Mutex<HashSet<String>>,
    first_run: AtomicBool,
    use_search: AtomicBool,
    active: ShutdownSender,
}

impl BackgroundLoader {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        configuration: Arc<JobManagerConfiguration>,
        time_provider: Arc<dyn TimeProvider>,
        processor: Weak<dyn JobProcessor>,
    ) -> Arc<Self> {
        let (running, _) = watch::channel(false);
        let (active, _) = shutdown_channel();
        Arc::new(Self {
            use_search: AtomicBool::new(configuration.background_load_search()),
            store,
            configuration,
            time_provider,
            processor,
            running,
            actions: Mutex::new(None),
            next_receiver: Mutex::new(None),
            unloaded: Mutex::new(HashSet::new()),
            first_run: AtomicBool::new(true),
            active,
        })
    }

    /// Spawn the worker; it lives until `deactivate`
    pub fn activate(self: &Arc<Self>) {
        let loader = Arc::clone(self);
        let token = self.active.token();
        tokio::spawn(async move { loader.run(token).await });
    }

    pub fn start(&self) {
        let mut actions = self.actions.lock().unwrap_or_else(|p| p.into_inner());
        if self.active.is_shutdown() || *self.running.borrow() {
            return;
        }
        debug!("Starting background loader");
        self.unloaded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        let (tx, rx) = mpsc::unbounded_channel();
        *actions = Some(tx);
        *self
            .next_receiver
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(rx);
        self.running.send_replace(true);
    }

    pub fn stop(&self) {
        let mut actions = self.actions.lock().unwrap_or_else(|p| p.into_inner());
        debug!("Stopping background loader");
        self.running.send_replace(false);
        // Closing the channel ends the drain loop
        *actions = None;
    }

    pub fn restart(&self) {
        if self.is_running() {
            debug!("Restarting background loader");
            self.stop();
            self.start();
        }
    }

    /// Terminal; unblocks every wait
    pub fn deactivate(&self) {
        self.stop();
        self.active.shutdown();
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow() && !self.active.is_shutdown()
    }

    /// Queue a job resource path for loading (dropped when not running)
    pub fn load_job(&self, path: &str) {
        self.send(LoadAction::Path(path.to_string()));
    }

    /// Queue an already constructed job (dropped when not running)
    pub fn add_job(&self, job: Job) {
        self.send(LoadAction::Job(job));
    }

    fn send(&self, action: LoadAction) -> bool {
        let actions = self.actions.lock().unwrap_or_else(|p| p.into_inner());
        match actions.as_ref() {
            Some(tx) if self.is_running() => tx.send(action).is_ok(),
            _ => false,
        }
    }

    pub fn unloaded_jobs(&self) -> usize {
        self.unloaded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Queue every deferred unreadable job again
    pub fn try_to_reload_unloaded_jobs(self: &Arc<Self>) {
        let paths: Vec<String> = self
            .unloaded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .collect();
        if paths.is_empty() {
            return;
        }
        info!(count = paths.len(), "Reloading previously unreadable jobs");
        let loader = Arc::clone(self);
        tokio::spawn(async move {
            for path in paths {
                loader.load_job(&path);
            }
        });
    }

    async fn run(self: Arc<Self>, mut active: ShutdownToken) {
        debug!("Background loader worker started");
        let mut running = self.running.subscribe();
        loop {
            let started = tokio::select! {
                started = async { running.wait_for(|running| *running).await.is_ok() } => started,
                _ = active.wait() => false,
            };
            if !started {
                break;
            }
            let start_time = self.time_provider.now_millis();
            let receiver = self
                .next_receiver
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take();
            let mut receiver = match receiver {
                Some(receiver) => receiver,
                None => {
                    // Still running on a consumed channel; wait for the next change
                    let changed = tokio::select! {
                        changed = running.changed() => changed.is_ok(),
                        _ = active.wait() => false,
                    };
                    if changed {
                        continue;
                    }
                    break;
                }
            };

            debug!("Background loader waiting for the system to settle");
            let settled = tokio::select! {
                _ = tokio::time::sleep(self.configuration.background_load_delay()) => true,
                _ = async { running.wait_for(|running| !*running).await.is_ok() } => true,
                _ = active.wait() => false,
            };
            if !settled {
                break;
            }

            if self.is_running() {
                self.load_jobs_in_the_background(start_time).await;
            }
            if self.is_running() {
                self.first_run.store(false, Ordering::Release);
            }

            loop {
                tokio::select! {
                    action = receiver.recv() => match action {
                        Some(action) => self.handle_action(action).await,
                        None => break,
                    },
                    _ = active.wait() => {
                        debug!("Background loader worker stopped");
                        return;
                    }
                }
            }
        }
        debug!("Background loader worker stopped");
    }

    async fn handle_action(&self, action: LoadAction) {
        match action {
            LoadAction::Job(job) => self.dispatch(job).await,
            LoadAction::Path(path) => {
                if !self.is_running() {
                    return;
                }
                match self.store.read(&path).await {
                    Ok(Some(resource)) if resource.resource_type == ResourceType::Job => {
                        debug!(path = %path, "Reading local job");
                        match Job::from_resource(&resource) {
                            Ok(job) if job.has_read_errors() => self.defer(&path),
                            Ok(job) => self.dispatch(job).await,
                            Err(e) => warn!(path = %path, error = %e, "Unable to read job"),
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        warn!(path = %path, "No job resource found, job will not be processed")
                    }
                    Err(e) => warn!(path = %path, error = %e, "Failed to read job resource"),
                }
            }
        }
    }

    async fn dispatch(&self, job: Job) {
        if let Some(processor) = self.processor.upgrade() {
            processor.process(job).await;
        }
    }

    fn defer(&self, path: &str) {
        debug!(path = %path, "Deferring unreadable job");
        self.unloaded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(path.to_string());
    }

    async fn load_jobs_in_the_background(&self, start_time: i64) {
        debug!("Starting background loading");
        let mut count = 0usize;

        if self.use_search.load(Ordering::Acquire) {
            let query = StoreQuery::new(self.configuration.local_jobs_path())
                .of_type(ResourceType::Job)
                .filter(Predicate::Equals(
                    keys::TARGET_INSTANCE.to_string(),
                    Value::from(self.configuration.instance_id()),
                ))
                .filter(Predicate::Less(keys::CREATED.to_string(), Value::from(start_time)))
                .order_by(keys::CREATED, SortOrder::Ascending);
            match self.store.query(&query).await {
                Ok(resources) => {
                    for resource in &resources {
                        if !self.is_running() {
                            break;
                        }
                        if self.load_job_in_the_background(resource).await {
                            count += 1;
                        }
                    }
                }
                Err(e) if e.is_unsupported() => {
                    error!(error = %e, "Store refused the job search, switching to traversal");
                    self.use_search.store(false, Ordering::Release);
                }
                Err(e) => warn!(error = %e, "Background search failed"),
            }
        }

        if !self.use_search.load(Ordering::Acquire) {
            count += self.traverse(start_time).await;
        }
        info!(count = count, "Finished background loading");
    }

    /// Walk topic / year / month / day / hour / minute in ascending order
    async fn traverse(&self, start_time: i64) -> usize {
        let limits = time_buckets(start_time);
        let topics = match self
            .store
            .list_children(self.configuration.local_jobs_path())
            .await
        {
            Ok(topics) => topics,
            Err(e) => {
                warn!(error = %e, "Unable to list local job topics");
                return 0;
            }
        };

        let mut count = 0;
        // (path, level, on the current-time boundary)
        let mut pending: Vec<(String, usize, bool)> = topics
            .into_iter()
            .rev()
            .map(|topic| (topic.path, 0, true))
            .collect();
        while let Some((path, level, at_limit)) = pending.pop() {
            if !self.is_running() {
                break;
            }
            if level == BUCKET_LEVELS {
                count += self.load_minute(&path, start_time).await;
                continue;
            }
            for (value, child) in self.sorted_buckets(&path).await.into_iter().rev() {
                if at_limit && value > limits[level] {
                    debug!(path = %child, "Skipping future bucket");
                    continue;
                }
                pending.push((child, level + 1, at_limit && value == limits[level]));
            }
        }
        count
    }

    async fn sorted_buckets(&self, path: &str) -> Vec<(i64, String)> {
        let children = match self.store.list_children(path).await {
            Ok(children) => children,
            Err(e) => {
                warn!(path = %path, error = %e, "Unable to list job bucket");
                return Vec::new();
            }
        };
        let mut buckets: Vec<(i64, String)> = children
            .into_iter()
            .filter(|child| child.resource_type == ResourceType::Folder)
            .filter_map(|child| child.name().parse::<i64>().ok().map(|value| (value, child.path)))
            .collect();
        buckets.sort_by_key(|(value, _)| *value);
        buckets
    }

    async fn load_minute(&self, path: &str, start_time: i64) -> usize {
        let children = match self.store.list_children(path).await {
            Ok(children) => children,
            Err(e) => {
                warn!(path = %path, error = %e, "Unable to list jobs");
                return 0;
            }
        };
        let mut jobs: Vec<Resource> = children
            .into_iter()
            .filter(|child| child.resource_type == ResourceType::Job)
            .filter(|child| {
                child
                    .get_i64(keys::CREATED)
                    .map_or(child.has_read_errors(), |created| created < start_time)
            })
            .collect();
        jobs.sort_by_key(|job| job.get_i64(keys::CREATED).unwrap_or_default());

        let mut count = 0;
        for resource in &jobs {
            if self.is_running() && self.load_job_in_the_background(resource).await {
                count += 1;
            }
        }
        count
    }

    async fn load_job_in_the_background(&self, resource: &Resource) -> bool {
        if !self.configuration.is_local_job(&resource.path) {
            return false;
        }
        let mut job = match Job::from_resource(resource) {
            Ok(job) => job,
            Err(e) => {
                debug!(path = %resource.path, error = %e, "Skipping invalid job record");
                return false;
            }
        };
        let first_run = self.first_run.load(Ordering::Acquire);
        if !first_run && job.started_at.is_some() {
            // Running somewhere in this instance
            return false;
        }

        if job.started_at.is_some() && self.is_running() {
            // Interrupted by a shutdown; counts as an attempt
            job.retry();
            let update = PropertyUpdate::new()
                .remove(keys::STARTED)
                .set(keys::RETRY_COUNT, job.retry_count);
            if let Err(e) = self.store.update(&job.path, &update).await {
                debug!(job_id = %job.id, error = %e, "Unable to reset interrupted job");
            }
        }

        if job.has_read_errors() {
            self.defer(&job.path);
        } else if self.is_running() {
            self.dispatch(job).await;
        }
        true
    }
}
