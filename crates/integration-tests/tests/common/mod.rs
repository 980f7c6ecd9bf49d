//! Shared wiring for the end-to-end tests

#![allow(dead_code)]

use eventjobs_core::application::{EngineConfig, JobConsumerManager, JobManager};
use eventjobs_core::domain::{Job, QueueConfig, ResourceType};
use eventjobs_core::port::resource_store::mocks::InMemoryResourceStore;
use eventjobs_core::port::{JobConsumer, ResourceStore, StoreQuery, SystemTimeProvider};
use eventjobs_infra_sqlite::{create_pool, run_migrations, SqliteResourceStore};
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const REPOSITORY: &str = "/jobs";

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    Sqlite,
}

pub struct Harness {
    pub store: Arc<dyn ResourceStore>,
    pub consumers: Arc<JobConsumerManager>,
    pub manager: Arc<JobManager>,
}

pub fn engine_config(main_queue: QueueConfig, queues: Vec<QueueConfig>) -> EngineConfig {
    EngineConfig {
        instance_id: Some("local".into()),
        repository_path: REPOSITORY.into(),
        background_load_delay_secs: 0,
        main_queue,
        queues,
        ..Default::default()
    }
}

pub fn fast_main_queue() -> QueueConfig {
    QueueConfig {
        retry_delay_ms: 0,
        ..QueueConfig::main_queue()
    }
}

pub async fn sqlite_store() -> Arc<SqliteResourceStore> {
    Arc::new(SqliteResourceStore::new(sqlite_pool().await))
}

/// Migrated in-memory database, for tests that write rows directly
pub async fn sqlite_pool() -> SqlitePool {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

pub async fn store_for(backend: Backend) -> Arc<dyn ResourceStore> {
    match backend {
        Backend::Memory => Arc::new(InMemoryResourceStore::new()),
        Backend::Sqlite => sqlite_store().await,
    }
}

impl Harness {
    /// Manager over `store`; processing starts with [`Harness::start`]
    pub fn over(store: Arc<dyn ResourceStore>, config: &EngineConfig) -> Self {
        let consumers = Arc::new(JobConsumerManager::new(&["*".to_string()], &[]));
        let manager = JobManager::new(
            config,
            store.clone(),
            consumers.clone(),
            Arc::new(SystemTimeProvider),
        )
        .unwrap();
        Self {
            store,
            consumers,
            manager,
        }
    }

    pub async fn new(backend: Backend, config: &EngineConfig) -> Self {
        Self::over(store_for(backend).await, config)
    }

    pub fn bind(&self, topic: &str, consumer: Arc<dyn JobConsumer>) {
        self.consumers.bind(&[topic], 0, consumer);
    }

    pub fn start(&self) {
        self.manager.spawn_standalone_topology();
    }

    pub async fn add(&self, topic: &str, properties: serde_json::Value) -> Job {
        let properties = properties.as_object().cloned().unwrap_or_default();
        let mut errors = Vec::new();
        let job = self
            .manager
            .add_job(Some(topic), None, Some(properties), &mut errors)
            .await;
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        job.unwrap()
    }

    /// Paths of every job record under the repository, history included
    ///
    /// Walks the tree when the store refuses the search.
    pub async fn job_paths(&self) -> Vec<String> {
        let query = StoreQuery::new(REPOSITORY).of_type(ResourceType::Job);
        match self.store.query(&query).await {
            Ok(found) => found.into_iter().map(|r| r.path).collect(),
            Err(e) if e.is_unsupported() => self.walk_job_paths().await,
            Err(e) => panic!("job search failed: {e}"),
        }
    }

    async fn walk_job_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        let mut pending = vec![REPOSITORY.to_string()];
        while let Some(path) = pending.pop() {
            for child in self.store.list_children(&path).await.unwrap() {
                match child.resource_type {
                    ResourceType::Job => paths.push(child.path),
                    ResourceType::Folder => pending.push(child.path),
                    ResourceType::Lock => {}
                }
            }
        }
        paths.sort();
        paths
    }
}

pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Like [`wait_until`] for conditions that need the store
pub async fn wait_for<F, Fut>(condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
