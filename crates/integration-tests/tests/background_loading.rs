//! Loading records left by an earlier process

mod common;

use common::{engine_config, fast_main_queue, sqlite_pool, sqlite_store, wait_until, Harness};
use eventjobs_core::application::{EngineConfig, JobManagerConfiguration};
use eventjobs_core::domain::{Job, JobProperties, ResourceType};
use eventjobs_core::port::consumer::mocks::MockConsumer;
use eventjobs_core::port::resource_store::mocks::InMemoryResourceStore;
use eventjobs_core::port::{InstanceIdentity, ResourceStore, SystemTimeProvider, TimeProvider};
use eventjobs_infra_sqlite::SqliteResourceStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const HOUR: i64 = 60 * 60 * 1000;

/// Record as a previous run on instance `local` would have written it
fn stored_job(config: &EngineConfig, created: i64, n: i64) -> Job {
    let configuration = JobManagerConfiguration::new(
        config,
        InstanceIdentity::new("local"),
        Arc::new(SystemTimeProvider),
    );
    let id = configuration.unique_id_at("a/b", created);
    let mut properties = JobProperties::new();
    properties.insert("n".into(), json!(n));
    Job {
        path: configuration.unique_path(Some("local"), "a/b", &id, &properties),
        id,
        topic: "a/b".into(),
        name: None,
        queue_name: None,
        created_at: created,
        created_instance: Some("local".into()),
        target_instance: Some("local".into()),
        retry_count: 0,
        max_retries: 10,
        queued_at: Some(created),
        started_at: None,
        finished_state: None,
        finished_at: None,
        result_message: None,
        properties,
        read_errors: Vec::new(),
    }
}

async fn seed(store: &dyn ResourceStore, job: &Job) {
    store
        .create(&job.path, ResourceType::Job, &job.to_properties())
        .await
        .unwrap();
}

async fn loads_past_jobs_only(store: Arc<dyn ResourceStore>, search: bool) {
    let config = EngineConfig {
        background_load_search: search,
        ..engine_config(fast_main_queue(), Vec::new())
    };
    let now = SystemTimeProvider.now_millis();
    let past = stored_job(&config, now - HOUR, 1);
    let future = stored_job(&config, now + HOUR, 2);
    seed(store.as_ref(), &past).await;
    seed(store.as_ref(), &future).await;

    let h = Harness::over(store, &config);
    let consumer = Arc::new(MockConsumer::new_success());
    h.bind("a/b", consumer.clone());
    h.start();

    wait_until(|| consumer.call_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(consumer.call_count(), 1);
    assert_eq!(consumer.processed()[0].id, past.id);

    // The future record is untouched
    assert_eq!(h.job_paths().await, vec![future.path.clone()]);
}

#[tokio::test]
async fn test_traversal_loads_past_job_on_sqlite() {
    loads_past_jobs_only(sqlite_store().await, false).await;
}

#[tokio::test]
async fn test_search_loads_past_job_on_sqlite() {
    loads_past_jobs_only(sqlite_store().await, true).await;
}

#[tokio::test]
async fn test_unsupported_search_falls_back_to_traversal() {
    loads_past_jobs_only(Arc::new(InMemoryResourceStore::without_search()), true).await;
}

#[tokio::test]
async fn test_interrupted_job_is_retried_after_restart() {
    let store = sqlite_store().await;
    let config = engine_config(fast_main_queue(), Vec::new());
    let now = SystemTimeProvider.now_millis();
    let mut job = stored_job(&config, now - HOUR, 7);
    job.started_at = Some(now - HOUR + 10);
    seed(store.as_ref(), &job).await;

    let h = Harness::over(store, &config);
    let consumer = Arc::new(MockConsumer::new_success());
    h.bind("a/b", consumer.clone());
    h.start();

    wait_until(|| consumer.call_count() == 1).await;
    let processed = &consumer.processed()[0];
    assert_eq!(processed.id, job.id);
    assert_eq!(processed.retry_count, 1);
    assert_eq!(processed.properties["n"], json!(7));
    wait_until(|| h.manager.statistics().finished_jobs == 1).await;
}

#[tokio::test]
async fn test_unreadable_record_is_deferred_by_search_on_sqlite() {
    let pool = sqlite_pool().await;
    let config = EngineConfig {
        background_load_search: true,
        ..engine_config(fast_main_queue(), Vec::new())
    };
    let now = SystemTimeProvider.now_millis();
    let job = stored_job(&config, now - HOUR, 3);
    sqlx::query(
        "INSERT INTO resources (path, parent, resource_type, job_id, topic, target_instance, created, properties) \
         VALUES (?, NULL, 'job', ?, 'a/b', 'local', ?, '{broken')",
    )
    .bind(&job.path)
    .bind(&job.id)
    .bind(job.created_at)
    .execute(&pool)
    .await
    .unwrap();

    let h = Harness::over(Arc::new(SqliteResourceStore::new(pool.clone())), &config);
    let consumer = Arc::new(MockConsumer::new_success());
    h.bind("a/b", consumer.clone());
    h.start();

    wait_until(|| h.manager.loader().unloaded_jobs() == 1).await;
    assert_eq!(consumer.call_count(), 0);

    // Repaired record is picked up once the consumers change
    sqlx::query("UPDATE resources SET properties = ? WHERE path = ?")
        .bind(serde_json::Value::Object(job.to_properties()).to_string())
        .bind(&job.path)
        .execute(&pool)
        .await
        .unwrap();
    h.bind("c/d", Arc::new(MockConsumer::new_success()));

    wait_until(|| consumer.call_count() == 1).await;
    assert_eq!(consumer.processed()[0].id, job.id);
    assert_eq!(h.manager.loader().unloaded_jobs(), 0);
}
