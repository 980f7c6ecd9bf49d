// SQLite ResourceStore Implementation

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use eventjobs_core::domain::resource::parent_path;
use eventjobs_core::domain::{keys, Predicate, PropertyMap, Resource, ResourceType, SortOrder};
use eventjobs_core::error::{AppError, Result};
use eventjobs_core::port::{PropertyUpdate, ResourceStore, StoreQuery};
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const COLUMNS: &str =
    "path, resource_type, job_id, topic, target_instance, created, properties";

/// True for rows whose properties parse as a JSON object
const READABLE: &str =
    "(CASE WHEN json_valid(properties) THEN json_type(properties) = 'object' ELSE 0 END)";

/// Resource tree on one SQLite table
pub struct SqliteResourceStore {
    pool: SqlitePool,
    /// Serializes read-modify-commit cycles of this process
    writes: Mutex<()>,
}

impl SqliteResourceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            writes: Mutex::new(()),
        }
    }

    async fn fetch_properties(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        path: &str,
    ) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT properties FROM resources WHERE path = ?")
            .bind(path)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx_error)
    }
}

/// Lower and upper bound of every path below `prefix`
///
/// '0' is the character after '/', so the range covers exactly `prefix/...`.
fn descendant_range(prefix: &str) -> (String, String) {
    let prefix = prefix.trim_end_matches('/');
    (format!("{}/", prefix), format!("{}0", prefix))
}

/// JSON path of a top-level property; keys contain dots
fn json_path(key: &str) -> Result<String> {
    if key.contains('"') {
        return Err(AppError::Unsupported(format!(
            "property name not searchable: {}",
            key
        )));
    }
    Ok(format!("$.\"{}\"", key))
}

/// Indexed copies of well-known properties
struct IdentityColumns {
    job_id: Option<String>,
    topic: Option<String>,
    target_instance: Option<String>,
    created: Option<i64>,
    finished_state: Option<String>,
}

impl IdentityColumns {
    fn of(properties: &PropertyMap) -> Self {
        let text = |key: &str| properties.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            job_id: text(keys::JOB_ID),
            topic: text(keys::TOPIC),
            target_instance: text(keys::TARGET_INSTANCE),
            created: properties.get(keys::CREATED).and_then(Value::as_i64),
            finished_state: text(keys::FINISHED_STATE),
        }
    }
}

/// Column holding the indexed copy of `key`, if it has one
///
/// Matches the keys `ResourceRow::identity_properties` restores.
fn identity_column(key: &str) -> Option<&'static str> {
    match key {
        keys::JOB_ID => Some("job_id"),
        keys::TOPIC => Some("topic"),
        keys::TARGET_INSTANCE => Some("target_instance"),
        keys::CREATED => Some("created"),
        _ => None,
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ResourceRow {
    path: String,
    resource_type: String,
    job_id: Option<String>,
    topic: Option<String>,
    target_instance: Option<String>,
    created: Option<i64>,
    properties: String,
}

impl ResourceRow {
    fn into_resource(self) -> Resource {
        let mut read_errors = Vec::new();
        let resource_type = ResourceType::parse(&self.resource_type).unwrap_or_else(|| {
            read_errors.push(format!("unknown resource type '{}'", self.resource_type));
            ResourceType::Job
        });

        let properties = match serde_json::from_str::<Value>(&self.properties) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                read_errors.push(format!("properties are not an object: {}", other));
                self.identity_properties()
            }
            Err(e) => {
                read_errors.push(format!("properties: {}", e));
                self.identity_properties()
            }
        };
        if !read_errors.is_empty() {
            warn!(path = %self.path, errors = ?read_errors, "Unreadable resource");
        }

        Resource {
            path: self.path,
            resource_type,
            properties,
            read_errors,
        }
    }

    /// Best-effort property map from the indexed columns
    fn identity_properties(&self) -> PropertyMap {
        let mut properties = PropertyMap::new();
        if let Some(id) = &self.job_id {
            properties.insert(keys::JOB_ID.to_string(), Value::from(id.as_str()));
        }
        if let Some(topic) = &self.topic {
            properties.insert(keys::TOPIC.to_string(), Value::from(topic.as_str()));
        }
        if let Some(target) = &self.target_instance {
            properties.insert(keys::TARGET_INSTANCE.to_string(), Value::from(target.as_str()));
        }
        if let Some(created) = self.created {
            properties.insert(keys::CREATED.to_string(), Value::from(created));
        }
        properties
    }
}

/// Bind a JSON scalar the way `json_extract` returns it
fn push_scalar(builder: &mut QueryBuilder<'_, Sqlite>, value: &Value) -> Result<()> {
    match value {
        Value::Bool(b) => builder.push_bind(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => builder.push_bind(i),
            None => builder.push_bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => builder.push_bind(s.clone()),
        other => {
            return Err(AppError::Unsupported(format!(
                "cannot compare against {}",
                other
            )))
        }
    };
    Ok(())
}

/// `json_type` names a value must have to compare with `value`
fn json_types(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "('true', 'false')",
        Value::Number(_) => "('integer', 'real')",
        _ => "('text')",
    }
}

/// `typeof` names a column value must have to compare with `value`
fn column_types(value: &Value) -> Option<&'static str> {
    match value {
        Value::Number(_) => Some("('integer', 'real')"),
        Value::String(_) => Some("('text')"),
        _ => None,
    }
}

fn push_predicate(builder: &mut QueryBuilder<'_, Sqlite>, predicate: &Predicate) -> Result<()> {
    let path = json_path(predicate.key())?;
    let (operator, bound) = match predicate {
        Predicate::Exists(_) => {
            builder.push("json_type(properties, ").push_bind(path).push(") IS NOT NULL");
            return Ok(());
        }
        Predicate::Missing(_) => {
            builder.push("json_type(properties, ").push_bind(path).push(") IS NULL");
            return Ok(());
        }
        Predicate::OneOf(_, values) => {
            if values.is_empty() {
                builder.push("0");
                return Ok(());
            }
            builder.push("(");
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                push_predicate(
                    builder,
                    &Predicate::Equals(predicate.key().to_string(), value.clone()),
                )?;
            }
            builder.push(")");
            return Ok(());
        }
        Predicate::Equals(_, v) => ("=", v),
        Predicate::Less(_, v) => ("<", v),
        Predicate::LessOrEqual(_, v) => ("<=", v),
        Predicate::Greater(_, v) => (">", v),
        Predicate::GreaterOrEqual(_, v) => (">=", v),
    };

    // Values of another JSON kind never match
    builder
        .push("(json_type(properties, ")
        .push_bind(path.clone())
        .push(format!(") IN {} AND json_extract(properties, ", json_types(bound)))
        .push_bind(path)
        .push(format!(") {} ", operator));
    push_scalar(builder, bound)?;
    builder.push(")");
    Ok(())
}

/// Same predicate against the identity columns, for rows whose JSON is unreadable
///
/// Keys without a column count as absent.
fn push_identity_predicate(
    builder: &mut QueryBuilder<'_, Sqlite>,
    predicate: &Predicate,
) -> Result<()> {
    let column = identity_column(predicate.key());
    let (operator, bound) = match predicate {
        Predicate::Exists(_) => {
            builder.push(column.map_or("0".to_string(), |c| format!("{} IS NOT NULL", c)));
            return Ok(());
        }
        Predicate::Missing(_) => {
            builder.push(column.map_or("1".to_string(), |c| format!("{} IS NULL", c)));
            return Ok(());
        }
        Predicate::OneOf(key, values) => {
            builder.push("(0");
            for value in values {
                builder.push(" OR ");
                push_identity_predicate(builder, &Predicate::Equals(key.clone(), value.clone()))?;
            }
            builder.push(")");
            return Ok(());
        }
        Predicate::Equals(_, v) => ("=", v),
        Predicate::Less(_, v) => ("<", v),
        Predicate::LessOrEqual(_, v) => ("<=", v),
        Predicate::Greater(_, v) => (">", v),
        Predicate::GreaterOrEqual(_, v) => (">=", v),
    };

    let (Some(column), Some(types)) = (column, column_types(bound)) else {
        builder.push("0");
        return Ok(());
    };
    builder.push(format!("(typeof({}) IN {} AND {} {} ", column, types, column, operator));
    push_scalar(builder, bound)?;
    builder.push(")");
    Ok(())
}

/// `1 AND <filter> AND (<any_of>)` with the given predicate translation
fn push_conditions(
    builder: &mut QueryBuilder<'_, Sqlite>,
    query: &StoreQuery,
    push: fn(&mut QueryBuilder<'_, Sqlite>, &Predicate) -> Result<()>,
) -> Result<()> {
    builder.push("(1");
    for predicate in &query.filter {
        builder.push(" AND ");
        push(builder, predicate)?;
    }
    if !query.any_of.is_empty() {
        builder.push(" AND (");
        for (i, template) in query.any_of.iter().enumerate() {
            if i > 0 {
                builder.push(" OR ");
            }
            builder.push("(1");
            for predicate in template.predicates() {
                builder.push(" AND ");
                push(builder, predicate)?;
            }
            builder.push(")");
        }
        builder.push(")");
    }
    builder.push(")");
    Ok(())
}

/// Translate a typed query into one SELECT with bound parameters
fn build_query(query: &StoreQuery) -> Result<QueryBuilder<'_, Sqlite>> {
    let (lower, upper) = descendant_range(&query.path_prefix);
    let mut builder = QueryBuilder::new(format!("SELECT {} FROM resources WHERE path >= ", COLUMNS));
    builder
        .push_bind(lower)
        .push(" AND path < ")
        .push_bind(upper);

    if let Some(resource_type) = query.resource_type {
        builder
            .push(" AND resource_type = ")
            .push_bind(resource_type.as_str());
    }
    // Unreadable rows are searched by their identity columns
    builder.push(format!(" AND CASE WHEN {} THEN ", READABLE));
    push_conditions(&mut builder, query, push_predicate)?;
    builder.push(" ELSE ");
    push_conditions(&mut builder, query, push_identity_predicate)?;
    builder.push(" END");

    builder.push(" ORDER BY ");
    if let Some((key, order)) = &query.order_by {
        let path = json_path(key)?;
        let direction = match order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let fallback = identity_column(key).unwrap_or("NULL");
        // Records without the key go last when ascending, first when descending
        for suffix in [" IS NULL", ""] {
            builder
                .push(format!("(CASE WHEN {} THEN json_extract(properties, ", READABLE))
                .push_bind(path.clone())
                .push(format!(") ELSE {} END){} {}, ", fallback, suffix, direction));
        }
    }
    builder.push("path ASC");

    if let Some(limit) = query.limit {
        builder.push(" LIMIT ").push_bind(limit as i64);
    }
    Ok(builder)
}

#[async_trait]
impl ResourceStore for SqliteResourceStore {
    async fn create(
        &self,
        path: &str,
        resource_type: ResourceType,
        properties: &PropertyMap,
    ) -> Result<()> {
        let _guard = self.writes.lock().await;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let mut current = parent_path(path);
        while let Some(folder) = current {
            if folder == "/" {
                break;
            }
            sqlx::query(
                "INSERT OR IGNORE INTO resources (path, parent, resource_type) VALUES (?, ?, 'folder')",
            )
            .bind(folder)
            .bind(parent_path(folder))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            current = parent_path(folder);
        }

        let identity = IdentityColumns::of(properties);
        sqlx::query(
            r#"
            INSERT INTO resources (
                path, parent, resource_type,
                job_id, topic, target_instance, created, finished_state,
                properties
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(path)
        .bind(parent_path(path))
        .bind(resource_type.as_str())
        .bind(identity.job_id)
        .bind(identity.topic)
        .bind(identity.target_instance)
        .bind(identity.created)
        .bind(identity.finished_state)
        .bind(Value::Object(properties.clone()).to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| match map_sqlx_error(e) {
            AppError::Conflict(_) => AppError::Conflict(format!("resource exists: {}", path)),
            other => other,
        })?;

        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(path = %path, resource_type = resource_type.as_str(), "Created resource");
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Option<Resource>> {
        let row = sqlx::query_as::<_, ResourceRow>(&format!(
            "SELECT {} FROM resources WHERE path = ?",
            COLUMNS
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.map(ResourceRow::into_resource))
    }

    async fn update(&self, path: &str, update: &PropertyUpdate) -> Result<bool> {
        let _guard = self.writes.lock().await;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let Some(raw) = Self::fetch_properties(&mut tx, path).await? else {
            return Ok(false);
        };
        let mut properties = match serde_json::from_str::<Value>(&raw)? {
            Value::Object(map) => map,
            _ => {
                return Err(AppError::Store(format!(
                    "properties of {} are not an object",
                    path
                )))
            }
        };
        update.apply(&mut properties);

        let identity = IdentityColumns::of(&properties);
        sqlx::query(
            r#"
            UPDATE resources
            SET job_id = ?, topic = ?, target_instance = ?, created = ?, finished_state = ?,
                properties = ?
            WHERE path = ?
            "#,
        )
        .bind(identity.job_id)
        .bind(identity.topic)
        .bind(identity.target_instance)
        .bind(identity.created)
        .bind(identity.finished_state)
        .bind(Value::Object(properties).to_string())
        .bind(path)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(true)
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let _guard = self.writes.lock().await;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let removed = sqlx::query("DELETE FROM resources WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();
        if removed > 0 {
            let (lower, upper) = descendant_range(path);
            sqlx::query("DELETE FROM resources WHERE path >= ? AND path < ?")
                .bind(lower)
                .bind(upper)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(removed > 0)
    }

    async fn list_children(&self, path: &str) -> Result<Vec<Resource>> {
        let rows = sqlx::query_as::<_, ResourceRow>(&format!(
            "SELECT {} FROM resources WHERE parent = ? ORDER BY path ASC",
            COLUMNS
        ))
        .bind(path.trim_end_matches('/'))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(ResourceRow::into_resource).collect())
    }

    async fn query(&self, query: &StoreQuery) -> Result<Vec<Resource>> {
        let mut builder = build_query(query)?;
        let rows = builder
            .build_query_as::<ResourceRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(ResourceRow::into_resource).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use eventjobs_core::domain::Template;
    use serde_json::json;

    async fn setup_store() -> SqliteResourceStore {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteResourceStore::new(pool)
    }

    fn job_properties(id: &str, topic: &str, created: i64) -> PropertyMap {
        json!({
            keys::JOB_ID: id,
            keys::TOPIC: topic,
            keys::CREATED: created,
            keys::TARGET_INSTANCE: "local",
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_read_and_conflict() {
        let store = setup_store().await;
        let props = job_properties("1", "a/b", 10);
        store
            .create("/jobs/assigned/local/a.b/1", ResourceType::Job, &props)
            .await
            .unwrap();

        let read = store.read("/jobs/assigned/local/a.b/1").await.unwrap().unwrap();
        assert_eq!(read.resource_type, ResourceType::Job);
        assert_eq!(read.properties, props);
        assert!(!read.has_read_errors());

        // Ancestors exist as folders
        let folder = store.read("/jobs/assigned").await.unwrap().unwrap();
        assert_eq!(folder.resource_type, ResourceType::Folder);

        let err = store
            .create("/jobs/assigned/local/a.b/1", ResourceType::Job, &props)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_and_delete_subtree() {
        let store = setup_store().await;
        store
            .create("/jobs/x/1", ResourceType::Job, &job_properties("1", "a", 1))
            .await
            .unwrap();
        store
            .create("/jobs/x10/2", ResourceType::Job, &job_properties("2", "a", 2))
            .await
            .unwrap();

        let update = PropertyUpdate::new()
            .set(keys::STARTED, 99)
            .remove(keys::TARGET_INSTANCE);
        assert!(store.update("/jobs/x/1", &update).await.unwrap());
        assert!(!store.update("/jobs/x/missing", &update).await.unwrap());
        let read = store.read("/jobs/x/1").await.unwrap().unwrap();
        assert_eq!(read.get_i64(keys::STARTED), Some(99));
        assert_eq!(read.get_str(keys::TARGET_INSTANCE), None);

        assert!(store.delete("/jobs/x").await.unwrap());
        assert!(store.read("/jobs/x/1").await.unwrap().is_none());
        // A sibling sharing the name prefix survives
        assert!(store.read("/jobs/x10/2").await.unwrap().is_some());
        assert!(!store.delete("/jobs/x").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_children() {
        let store = setup_store().await;
        for (path, id) in [("/jobs/a/2", "2"), ("/jobs/a/1", "1"), ("/jobs/a/b/3", "3")] {
            store
                .create(path, ResourceType::Job, &job_properties(id, "t", 1))
                .await
                .unwrap();
        }
        let children: Vec<String> = store
            .list_children("/jobs/a/")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(children, vec!["/jobs/a/1", "/jobs/a/2", "/jobs/a/b"]);
    }

    #[tokio::test]
    async fn test_query_filters_and_orders() {
        let store = setup_store().await;
        for (id, topic, created) in [("1", "a/b", 30), ("2", "a/b", 10), ("3", "c/d", 20)] {
            store
                .create(
                    &format!("/jobs/assigned/local/t/{}", id),
                    ResourceType::Job,
                    &job_properties(id, topic, created),
                )
                .await
                .unwrap();
        }
        let mut finished = job_properties("4", "a/b", 5);
        finished.insert(keys::FINISHED_STATE.into(), json!("SUCCEEDED"));
        store
            .create("/jobs/finished/t/4", ResourceType::Job, &finished)
            .await
            .unwrap();

        let query = StoreQuery::new("/jobs")
            .of_type(ResourceType::Job)
            .filter(Predicate::Equals(keys::TOPIC.into(), json!("a/b")))
            .filter(Predicate::Missing(keys::FINISHED_STATE.into()))
            .order_by(keys::CREATED, SortOrder::Ascending);
        let ids: Vec<String> = store
            .query(&query)
            .await
            .unwrap()
            .iter()
            .map(|r| r.get_str(keys::JOB_ID).unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["2", "1"]);

        let mut template = PropertyMap::new();
        template.insert(format!(">={}", keys::CREATED), json!(20));
        let query = StoreQuery::new("/jobs/assigned")
            .any_of(vec![Template::from_properties(&template)])
            .order_by(keys::CREATED, SortOrder::Descending)
            .limit(1);
        let found = store.query(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get_str(keys::JOB_ID), Some("1"));

        let query = StoreQuery::new("/jobs").filter(Predicate::OneOf(
            keys::FINISHED_STATE.into(),
            vec![json!("SUCCEEDED"), json!("STOPPED")],
        ));
        assert_eq!(store.query(&query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_query_matches_in_memory_semantics() {
        let store = setup_store().await;
        let mut props = job_properties("1", "a/b", 1);
        props.insert("flag".into(), json!(true));
        props.insert("label".into(), json!("10"));
        store.create("/jobs/j/1", ResourceType::Job, &props).await.unwrap();
        let stored = store.read("/jobs/j/1").await.unwrap().unwrap();

        let queries = [
            Predicate::Equals("flag".into(), json!(true)),
            Predicate::Equals("flag".into(), json!(1)),
            Predicate::Greater("label".into(), json!(5)),
            Predicate::Greater("label".into(), json!("0")),
            Predicate::Exists("label".into()),
            Predicate::Missing("other".into()),
        ];
        for predicate in queries {
            let query = StoreQuery::new("/jobs").filter(predicate.clone());
            let found = !store.query(&query).await.unwrap().is_empty();
            assert_eq!(found, query.matches(&stored), "{:?}", predicate);
        }
    }

    #[tokio::test]
    async fn test_unsearchable_value_is_unsupported() {
        let store = setup_store().await;
        let query = StoreQuery::new("/jobs").filter(Predicate::Equals("k".into(), json!([1])));
        assert!(store.query(&query).await.unwrap_err().is_unsupported());
    }

    #[tokio::test]
    async fn test_corrupt_row_keeps_identity() {
        let store = setup_store().await;
        sqlx::query(
            "INSERT INTO resources (path, parent, resource_type, job_id, topic, created, properties) \
             VALUES ('/jobs/j/9', '/jobs/j', 'job', '9', 'a/b', 7, '{broken')",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let read = store.read("/jobs/j/9").await.unwrap().unwrap();
        assert!(read.has_read_errors());
        assert_eq!(read.get_str(keys::JOB_ID), Some("9"));
        assert_eq!(read.get_str(keys::TOPIC), Some("a/b"));
        assert_eq!(read.get_i64(keys::CREATED), Some(7));

        // Searched by the indexed columns only
        let query = StoreQuery::new("/jobs").filter(Predicate::Exists(keys::TOPIC.into()));
        let found = store.query(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].has_read_errors());
        let query = StoreQuery::new("/jobs").filter(Predicate::Exists("color".into()));
        assert!(store.query(&query).await.unwrap().is_empty());
        assert_eq!(store.list_children("/jobs/j").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_rows_answer_local_job_search() {
        let store = setup_store().await;
        store
            .create("/jobs/j/1", ResourceType::Job, &job_properties("1", "a/b", 20))
            .await
            .unwrap();
        for (path, id, created, properties) in [
            ("/jobs/j/2", "2", 10, "{broken"),
            ("/jobs/j/3", "3", 30, "[1, 2]"),
            ("/jobs/j/4", "4", 99, "{broken"),
        ] {
            sqlx::query(
                "INSERT INTO resources (path, parent, resource_type, job_id, topic, target_instance, created, properties) \
                 VALUES (?, '/jobs/j', 'job', ?, 'a/b', 'local', ?, ?)",
            )
            .bind(path)
            .bind(id)
            .bind(created)
            .bind(properties)
            .execute(&store.pool)
            .await
            .unwrap();
        }

        let query = StoreQuery::new("/jobs")
            .of_type(ResourceType::Job)
            .filter(Predicate::Equals(keys::TARGET_INSTANCE.into(), json!("local")))
            .filter(Predicate::Less(keys::CREATED.into(), json!(50)))
            .filter(Predicate::Missing(keys::FINISHED_STATE.into()))
            .order_by(keys::CREATED, SortOrder::Ascending);
        let found = store.query(&query).await.unwrap();
        let paths: Vec<&str> = found.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/jobs/j/2", "/jobs/j/1", "/jobs/j/3"]);
        assert!(found[0].has_read_errors());
        assert!(!found[1].has_read_errors());
        assert!(found[2].has_read_errors());

        let other = StoreQuery::new("/jobs")
            .filter(Predicate::Equals(keys::TARGET_INSTANCE.into(), json!("remote")));
        assert!(store.query(&other).await.unwrap().is_empty());
    }
}
