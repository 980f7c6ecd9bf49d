// Resource Store Port (Interface)
// Tree-structured durable storage keyed by path

use crate::domain::filter::{compare, Predicate, SortOrder, Template};
use crate::domain::resource::{PropertyMap, Resource, ResourceType};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;

/// Changes applied to one record in a single read-modify-commit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyUpdate {
    pub set: PropertyMap,
    pub remove: Vec<String>,
}

impl PropertyUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set.insert(key.to_string(), value.into());
        self
    }

    pub fn remove(mut self, key: &str) -> Self {
        self.remove.push(key.to_string());
        self
    }

    /// Apply to a property map in place
    pub fn apply(&self, properties: &mut PropertyMap) {
        for key in &self.remove {
            properties.remove(key);
        }
        for (key, value) in &self.set {
            properties.insert(key.clone(), value.clone());
        }
    }
}

/// Filtered, ordered search below a path
#[derive(Debug, Clone, PartialEq)]
pub struct StoreQuery {
    pub path_prefix: String,
    pub resource_type: Option<ResourceType>,
    /// All must hold
    pub filter: Vec<Predicate>,
    /// At least one must hold (ignored when empty)
    pub any_of: Vec<Template>,
    pub order_by: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl StoreQuery {
    pub fn new(path_prefix: impl Into<String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            resource_type: None,
            filter: Vec::new(),
            any_of: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn of_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = Some(resource_type);
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter.push(predicate);
        self
    }

    pub fn any_of(mut self, templates: Vec<Template>) -> Self {
        self.any_of = templates.into_iter().filter(|t| !t.is_empty()).collect();
        self
    }

    pub fn order_by(mut self, key: &str, order: SortOrder) -> Self {
        self.order_by = Some((key.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True if the resource lies below the prefix and passes every filter
    pub fn matches(&self, resource: &Resource) -> bool {
        let below = resource
            .path
            .strip_prefix(self.path_prefix.trim_end_matches('/'))
            .map_or(false, |rest| rest.starts_with('/'));
        below
            && self.resource_type.map_or(true, |t| t == resource.resource_type)
            && self.filter.iter().all(|p| p.matches(&resource.properties))
            && (self.any_of.is_empty()
                || self.any_of.iter().any(|t| t.matches(&resource.properties)))
    }

    /// Sort then truncate according to `order_by` and `limit`
    pub fn arrange(&self, resources: &mut Vec<Resource>) {
        if let Some((key, order)) = &self.order_by {
            resources.sort_by(|a, b| {
                let ordering = match (a.properties.get(key), b.properties.get(key)) {
                    (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                match order {
                    SortOrder::Ascending => ordering,
                    SortOrder::Descending => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = self.limit {
            resources.truncate(limit);
        }
    }
}

/// Resource store trait
///
/// Implementations:
/// - SqliteResourceStore (infra-sqlite)
/// - mocks::InMemoryResourceStore (tests)
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Create a record; missing ancestors become folders
    ///
    /// # Errors
    /// - AppError::Conflict if the path already exists
    async fn create(
        &self,
        path: &str,
        resource_type: ResourceType,
        properties: &PropertyMap,
    ) -> Result<()>;

    async fn read(&self, path: &str) -> Result<Option<Resource>>;

    /// Read-modify-commit of one record; `false` if it does not exist
    async fn update(&self, path: &str, update: &PropertyUpdate) -> Result<bool>;

    /// Delete a record and its descendants; `false` if it does not exist
    async fn delete(&self, path: &str) -> Result<bool>;

    /// Direct children, folders included
    async fn list_children(&self, path: &str) -> Result<Vec<Resource>>;

    /// Indexed search
    ///
    /// # Errors
    /// - AppError::Unsupported if the store refuses the query
    async fn query(&self, query: &StoreQuery) -> Result<Vec<Resource>>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::resource::parent_path;
    use crate::error::AppError;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::Mutex;

    /// In-memory tree store
    pub struct InMemoryResourceStore {
        records: Mutex<BTreeMap<String, Resource>>,
        search_supported: AtomicBool,
        fail_writes: AtomicBool,
    }

    impl Default for InMemoryResourceStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl InMemoryResourceStore {
        pub fn new() -> Self {
            Self {
                records: Mutex::new(BTreeMap::new()),
                search_supported: AtomicBool::new(true),
                fail_writes: AtomicBool::new(false),
            }
        }

        /// Store whose `query` always reports an unsupported search
        pub fn without_search() -> Self {
            let store = Self::new();
            store.search_supported.store(false, AtomicOrdering::SeqCst);
            store
        }

        /// Make every create/update/delete fail
        pub fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, AtomicOrdering::SeqCst);
        }

        /// Put a record as-is (ancestors included), bypassing conflict checks
        pub fn insert_raw(&self, resource: Resource) {
            let mut records = self.records.lock().unwrap();
            Self::ensure_ancestors(&mut records, &resource.path);
            records.insert(resource.path.clone(), resource);
        }

        pub fn paths_of_type(&self, resource_type: ResourceType) -> Vec<String> {
            self.records
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.resource_type == resource_type)
                .map(|r| r.path.clone())
                .collect()
        }

        fn ensure_ancestors(records: &mut BTreeMap<String, Resource>, path: &str) {
            let mut current = parent_path(path);
            while let Some(parent) = current {
                if parent == "/" {
                    break;
                }
                records.entry(parent.to_string()).or_insert_with(|| {
                    Resource::new(parent, ResourceType::Folder, PropertyMap::new())
                });
                current = parent_path(parent);
            }
        }

        fn check_writable(&self) -> Result<()> {
            if self.fail_writes.load(AtomicOrdering::SeqCst) {
                return Err(AppError::Store("simulated write failure".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ResourceStore for InMemoryResourceStore {
        async fn create(
            &self,
            path: &str,
            resource_type: ResourceType,
            properties: &PropertyMap,
        ) -> Result<()> {
            self.check_writable()?;
            let mut records = self.records.lock().unwrap();
            if records.contains_key(path) {
                return Err(AppError::Conflict(format!("resource exists: {}", path)));
            }
            Self::ensure_ancestors(&mut records, path);
            records.insert(
                path.to_string(),
                Resource::new(path, resource_type, properties.clone()),
            );
            Ok(())
        }

        async fn read(&self, path: &str) -> Result<Option<Resource>> {
            Ok(self.records.lock().unwrap().get(path).cloned())
        }

        async fn update(&self, path: &str, update: &PropertyUpdate) -> Result<bool> {
            self.check_writable()?;
            let mut records = self.records.lock().unwrap();
            match records.get_mut(path) {
                Some(resource) => {
                    update.apply(&mut resource.properties);
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn delete(&self, path: &str) -> Result<bool> {
            self.check_writable()?;
            let mut records = self.records.lock().unwrap();
            let existed = records.remove(path).is_some();
            let descendant_prefix = format!("{}/", path);
            records.retain(|key, _| !key.starts_with(&descendant_prefix));
            Ok(existed)
        }

        async fn list_children(&self, path: &str) -> Result<Vec<Resource>> {
            let parent = path.trim_end_matches('/');
            Ok(self
                .records
                .lock()
                .unwrap()
                .values()
                .filter(|r| parent_path(&r.path) == Some(parent))
                .cloned()
                .collect())
        }

        async fn query(&self, query: &StoreQuery) -> Result<Vec<Resource>> {
            if !self.search_supported.load(AtomicOrdering::SeqCst) {
                return Err(AppError::Unsupported(
                    "search disabled for this store".to_string(),
                ));
            }
            let mut found: Vec<Resource> = self
                .records
                .lock()
                .unwrap()
                .values()
                .filter(|r| query.matches(r))
                .cloned()
                .collect();
            query.arrange(&mut found);
            Ok(found)
        }
    }
}
