// Stored record shape shared by the store port and the job model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Property bag of one stored record
pub type PropertyMap = Map<String, Value>;

/// Kind of node in the resource tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Folder,
    Job,
    Lock,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Folder => "folder",
            ResourceType::Job => "job",
            ResourceType::Lock => "lock",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "folder" => Some(ResourceType::Folder),
            "job" => Some(ResourceType::Job),
            "lock" => Some(ResourceType::Lock),
            _ => None,
        }
    }
}

/// One node of the resource tree
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub path: String,
    pub resource_type: ResourceType,
    pub properties: PropertyMap,
    /// Properties the store could not decode. A record with read errors
    /// is deferred by the loader instead of being processed.
    pub read_errors: Vec<String>,
}

impl Resource {
    pub fn new(path: impl Into<String>, resource_type: ResourceType, properties: PropertyMap) -> Self {
        Self {
            path: path.into(),
            resource_type,
            properties,
            read_errors: Vec::new(),
        }
    }

    /// Last path segment
    pub fn name(&self) -> &str {
        name_of(&self.path)
    }

    pub fn has_read_errors(&self) -> bool {
        !self.read_errors.is_empty()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.properties.get(key).and_then(Value::as_i64)
    }
}

/// Parent of a path, `None` for the root or a single segment
pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) if trimmed.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(pos) => Some(&trimmed[..pos]),
    }
}

/// Last segment of a path
pub fn name_of(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent_path("/var/jobs/a"), Some("/var/jobs"));
        assert_eq!(parent_path("/var"), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(name_of("/var/jobs/a"), "a");
        assert_eq!(name_of("/var/jobs/a/"), "a");
    }
}
