// Typed query predicates for job lookups
//
// Templates arrive as property maps whose keys may carry an operator
// prefix (`=`, `<`, `<=`, `>`, `>=`). They are parsed once into
// predicates; stores never see raw operator strings.

use crate::domain::error::DomainError;
use crate::domain::job::JobState;
use crate::domain::resource::PropertyMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Equals(String, Value),
    Less(String, Value),
    LessOrEqual(String, Value),
    Greater(String, Value),
    GreaterOrEqual(String, Value),
    Exists(String),
    Missing(String),
    OneOf(String, Vec<Value>),
}

impl Predicate {
    /// Parse one template entry, e.g. `("<=event.job.created", 42)`
    pub fn from_template_entry(key: &str, value: Value) -> Predicate {
        if let Some(key) = key.strip_prefix("<=") {
            Predicate::LessOrEqual(key.to_string(), value)
        } else if let Some(key) = key.strip_prefix(">=") {
            Predicate::GreaterOrEqual(key.to_string(), value)
        } else if let Some(key) = key.strip_prefix('<') {
            Predicate::Less(key.to_string(), value)
        } else if let Some(key) = key.strip_prefix('>') {
            Predicate::Greater(key.to_string(), value)
        } else {
            let key = key.strip_prefix('=').unwrap_or(key);
            Predicate::Equals(key.to_string(), value)
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Predicate::Equals(key, _)
            | Predicate::Less(key, _)
            | Predicate::LessOrEqual(key, _)
            | Predicate::Greater(key, _)
            | Predicate::GreaterOrEqual(key, _)
            | Predicate::Exists(key)
            | Predicate::Missing(key)
            | Predicate::OneOf(key, _) => key,
        }
    }

    pub fn matches(&self, properties: &PropertyMap) -> bool {
        let actual = properties.get(self.key());
        match self {
            Predicate::Exists(_) => actual.is_some(),
            Predicate::Missing(_) => actual.is_none(),
            Predicate::Equals(_, expected) => {
                actual.map_or(false, |v| compare(v, expected) == Some(Ordering::Equal))
            }
            Predicate::OneOf(_, values) => actual.map_or(false, |v| {
                values
                    .iter()
                    .any(|expected| compare(v, expected) == Some(Ordering::Equal))
            }),
            Predicate::Less(_, bound) => matches!(ordering(actual, bound), Some(Ordering::Less)),
            Predicate::LessOrEqual(_, bound) => matches!(
                ordering(actual, bound),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Predicate::Greater(_, bound) => {
                matches!(ordering(actual, bound), Some(Ordering::Greater))
            }
            Predicate::GreaterOrEqual(_, bound) => matches!(
                ordering(actual, bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

fn ordering(actual: Option<&Value>, bound: &Value) -> Option<Ordering> {
    actual.and_then(|v| compare(v, bound))
}

/// Compare two JSON scalars of the same kind
pub fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// A conjunction of predicates; several templates are OR'ed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Template {
    predicates: Vec<Predicate>,
}

impl Template {
    pub fn new(predicates: Vec<Predicate>) -> Self {
        Self { predicates }
    }

    pub fn from_properties(properties: &PropertyMap) -> Self {
        Self::new(
            properties
                .iter()
                .map(|(key, value)| Predicate::from_template_entry(key, value.clone()))
                .collect(),
        )
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn matches(&self, properties: &PropertyMap) -> bool {
        self.predicates.iter().all(|p| p.matches(properties))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Job query selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryType {
    All,
    Active,
    Queued,
    History,
    Cancelled,
    Succeeded,
    Stopped,
    GivenUp,
    Error,
    Dropped,
}

impl QueryType {
    /// History queries look at finished records only
    pub fn is_history(&self) -> bool {
        !matches!(self, QueryType::All | QueryType::Active | QueryType::Queued)
    }

    /// Finished states selected by a history query (`None` = any)
    pub fn finished_states(&self) -> Option<Vec<JobState>> {
        match self {
            QueryType::Cancelled => Some(vec![
                JobState::Dropped,
                JobState::Error,
                JobState::GivenUp,
                JobState::Stopped,
                JobState::Cancelled,
            ]),
            QueryType::Succeeded => Some(vec![JobState::Succeeded]),
            QueryType::Stopped => Some(vec![JobState::Stopped]),
            QueryType::GivenUp => Some(vec![JobState::GivenUp]),
            QueryType::Error => Some(vec![JobState::Error]),
            QueryType::Dropped => Some(vec![JobState::Dropped]),
            _ => None,
        }
    }
}

impl FromStr for QueryType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ALL" => Ok(QueryType::All),
            "ACTIVE" => Ok(QueryType::Active),
            "QUEUED" => Ok(QueryType::Queued),
            "HISTORY" => Ok(QueryType::History),
            "CANCELLED" => Ok(QueryType::Cancelled),
            "SUCCEEDED" => Ok(QueryType::Succeeded),
            "STOPPED" => Ok(QueryType::Stopped),
            "GIVEN_UP" => Ok(QueryType::GivenUp),
            "ERROR" => Ok(QueryType::Error),
            "DROPPED" => Ok(QueryType::Dropped),
            other => Err(DomainError::ValidationError(format!(
                "unknown query type: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> PropertyMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_operator_prefixes() {
        assert_eq!(
            Predicate::from_template_entry("<=created", json!(5)),
            Predicate::LessOrEqual("created".into(), json!(5))
        );
        assert_eq!(
            Predicate::from_template_entry(">created", json!(5)),
            Predicate::Greater("created".into(), json!(5))
        );
        assert_eq!(
            Predicate::from_template_entry("=name", json!("x")),
            Predicate::Equals("name".into(), json!("x"))
        );
        assert_eq!(
            Predicate::from_template_entry("name", json!("x")),
            Predicate::Equals("name".into(), json!("x"))
        );
    }

    #[test]
    fn test_template_matching() {
        let record = props(json!({"created": 10, "owner": "alice"}));

        let template = Template::from_properties(&props(json!({">=created": 10, "owner": "alice"})));
        assert!(template.matches(&record));

        let template = Template::from_properties(&props(json!({"<created": 10})));
        assert!(!template.matches(&record));

        // Mismatched kinds never match
        let template = Template::from_properties(&props(json!({"owner": 3})));
        assert!(!template.matches(&record));
    }

    #[test]
    fn test_query_type_classification() {
        assert!(!QueryType::Active.is_history());
        assert!(QueryType::History.is_history());
        assert_eq!(QueryType::History.finished_states(), None);
        assert!(QueryType::Cancelled
            .finished_states()
            .unwrap()
            .contains(&JobState::GivenUp));
        assert_eq!("given_up".parse::<QueryType>().unwrap(), QueryType::GivenUp);
    }
}
