//! Topic syntax and topic matching.
//!
//! Topics are `/`-separated tokens of `[A-Za-z0-9_-]`. Matchers come in four
//! flavours: `*` (everything), `a/b/*` (every descendant of `a/b`),
//! `a/b/.` (direct children of `a/b` only) and plain exact topics.

use crate::domain::error::DomainError;

/// Universal bridge topic registered by consumers that take bridged events
pub const BRIDGE_TOPIC: &str = "/";

/// Check event-topic syntax
pub fn validate(topic: &str) -> Result<(), DomainError> {
    if topic.is_empty() {
        return Err(DomainError::InvalidTopic("topic is empty".to_string()));
    }
    for token in topic.split('/') {
        if token.is_empty() {
            return Err(DomainError::InvalidTopic(format!(
                "empty token in '{}'",
                topic
            )));
        }
        if !token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(DomainError::InvalidTopic(format!(
                "illegal character in '{}'",
                topic
            )));
        }
    }
    Ok(())
}

pub fn is_valid(topic: &str) -> bool {
    validate(topic).is_ok()
}

/// Flat path segment for a topic (`a/b/c` -> `a.b.c`)
pub fn flatten(topic: &str) -> String {
    topic.replace('/', ".")
}

/// Category wildcard of a topic (`a/b/c` -> `a/b/*`)
pub fn category(topic: &str) -> Option<String> {
    topic.rfind('/').map(|pos| format!("{}*", &topic[..=pos]))
}

/// Compiled topic pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicMatcher {
    Any,
    Exact(String),
    /// Direct children of the package; stored with trailing `/`
    Package(String),
    /// All descendants of the package; stored with trailing `/`
    SubPackage(String),
}

impl TopicMatcher {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern == "*" {
            TopicMatcher::Any
        } else if let Some(prefix) = pattern.strip_suffix('.') {
            TopicMatcher::Package(prefix.to_string())
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            TopicMatcher::SubPackage(prefix.to_string())
        } else {
            TopicMatcher::Exact(pattern.to_string())
        }
    }

    /// Match a topic, returning the unmatched remainder (used for `{0}` names)
    pub fn match_topic(&self, topic: &str) -> Option<String> {
        match self {
            TopicMatcher::Any => Some(topic.to_string()),
            TopicMatcher::Exact(exact) => (exact == topic).then(String::new),
            TopicMatcher::Package(package) => {
                let pos = topic.rfind('/')?;
                (&topic[..=pos] == package).then(|| topic[pos + 1..].to_string())
            }
            TopicMatcher::SubPackage(package) => {
                let pos = topic.rfind('/')?;
                topic[..=pos]
                    .starts_with(package.as_str())
                    .then(|| topic[package.len()..].to_string())
            }
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.match_topic(topic).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic() {
        assert!(is_valid("test/topic"));
        assert!(is_valid("a"));
        assert!(is_valid("org/apache-x/job_1"));
        assert!(!is_valid(""));
        assert!(!is_valid("/a"));
        assert!(!is_valid("a/"));
        assert!(!is_valid("a//b"));
        assert!(!is_valid("a/b c"));
    }

    #[test]
    fn test_flatten_and_category() {
        assert_eq!(flatten("a/b/c"), "a.b.c");
        assert_eq!(category("a/b/c"), Some("a/b/*".to_string()));
        assert_eq!(category("a"), None);
    }

    #[test]
    fn test_matchers() {
        let package = TopicMatcher::parse("a/b/.");
        assert_eq!(package.match_topic("a/b/c"), Some("c".to_string()));
        assert!(!package.matches("a/b/c/d"));

        let sub = TopicMatcher::parse("a/b/*");
        assert_eq!(sub.match_topic("a/b/c/d"), Some("c/d".to_string()));
        assert!(sub.matches("a/b/c"));
        assert!(!sub.matches("a/x"));

        assert_eq!(TopicMatcher::parse("a/b").match_topic("a/b"), Some(String::new()));
        assert!(TopicMatcher::parse("*").matches("anything/at/all"));
    }
}
