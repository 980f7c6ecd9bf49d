// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid job record at {path}: {reason}")]
    InvalidJobRecord { path: String, reason: String },

    #[error("Invalid queue configuration '{name}': {reason}")]
    InvalidQueueConfig { name: String, reason: String },

    #[error("Unknown finished state: {0}")]
    UnknownState(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
