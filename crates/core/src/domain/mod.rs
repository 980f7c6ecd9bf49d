// Domain Layer - Pure job processing entities

pub mod error;
pub mod filter;
pub mod job;
pub mod queue;
pub mod resource;
pub mod statistics;
pub mod topic;
pub mod topology;

// Re-exports
pub use error::DomainError;
pub use filter::{Predicate, QueryType, SortOrder, Template};
pub use job::{keys, Job, JobId, JobProperties, JobState};
pub use queue::{QueueConfig, QueueInfo, QueuePriority, QueueType};
pub use resource::{PropertyMap, Resource, ResourceType};
pub use statistics::{Statistics, TopicStatistics};
pub use topic::TopicMatcher;
pub use topology::{
    InstanceDescription, TopologyCapabilities, TopologyEvent, TopologyEventKind, TopologyView,
};
