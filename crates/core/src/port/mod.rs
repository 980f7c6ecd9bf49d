// Port Layer - Interfaces for external dependencies

pub mod consumer;
pub mod identity;
pub mod resource_store;
pub mod time_provider; // For deterministic testing

// Re-exports
pub use consumer::{AsyncCompletion, JobConsumer, JobExecutionContext, JobResult, PendingCompletion};
pub use identity::InstanceIdentity;
pub use resource_store::{PropertyUpdate, ResourceStore, StoreQuery};
pub use time_provider::{SystemTimeProvider, TimeProvider};
