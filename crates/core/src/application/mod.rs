// Application Layer - job manager, queues and the services around them

pub mod background_loader;
pub mod config;
pub mod configuration;
pub mod consumer_manager;
pub mod job_manager;
pub mod maintenance;
pub mod notification;
pub mod persistence;
pub mod queue;
pub mod queue_config;
pub mod retry;
pub mod worker;

// Re-exports
pub use background_loader::{BackgroundLoader, JobProcessor};
pub use config::EngineConfig;
pub use configuration::JobManagerConfiguration;
pub use consumer_manager::JobConsumerManager;
pub use job_manager::{JobBuilder, JobManager};
pub use maintenance::CleanupScheduler;
pub use notification::{JobEvents, JobNotification, NotificationKind};
pub use persistence::JobPersistence;
pub use queue::{JobQueue, QueueStateInfo};
pub use queue_config::QueueConfigurationManager;
pub use retry::RetryPolicy;
pub use worker::{shutdown_channel, ShutdownSender, ShutdownToken};
