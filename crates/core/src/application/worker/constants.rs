// Engine constants (no magic values)
use std::time::Duration;

/// Default root of the job tree
pub const DEFAULT_REPOSITORY_PATH: &str = "/var/eventing/jobs";

/// Default settle time before the first background load pass (10s)
pub const DEFAULT_BACKGROUND_LOAD_DELAY_SECS: u64 = 10;

/// Default cleanup cycle period (1 minute)
pub const DEFAULT_CLEANUP_PERIOD_SECS: u64 = 60;

/// Every n-th cleanup run evicts idle queues
pub const FULL_CLEANUP_EVERY_N_RUNS: u64 = 5;

/// Dispatched jobs whose start could not be recorded are re-queued after this (60s)
pub const UNPROCESSED_JOB_TIMEOUT_MS: i64 = 60 * 1000;

/// Suspended queues resume on their own after this (60 minutes)
pub const MAX_SUSPEND_MS: i64 = 60 * 60 * 1000;

/// Poll interval while a queue is suspended (1s)
pub const SUSPEND_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Backoff between forced removal attempts (50ms)
pub const FORCE_REMOVE_BACKOFF: Duration = Duration::from_millis(50);

/// Upper bound of forced removal attempts (5s worth of backoff)
pub const FORCE_REMOVE_MAX_ATTEMPTS: u32 = 100;

/// Buffered notifications per subscriber
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;

/// Graceful process shutdown timeout (5 seconds), used by command consumers
pub const GRACEFUL_SHUTDOWN_TIMEOUT_MS: i64 = 5000;
