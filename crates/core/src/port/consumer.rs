// Job Consumer Port (Interface)
// Pluggable handlers that execute jobs for the topics they register

use crate::domain::Job;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{oneshot, watch};

/// Outcome reported by a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Succeeded,
    /// Do not retry
    Cancelled,
    /// Retry according to the queue policy, optionally overriding the delay
    Failed { retry_delay_ms: Option<i64> },
    /// Completion arrives later through [`AsyncCompletion`]
    Async,
}

impl JobResult {
    pub fn failed() -> Self {
        JobResult::Failed {
            retry_delay_ms: None,
        }
    }

    pub fn failed_with_delay(retry_delay_ms: i64) -> Self {
        JobResult::Failed {
            retry_delay_ms: Some(retry_delay_ms),
        }
    }
}

type CompletionSlot = Mutex<Option<oneshot::Sender<JobResult>>>;

/// Handle used by asynchronous consumers to report the final result
#[derive(Clone)]
pub struct AsyncCompletion {
    slot: Arc<CompletionSlot>,
}

impl AsyncCompletion {
    /// Create a handle plus the receiving end the queue waits on
    pub fn channel() -> (Self, oneshot::Receiver<JobResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Report the final result; only the first call counts
    ///
    /// # Errors
    /// - AppError::InvalidState if already finished or `result` is `Async`
    pub fn finish(&self, result: JobResult) -> Result<()> {
        if result == JobResult::Async {
            return Err(AppError::InvalidState(
                "async completion cannot report ASYNC".to_string(),
            ));
        }
        finish_slot(&self.slot, result)
    }

    pub fn is_finished(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| slot.is_none())
            .unwrap_or(true)
    }

    /// Observer that does not keep the job pending
    pub fn downgrade(&self) -> PendingCompletion {
        PendingCompletion {
            slot: Arc::downgrade(&self.slot),
        }
    }
}

/// Weak view of an outstanding async completion
#[derive(Clone)]
pub struct PendingCompletion {
    slot: Weak<CompletionSlot>,
}

impl PendingCompletion {
    /// Fail the job if the consumer still holds its completion
    pub fn fail(&self) -> bool {
        match self.slot.upgrade() {
            Some(slot) => finish_slot(&slot, JobResult::failed()).is_ok(),
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot
            .upgrade()
            .map_or(false, |slot| slot.lock().map(|s| s.is_some()).unwrap_or(false))
    }
}

fn finish_slot(slot: &CompletionSlot, result: JobResult) -> Result<()> {
    let sender = slot
        .lock()
        .map_err(|_| AppError::Internal("completion lock poisoned".to_string()))?
        .take()
        .ok_or_else(|| AppError::InvalidState("job already finished".to_string()))?;
    // Receiver gone means the queue was closed; the record stays for reload
    let _ = sender.send(result);
    Ok(())
}

/// Per-execution context handed to consumers
#[derive(Clone)]
pub struct JobExecutionContext {
    stopped: watch::Receiver<bool>,
    completion: AsyncCompletion,
    message: Arc<Mutex<Option<String>>>,
}

impl JobExecutionContext {
    pub fn new(
        stopped: watch::Receiver<bool>,
        completion: AsyncCompletion,
        message: Arc<Mutex<Option<String>>>,
    ) -> Self {
        Self {
            stopped,
            completion,
            message,
        }
    }

    /// True once a stop was requested for this job
    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Wait until a stop is requested
    pub async fn stopped(&mut self) {
        let _ = self.stopped.wait_for(|stopped| *stopped).await;
    }

    pub fn async_completion(&self) -> AsyncCompletion {
        self.completion.clone()
    }

    /// Message stored with the job when it is rescheduled or finished
    pub fn set_result_message(&self, message: impl Into<String>) {
        if let Ok(mut slot) = self.message.lock() {
            *slot = Some(message.into());
        }
    }
}

/// Job Consumer trait
#[async_trait]
pub trait JobConsumer: Send + Sync {
    async fn process(&self, job: &Job, context: JobExecutionContext) -> JobResult;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Mock consumer behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Return the result right away
        Return(JobResult),
        /// Sleep, then return the result
        Delay(u64, JobResult),
        /// Wait for a stop request, then report CANCELLED
        WaitForStop,
        /// Return ASYNC and finish from a spawned task after the delay
        Async(u64, JobResult),
        /// Panic (for panic isolation testing)
        Panic(String),
    }

    /// Mock Job Consumer for testing
    pub struct MockConsumer {
        script: Mutex<VecDeque<MockBehavior>>,
        fallback: MockBehavior,
        processed: Mutex<Vec<Job>>,
    }

    impl MockConsumer {
        pub fn new(behavior: MockBehavior) -> Self {
            Self::scripted(Vec::new(), behavior)
        }

        pub fn new_success() -> Self {
            Self::new(MockBehavior::Return(JobResult::Succeeded))
        }

        pub fn new_fail() -> Self {
            Self::new(MockBehavior::Return(JobResult::failed_with_delay(0)))
        }

        /// Play `script` in order, then keep using `fallback`
        pub fn scripted(script: Vec<MockBehavior>, fallback: MockBehavior) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                processed: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.processed.lock().unwrap().len()
        }

        /// Snapshots of every job handed to this consumer
        pub fn processed(&self) -> Vec<Job> {
            self.processed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobConsumer for MockConsumer {
        async fn process(&self, job: &Job, mut context: JobExecutionContext) -> JobResult {
            self.processed.lock().unwrap().push(job.clone());
            let behavior = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());

            match behavior {
                MockBehavior::Return(result) => result,
                MockBehavior::Delay(ms, result) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    result
                }
                MockBehavior::WaitForStop => {
                    context.stopped().await;
                    JobResult::Cancelled
                }
                MockBehavior::Async(ms, result) => {
                    let completion = context.async_completion();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        let _ = completion.finish(result);
                    });
                    JobResult::Async
                }
                MockBehavior::Panic(message) => panic!("{}", message),
            }
        }
    }
}
