// In-memory handle of one queued or running job
use crate::domain::{Job, JobId};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

const NOT_DISPATCHED: i64 = -1;

pub struct JobHandler {
    job: Mutex<Job>,
    stop: watch::Sender<bool>,
    message: Arc<Mutex<Option<String>>>,
    dispatched_at: AtomicI64,
}

impl JobHandler {
    pub fn new(job: Job) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            job: Mutex::new(job),
            stop,
            message: Arc::new(Mutex::new(None)),
            dispatched_at: AtomicI64::new(NOT_DISPATCHED),
        })
    }

    /// Snapshot of the job
    pub fn job(&self) -> Job {
        self.job.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn id(&self) -> JobId {
        self.job.lock().unwrap_or_else(|p| p.into_inner()).id.clone()
    }

    pub fn topic(&self) -> String {
        self.job.lock().unwrap_or_else(|p| p.into_inner()).topic.clone()
    }

    pub fn set_job(&self, job: Job) {
        *self.job.lock().unwrap_or_else(|p| p.into_inner()) = job;
    }

    /// Request a cooperative stop
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn stop_receiver(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn message_slot(&self) -> Arc<Mutex<Option<String>>> {
        Arc::clone(&self.message)
    }

    pub fn take_message(&self) -> Option<String> {
        self.message.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    pub fn mark_dispatched(&self, now: i64) {
        self.dispatched_at.store(now, Ordering::Release);
    }

    pub fn clear_dispatched(&self) {
        self.dispatched_at.store(NOT_DISPATCHED, Ordering::Release);
    }

    pub fn dispatched_at(&self) -> Option<i64> {
        match self.dispatched_at.load(Ordering::Acquire) {
            NOT_DISPATCHED => None,
            at => Some(at),
        }
    }
}
