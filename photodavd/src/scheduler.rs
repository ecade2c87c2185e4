use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use serde_json::Value;
use tokio::sync::watch;

/// Cooperative cancellation token polled by workers at iteration
/// boundaries.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Enqueued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub name: String,
    pub state: JobState,
    pub output: Option<Value>,
    pub error_code: Option<String>,
}

impl JobSnapshot {
    pub fn is_active(&self) -> bool {
        matches!(self.state, JobState::Enqueued | JobState::Running)
    }
}

/// What to do when a job with the same name is already enqueued or
/// running: keep the existing run, or cancel it and start fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    Keep,
    Replace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub code: String,
    pub message: String,
}

impl JobFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

pub type JobResult = Result<Value, JobFailure>;

struct JobSlot {
    sender: watch::Sender<Option<JobSnapshot>>,
    cancel: CancelFlag,
    generation: u64,
}

/// Named unique jobs over tokio tasks. Each name holds at most one
/// live run; a replaced run keeps executing until it observes its
/// cancel flag, but its state updates no longer win.
#[derive(Clone)]
pub struct JobScheduler {
    jobs: Arc<Mutex<HashMap<String, JobSlot>>>,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Enqueues a run under `name` unless a live run exists and the
    /// policy is Keep. Returns whether a new run was started.
    pub fn enqueue_unique<F, Fut>(&self, name: &str, policy: DedupPolicy, make: F) -> bool
    where
        F: FnOnce(CancelFlag) -> Fut,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let (cancel, generation) = {
            let mut jobs = self.lock_jobs();
            let slot = jobs.entry(name.to_string()).or_insert_with(|| JobSlot {
                sender: watch::channel(None).0,
                cancel: CancelFlag::new(),
                generation: 0,
            });
            let live = slot.sender.borrow().as_ref().is_some_and(JobSnapshot::is_active);
            if live {
                match policy {
                    DedupPolicy::Keep => return false,
                    DedupPolicy::Replace => slot.cancel.stop(),
                }
            }
            slot.generation += 1;
            slot.cancel = CancelFlag::new();
            let generation = slot.generation;
            slot.sender.send_replace(Some(JobSnapshot {
                name: name.to_string(),
                state: JobState::Enqueued,
                output: None,
                error_code: None,
            }));
            (slot.cancel.clone(), generation)
        };

        let scheduler = self.clone();
        let job_name = name.to_string();
        let future = make(cancel.clone());
        tokio::spawn(async move {
            scheduler.publish(&job_name, generation, JobState::Running, None, None);
            let result = future.await;
            if cancel.is_stopped() {
                scheduler.publish(&job_name, generation, JobState::Cancelled, None, None);
                return;
            }
            match result {
                Ok(output) => scheduler.publish(
                    &job_name,
                    generation,
                    JobState::Succeeded,
                    Some(output),
                    None,
                ),
                Err(failure) => {
                    tracing::warn!(job = %job_name, code = %failure.code, "job failed: {}", failure.message);
                    scheduler.publish(
                        &job_name,
                        generation,
                        JobState::Failed,
                        None,
                        Some(failure.code),
                    );
                }
            }
        });
        true
    }

    pub fn cancel(&self, name: &str) {
        let jobs = self.lock_jobs();
        if let Some(slot) = jobs.get(name) {
            slot.cancel.stop();
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<JobSnapshot> {
        let jobs = self.lock_jobs();
        jobs.get(name).and_then(|slot| slot.sender.borrow().clone())
    }

    pub fn observe(&self, name: &str) -> watch::Receiver<Option<JobSnapshot>> {
        let mut jobs = self.lock_jobs();
        let slot = jobs.entry(name.to_string()).or_insert_with(|| JobSlot {
            sender: watch::channel(None).0,
            cancel: CancelFlag::new(),
            generation: 0,
        });
        slot.sender.subscribe()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.snapshot(name).is_some_and(|snapshot| snapshot.is_active())
    }

    fn publish(
        &self,
        name: &str,
        generation: u64,
        state: JobState,
        output: Option<Value>,
        error_code: Option<String>,
    ) {
        let jobs = self.lock_jobs();
        let Some(slot) = jobs.get(name) else {
            return;
        };
        // A replaced run must not clobber its successor's state.
        if slot.generation != generation {
            return;
        }
        slot.sender.send_replace(Some(JobSnapshot {
            name: name.to_string(),
            state,
            output,
            error_code,
        }));
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobSlot>> {
        match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}
