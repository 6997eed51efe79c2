//! Bounded release reconciliation.
//!
//! Each enqueued release gets one task. A task waits for an admission slot, then polls the
//! release status until it is terminal, sleeping `wait_time` between polls. Enqueueing a
//! release that already has a live task supersedes it: the old task is cancelled wherever it
//! is suspended and its permit goes back to the pool when its future drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use appdeck_core::ReleaseId;
use serde::Serialize;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::options::ReleaseControllerOptions;

/// Status reported by the downstream release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleasePhase {
    Ready,
    Failed(String),
    Pending,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PollError {
    #[error("release {0} not found")]
    NotFound(String),
    #[error("status fetch failed: {0}")]
    Transient(String),
}

/// Final result of a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Succeeded,
    Failed(String),
}

#[async_trait::async_trait]
pub trait ReleaseStatusProvider: Send + Sync {
    async fn fetch(&self, id: &ReleaseId) -> Result<ReleasePhase, PollError>;
}

/// Receives terminal outcomes, typically to write them back to the remote store.
#[async_trait::async_trait]
pub trait StatusSink: Send + Sync {
    async fn report(&self, id: &ReleaseId, outcome: &Outcome) -> anyhow::Result<()>;
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait::async_trait]
impl StatusSink for LogSink {
    async fn report(&self, id: &ReleaseId, outcome: &Outcome) -> anyhow::Result<()> {
        info!(release = %id, outcome = ?outcome, "reconcile: outcome");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed(String),
    Superseded,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool { !matches!(self, TaskState::Pending | TaskState::Running) }
}

impl From<Outcome> for TaskState {
    fn from(o: Outcome) -> Self {
        match o {
            Outcome::Succeeded => TaskState::Succeeded,
            Outcome::Failed(reason) => TaskState::Failed(reason),
        }
    }
}

/// One state transition of one task generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskEvent {
    pub id: ReleaseId,
    pub generation: u64,
    pub state: TaskState,
    pub attempts: u32,
}

struct Entry {
    generation: u64,
    cancel: CancellationToken,
    state: TaskState,
    attempts: u32,
    created_at: Instant,
}

struct Inner {
    wait_time: Duration,
    slots: Arc<Semaphore>,
    provider: Arc<dyn ReleaseStatusProvider>,
    sink: Arc<dyn StatusSink>,
    cancel: CancellationToken,
    tasks: Mutex<HashMap<ReleaseId, Entry>>,
    next_gen: AtomicU64,
    events: broadcast::Sender<TaskEvent>,
    tracker: TaskTracker,
}

const EVENT_CAP: usize = 1024;

/// Consecutive `NotFound` polls after which the release is treated as deleted.
pub const MISSING_LIMIT: u32 = 3;

/// Cloneable handle; all clones share one task table and one slot pool.
#[derive(Clone)]
pub struct ReleaseScheduler {
    inner: Arc<Inner>,
}

impl ReleaseScheduler {
    /// `cancel` stops every task when fired; [`shutdown`](Self::shutdown) fires it too.
    pub fn new(
        opts: ReleaseControllerOptions,
        provider: Arc<dyn ReleaseStatusProvider>,
        sink: Arc<dyn StatusSink>,
        cancel: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAP);
        let permits = opts.max_concurrent.max(1);
        info!(max_concurrent = permits, wait_time = ?opts.wait_time, "reconcile: scheduler ready");
        Self {
            inner: Arc::new(Inner {
                wait_time: opts.wait_time,
                slots: Arc::new(Semaphore::new(permits)),
                provider,
                sink,
                cancel,
                tasks: Mutex::new(HashMap::new()),
                next_gen: AtomicU64::new(0),
                events,
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Start (or restart) reconciliation of `id`; returns the new task's generation.
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, id: ReleaseId) -> u64 {
        let inner = &self.inner;
        let generation = inner.next_gen.fetch_add(1, Ordering::Relaxed) + 1;
        if inner.cancel.is_cancelled() {
            debug!(release = %id, generation, "reconcile: enqueue after shutdown");
            inner.emit(&id, generation, TaskState::Cancelled, 0);
            return generation;
        }
        let token = inner.cancel.child_token();
        {
            let mut tasks = inner.table();
            let entry = Entry {
                generation,
                cancel: token.clone(),
                state: TaskState::Pending,
                attempts: 0,
                created_at: Instant::now(),
            };
            if let Some(old) = tasks.insert(id.clone(), entry) {
                old.cancel.cancel();
                debug!(release = %id, old = old.generation, new = generation, "reconcile: superseded");
                metrics::counter!("reconcile_superseded_total", 1u64);
                inner.emit(&id, old.generation, TaskState::Superseded, old.attempts);
            }
            inner.emit(&id, generation, TaskState::Pending, 0);
        }
        let task_inner = Arc::clone(inner);
        inner.tracker.spawn(run(task_inner, id, generation, token));
        generation
    }

    /// Drop the live task for `id`, e.g. because the release was deleted. Its slot is
    /// released as soon as the task unwinds. False when nothing was tracked.
    pub fn cancel(&self, id: &ReleaseId) -> bool {
        let removed = self.inner.table().remove(id);
        match removed {
            Some(e) => {
                e.cancel.cancel();
                debug!(release = %id, generation = e.generation, "reconcile: cancelled by caller");
                self.inner.emit(id, e.generation, TaskState::Cancelled, e.attempts);
                self.inner.publish_running();
                true
            }
            None => false,
        }
    }

    /// State of the live task for `id`; finished tasks are forgotten.
    pub fn state(&self, id: &ReleaseId) -> Option<TaskState> { self.inner.table().get(id).map(|e| e.state.clone()) }

    pub fn attempts(&self, id: &ReleaseId) -> Option<u32> { self.inner.table().get(id).map(|e| e.attempts) }

    /// Age of the live task for `id`.
    pub fn age(&self, id: &ReleaseId) -> Option<Duration> { self.inner.table().get(id).map(|e| e.created_at.elapsed()) }

    /// Tasks currently holding a slot.
    pub fn running(&self) -> usize { self.inner.running() }

    /// Live tasks, pending or running.
    pub fn tracked(&self) -> usize { self.inner.table().len() }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> { self.inner.events.subscribe() }

    pub fn is_shutdown(&self) -> bool { self.inner.cancel.is_cancelled() }

    /// Cancel every task and wait for all of them to unwind.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("reconcile: scheduler stopped");
    }
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, HashMap<ReleaseId, Entry>> {
        // every update under the lock is a single insert, remove or assign
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn running(&self) -> usize { self.table().values().filter(|e| e.state == TaskState::Running).count() }

    fn emit(&self, id: &ReleaseId, generation: u64, state: TaskState, attempts: u32) {
        let _ = self.events.send(TaskEvent { id: id.clone(), generation, state, attempts });
    }

    /// Update the entry if it still belongs to `generation`.
    fn transition(&self, id: &ReleaseId, generation: u64, state: TaskState) -> bool {
        let mut tasks = self.table();
        match tasks.get_mut(id) {
            Some(e) if e.generation == generation => {
                e.state = state.clone();
                let attempts = e.attempts;
                self.emit(id, generation, state, attempts);
                true
            }
            _ => false,
        }
    }

    fn bump_attempts(&self, id: &ReleaseId, generation: u64) -> u32 {
        let mut tasks = self.table();
        match tasks.get_mut(id) {
            Some(e) if e.generation == generation => {
                e.attempts += 1;
                e.attempts
            }
            _ => 0,
        }
    }

    /// Drop the entry if it still belongs to `generation`. False when it was superseded.
    fn finish(&self, id: &ReleaseId, generation: u64, state: TaskState) -> bool {
        let mut tasks = self.table();
        match tasks.get(id) {
            Some(e) if e.generation == generation => {
                let attempts = e.attempts;
                tasks.remove(id);
                self.emit(id, generation, state, attempts);
                true
            }
            _ => false,
        }
    }

    fn publish_running(&self) { metrics::gauge!("reconcile_running", self.running() as f64); }
}

async fn run(inner: Arc<Inner>, id: ReleaseId, generation: u64, cancel: CancellationToken) {
    let permit = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            inner.finish(&id, generation, TaskState::Cancelled);
            return;
        }
        p = Arc::clone(&inner.slots).acquire_owned() => match p {
            Ok(p) => p,
            Err(_) => {
                inner.finish(&id, generation, TaskState::Cancelled);
                return;
            }
        },
    };
    if !inner.transition(&id, generation, TaskState::Running) {
        return;
    }
    inner.publish_running();
    debug!(release = %id, generation, "reconcile: admitted");

    let mut missing = 0u32;
    let outcome = loop {
        let attempt = inner.bump_attempts(&id, generation);
        metrics::counter!("reconcile_polls_total", 1u64);
        let polled = tokio::select! {
            biased;
            () = cancel.cancelled() => break None,
            r = inner.provider.fetch(&id) => r,
        };
        match polled {
            Ok(ReleasePhase::Ready) => break Some(Outcome::Succeeded),
            Ok(ReleasePhase::Failed(reason)) => break Some(Outcome::Failed(reason)),
            Ok(ReleasePhase::Pending) => {
                missing = 0;
                debug!(release = %id, attempt, "reconcile: not settled");
            }
            Err(PollError::NotFound(_)) if missing + 1 >= MISSING_LIMIT => {
                info!(release = %id, attempt, "reconcile: release gone, dropping task");
                break None;
            }
            Err(e) => {
                if matches!(e, PollError::NotFound(_)) {
                    missing += 1;
                } else {
                    missing = 0;
                }
                metrics::counter!("reconcile_poll_errors_total", 1u64);
                warn!(release = %id, attempt, error = %e, "reconcile: poll failed, retrying");
            }
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => break None,
            () = tokio::time::sleep(inner.wait_time) => {}
        }
    };
    drop(permit);

    match outcome {
        Some(outcome) => {
            let current = inner.finish(&id, generation, TaskState::from(outcome.clone()));
            inner.publish_running();
            if current {
                info!(release = %id, generation, outcome = ?outcome, "reconcile: settled");
                if let Err(e) = inner.sink.report(&id, &outcome).await {
                    warn!(release = %id, error = %e, "reconcile: status report failed");
                }
            }
        }
        None => {
            // superseded or caller-cancelled tasks no longer own the entry; a vanished release still does
            if inner.finish(&id, generation, TaskState::Cancelled) {
                debug!(release = %id, generation, "reconcile: cancelled");
            }
            inner.publish_running();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Always(ReleasePhase);

    #[async_trait::async_trait]
    impl ReleaseStatusProvider for Always {
        async fn fetch(&self, _id: &ReleaseId) -> Result<ReleasePhase, PollError> { Ok(self.0.clone()) }
    }

    fn scheduler(phase: ReleasePhase) -> ReleaseScheduler {
        ReleaseScheduler::new(
            ReleaseControllerOptions::default(),
            Arc::new(Always(phase)),
            Arc::new(LogSink),
            CancellationToken::new(),
        )
    }

    async fn until_terminal(rx: &mut broadcast::Receiver<TaskEvent>) -> TaskEvent {
        loop {
            let ev = rx.recv().await.unwrap();
            if ev.state.is_terminal() {
                return ev;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ready_release_succeeds_on_first_poll() {
        let s = scheduler(ReleasePhase::Ready);
        let mut rx = s.subscribe();
        let g = s.enqueue(ReleaseId::new("r1"));
        let ev = until_terminal(&mut rx).await;
        assert_eq!(ev, TaskEvent { id: ReleaseId::new("r1"), generation: g, state: TaskState::Succeeded, attempts: 1 });
        assert_eq!(s.state(&ReleaseId::new("r1")), None);
        assert_eq!(s.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_release_carries_reason() {
        let s = scheduler(ReleasePhase::Failed("chart error".into()));
        let mut rx = s.subscribe();
        s.enqueue(ReleaseId::namespaced("ns", "r1"));
        assert_eq!(until_terminal(&mut rx).await.state, TaskState::Failed("chart error".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_after_shutdown_is_cancelled() {
        let s = scheduler(ReleasePhase::Pending);
        s.shutdown().await;
        let mut rx = s.subscribe();
        s.enqueue(ReleaseId::new("late"));
        assert_eq!(rx.recv().await.unwrap().state, TaskState::Cancelled);
        assert_eq!(s.tracked(), 0);
    }
}
