#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use appdeck_core::ReleaseId;
use appdeck_reconcile::{
    Outcome, PollError, ReleaseControllerOptions, ReleasePhase, ReleaseScheduler, ReleaseStatusProvider, StatusSink,
    TaskEvent, TaskState,
};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Replays a scripted sequence per release, then keeps answering `fallback`.
#[derive(Default)]
struct Scripted {
    scripts: Mutex<HashMap<String, VecDeque<Result<ReleasePhase, PollError>>>>,
    fallback: Mutex<Option<ReleasePhase>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl Scripted {
    fn script(&self, name: &str, steps: Vec<Result<ReleasePhase, PollError>>) {
        self.scripts.lock().unwrap().insert(name.to_string(), steps.into());
    }

    fn settle_all(&self, phase: ReleasePhase) { *self.fallback.lock().unwrap() = Some(phase); }

    fn calls(&self, name: &str) -> u32 { self.calls.lock().unwrap().get(name).copied().unwrap_or(0) }
}

#[async_trait::async_trait]
impl ReleaseStatusProvider for Scripted {
    async fn fetch(&self, id: &ReleaseId) -> Result<ReleasePhase, PollError> {
        *self.calls.lock().unwrap().entry(id.name.clone()).or_default() += 1;
        if let Some(step) = self.scripts.lock().unwrap().get_mut(&id.name).and_then(|q| q.pop_front()) {
            return step;
        }
        Ok(self.fallback.lock().unwrap().clone().unwrap_or(ReleasePhase::Pending))
    }
}

#[derive(Default)]
struct Recording(Mutex<Vec<(ReleaseId, Outcome)>>);

#[async_trait::async_trait]
impl StatusSink for Recording {
    async fn report(&self, id: &ReleaseId, outcome: &Outcome) -> anyhow::Result<()> {
        self.0.lock().unwrap().push((id.clone(), outcome.clone()));
        Ok(())
    }
}

struct Harness {
    sched: ReleaseScheduler,
    provider: Arc<Scripted>,
    sink: Arc<Recording>,
    cancel: CancellationToken,
    rx: broadcast::Receiver<TaskEvent>,
}

fn harness(max_concurrent: usize, wait: Duration) -> Harness {
    let provider = Arc::new(Scripted::default());
    let sink = Arc::new(Recording::default());
    let cancel = CancellationToken::new();
    let opts = ReleaseControllerOptions::default().with_max_concurrent(max_concurrent).with_wait_time(wait);
    let sched = ReleaseScheduler::new(opts, provider.clone(), sink.clone(), cancel.clone());
    let rx = sched.subscribe();
    Harness { sched, provider, sink, cancel, rx }
}

fn rid(name: &str) -> ReleaseId { ReleaseId::namespaced("demo", name) }

async fn settle() {
    // paused clock: sleeping lets every ready task run before time moves on
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn drain(rx: &mut broadcast::Receiver<TaskEvent>) -> Vec<TaskEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn admission_never_exceeds_max_concurrent() {
    let mut h = harness(2, Duration::from_secs(30));
    for i in 0..5 {
        h.sched.enqueue(rid(&format!("r{i}")));
    }
    settle().await;
    assert_eq!(h.sched.running(), 2);
    assert_eq!(h.sched.tracked(), 5);
    let pending = (0..5).filter(|i| h.sched.state(&rid(&format!("r{i}"))) == Some(TaskState::Pending)).count();
    assert_eq!(pending, 3);

    h.provider.settle_all(ReleasePhase::Ready);
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(h.sched.running() <= 2);
    }
    assert_eq!(h.sched.tracked(), 0);
    let done = drain(&mut h.rx).into_iter().filter(|e| e.state == TaskState::Succeeded).count();
    assert_eq!(done, 5);
    assert_eq!(h.sink.0.lock().unwrap().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn supersede_frees_the_slot_and_discards_the_old_result() {
    let mut h = harness(1, Duration::from_secs(30));
    let first = h.sched.enqueue(rid("r1"));
    settle().await;
    assert_eq!(h.sched.state(&rid("r1")), Some(TaskState::Running));

    let second = h.sched.enqueue(rid("r1"));
    assert!(second > first);
    settle().await;
    // the only slot moved to the new generation
    assert_eq!(h.sched.running(), 1);
    assert_eq!(h.sched.tracked(), 1);
    assert_eq!(h.sched.state(&rid("r1")), Some(TaskState::Running));

    let events = drain(&mut h.rx);
    assert!(events.iter().any(|e| e.generation == first && e.state == TaskState::Superseded));
    assert!(!events.iter().any(|e| e.generation == first && e.state == TaskState::Cancelled));

    h.provider.settle_all(ReleasePhase::Ready);
    tokio::time::sleep(Duration::from_secs(31)).await;
    let events = drain(&mut h.rx);
    let done: Vec<_> = events.iter().filter(|e| e.state == TaskState::Succeeded).collect();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].generation, second);
    assert_eq!(h.sink.0.lock().unwrap().as_slice(), &[(rid("r1"), Outcome::Succeeded)]);
}

#[tokio::test(start_paused = true)]
async fn supersede_while_pending_keeps_one_task() {
    let h = harness(1, Duration::from_secs(30));
    h.sched.enqueue(rid("busy"));
    h.sched.enqueue(rid("queued"));
    h.sched.enqueue(rid("queued"));
    settle().await;
    assert_eq!(h.sched.tracked(), 2);
    assert_eq!(h.sched.running(), 1);
    assert_eq!(h.provider.calls("queued"), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_retried_on_the_interval() {
    let mut h = harness(1, Duration::from_secs(10));
    h.provider.script(
        "r1",
        vec![
            Err(PollError::Transient("connection reset".into())),
            Ok(ReleasePhase::Pending),
            Err(PollError::NotFound("r1".into())),
            Ok(ReleasePhase::Ready),
        ],
    );
    let started = Instant::now();
    let g = h.sched.enqueue(rid("r1"));
    let ev = loop {
        let ev = h.rx.recv().await.unwrap();
        if ev.state.is_terminal() {
            break ev;
        }
    };
    assert_eq!(ev, TaskEvent { id: rid("r1"), generation: g, state: TaskState::Succeeded, attempts: 4 });
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(h.provider.calls("r1"), 4);
}

#[tokio::test(start_paused = true)]
async fn terminal_failure_is_reported() {
    let h = harness(3, Duration::from_secs(1));
    h.provider.script("bad", vec![Ok(ReleasePhase::Pending), Ok(ReleasePhase::Failed("image pull".into()))]);
    h.sched.enqueue(rid("bad"));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.sink.0.lock().unwrap().as_slice(), &[(rid("bad"), Outcome::Failed("image pull".into()))]);
    assert_eq!(h.sched.running(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_running_and_pending() {
    let mut h = harness(1, Duration::from_secs(30));
    h.sched.enqueue(rid("a"));
    h.sched.enqueue(rid("b"));
    settle().await;
    h.sched.shutdown().await;
    assert!(h.sched.is_shutdown());
    assert_eq!(h.sched.tracked(), 0);
    let cancelled = drain(&mut h.rx).into_iter().filter(|e| e.state == TaskState::Cancelled).count();
    assert_eq!(cancelled, 2);
    assert!(h.sink.0.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn external_token_stops_polling() {
    let h = harness(2, Duration::from_secs(5));
    h.sched.enqueue(rid("a"));
    settle().await;
    h.cancel.cancel();
    settle().await;
    assert_eq!(h.sched.tracked(), 0);
    let calls = h.provider.calls("a");
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.provider.calls("a"), calls);
}

#[tokio::test(start_paused = true)]
async fn vanished_releases_give_their_slots_back() {
    let h = harness(2, Duration::from_secs(30));
    for name in ["gone-a", "gone-b"] {
        h.provider.script(name, (0..50).map(|_| Err(PollError::NotFound(name.into()))).collect());
    }
    h.provider.script("live", vec![Ok(ReleasePhase::Ready)]);
    h.sched.enqueue(rid("gone-a"));
    h.sched.enqueue(rid("gone-b"));
    h.sched.enqueue(rid("live"));
    settle().await;
    assert_eq!(h.sched.state(&rid("live")), Some(TaskState::Pending));

    tokio::time::sleep(Duration::from_secs(30 * u64::from(appdeck_reconcile::scheduler::MISSING_LIMIT))).await;
    assert_eq!(h.sched.tracked(), 0);
    assert_eq!(h.provider.calls("gone-a"), appdeck_reconcile::scheduler::MISSING_LIMIT);
    assert_eq!(h.sink.0.lock().unwrap().as_slice(), &[(rid("live"), Outcome::Succeeded)]);
}

#[tokio::test(start_paused = true)]
async fn cancel_drops_the_task_and_frees_its_slot() {
    let mut h = harness(1, Duration::from_secs(30));
    let gone = h.sched.enqueue(rid("gone"));
    h.sched.enqueue(rid("next"));
    settle().await;
    assert_eq!(h.sched.state(&rid("gone")), Some(TaskState::Running));
    assert_eq!(h.sched.state(&rid("next")), Some(TaskState::Pending));

    assert!(h.sched.cancel(&rid("gone")));
    assert!(!h.sched.cancel(&rid("gone")));
    settle().await;
    assert_eq!(h.sched.state(&rid("gone")), None);
    assert_eq!(h.sched.state(&rid("next")), Some(TaskState::Running));

    let cancelled: Vec<_> = drain(&mut h.rx).into_iter().filter(|e| e.state == TaskState::Cancelled).collect();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].generation, gone);
    assert!(h.sink.0.lock().unwrap().is_empty());
}
