//! appdeck store: delta coalescing, per-kind world snapshots and the read-side cache handle.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use appdeck_core::{Delta, DeltaKind, Kind, LabelSelector, ObjectKey, OwnerRef, Projector, ResourceObject};
use arc_swap::ArcSwap;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Read-only view over the mirrored objects of every kind.
///
/// Implementations hand out immutable `Arc`s, so readers never observe a partially
/// constructed object even while the ingest loop publishes a new snapshot.
pub trait CacheStore: Send + Sync {
    fn get_by_name(&self, kind: Kind, name: &str) -> Option<Arc<ResourceObject>>;

    fn list_all(&self, kind: Kind) -> Vec<Arc<ResourceObject>>;

    /// Objects of `kind` whose labels satisfy `selector`.
    fn list_selected(&self, kind: Kind, selector: &LabelSelector) -> Vec<Arc<ResourceObject>> {
        let mut items = self.list_all(kind);
        if !selector.is_empty() {
            items.retain(|o| selector.matches(&o.labels));
        }
        items
    }
}

/// Coalescing queue keyed by object identity with FIFO order.
///
/// Never drops: `cap` only marks the point at which the owner must flush.
pub struct Coalescer {
    map: FxHashMap<ObjectKey, Delta>,
    order: VecDeque<ObjectKey>,
    cap: usize,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1) }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    /// Distinct identities pending reached `cap`; drain before pushing more.
    pub fn is_full(&self) -> bool { self.map.len() >= self.cap }

    /// Queue a delta; a pending delta for the same identity is replaced in place.
    pub fn push(&mut self, d: Delta) {
        if !self.map.contains_key(&d.key) {
            self.order.push_back(d.key.clone());
        }
        self.map.insert(d.key.clone(), d);
    }

    /// Drain all currently coalesced deltas in arrival order.
    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                out.push(d);
            }
        }
        out
    }
}

/// Immutable view of one kind's objects.
#[derive(Debug, Default)]
pub struct KindSnapshot {
    pub items: Vec<Arc<ResourceObject>>,
    by_name: FxHashMap<String, usize>,
}

impl KindSnapshot {
    pub fn get(&self, name: &str) -> Option<&Arc<ResourceObject>> { self.by_name.get(name).map(|&i| &self.items[i]) }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
}

/// Point-in-time view across all kinds.
#[derive(Debug, Default)]
pub struct WorldSnapshot {
    pub epoch: u64,
    kinds: FxHashMap<Kind, Arc<KindSnapshot>>,
}

impl WorldSnapshot {
    pub fn kind(&self, kind: Kind) -> Option<&Arc<KindSnapshot>> { self.kinds.get(&kind) }

    pub fn len(&self, kind: Kind) -> usize { self.kinds.get(&kind).map(|k| k.len()).unwrap_or(0) }
}

impl CacheStore for WorldSnapshot {
    fn get_by_name(&self, kind: Kind, name: &str) -> Option<Arc<ResourceObject>> {
        self.kinds.get(&kind).and_then(|k| k.get(name)).cloned()
    }

    fn list_all(&self, kind: Kind) -> Vec<Arc<ResourceObject>> {
        self.kinds.get(&kind).map(|k| k.items.clone()).unwrap_or_default()
    }
}

#[derive(Default)]
struct KindWorld {
    items: Vec<Arc<ResourceObject>>,
    by_name: FxHashMap<String, usize>,
}

impl KindWorld {
    fn upsert(&mut self, obj: ResourceObject) {
        let obj = Arc::new(obj);
        match self.by_name.get(&obj.name) {
            Some(&idx) => self.items[idx] = obj,
            None => {
                self.by_name.insert(obj.name.clone(), self.items.len());
                self.items.push(obj);
            }
        }
    }

    fn remove(&mut self, name: &str) {
        if let Some(idx) = self.by_name.remove(name) {
            self.items.swap_remove(idx);
            if let Some(moved) = self.items.get(idx) {
                self.by_name.insert(moved.name.clone(), idx);
            }
        }
    }

    fn freeze(&self) -> Arc<KindSnapshot> {
        Arc::new(KindSnapshot { items: self.items.clone(), by_name: self.by_name.clone() })
    }
}

/// Builds WorldSnapshot instances from deltas.
pub struct WorldBuilder {
    epoch: u64,
    kinds: FxHashMap<Kind, KindWorld>,
    frozen: FxHashMap<Kind, Arc<KindSnapshot>>,
    dirty: FxHashSet<Kind>,
    projectors: FxHashMap<Kind, Arc<dyn Projector + Send + Sync>>,
}

impl Default for WorldBuilder {
    fn default() -> Self { Self::new() }
}

impl WorldBuilder {
    /// Builder projecting per-kind columns with the built-in projectors.
    pub fn new() -> Self {
        let projectors = Kind::ALL.iter().map(|k| (*k, appdeck_core::columns::projector_for(*k))).collect();
        Self::with_projectors(projectors)
    }

    pub fn with_projectors(projectors: FxHashMap<Kind, Arc<dyn Projector + Send + Sync>>) -> Self {
        Self { epoch: 0, kinds: FxHashMap::default(), frozen: FxHashMap::default(), dirty: FxHashSet::default(), projectors }
    }

    pub fn epoch(&self) -> u64 { self.epoch }

    /// Apply a batch of deltas and bump the epoch.
    pub fn apply(&mut self, batch: Vec<Delta>) {
        for d in batch {
            let kind = d.key.kind;
            match d.op {
                DeltaKind::Applied => {
                    let projector = self.projectors.get(&kind).map(|p| p.as_ref());
                    match object_from_raw(kind, d.raw, projector) {
                        Some(obj) if obj.name == d.key.name => {
                            self.kinds.entry(kind).or_default().upsert(obj);
                        }
                        _ => {
                            warn!(kind = %kind, name = %d.key.name, "skipping delta without matching metadata.name");
                            continue;
                        }
                    }
                }
                DeltaKind::Deleted => {
                    if let Some(w) = self.kinds.get_mut(&kind) {
                        w.remove(&d.key.name);
                    }
                }
            }
            self.dirty.insert(kind);
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    /// Publishable snapshot; only kinds touched since the last freeze are copied.
    pub fn freeze(&mut self) -> Arc<WorldSnapshot> {
        for kind in self.dirty.drain() {
            if let Some(w) = self.kinds.get(&kind) {
                self.frozen.insert(kind, w.freeze());
            }
        }
        Arc::new(WorldSnapshot { epoch: self.epoch, kinds: self.frozen.clone() })
    }
}

fn string_pairs(v: Option<&serde_json::Value>) -> impl Iterator<Item = (String, String)> + '_ {
    v.and_then(|m| m.as_object())
        .into_iter()
        .flat_map(|m| m.iter())
        .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
}

/// Shape a raw custom resource into a cached object. Returns `None` without `metadata.name`.
pub fn object_from_raw(
    kind: Kind,
    raw: serde_json::Value,
    projector: Option<&(dyn Projector + Send + Sync)>,
) -> Option<ResourceObject> {
    let meta = raw.get("metadata")?;
    let name = meta.get("name").and_then(|v| v.as_str())?.to_string();
    let display_name = raw
        .pointer("/spec/name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| name.clone());
    let namespace = meta.get("namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
    let uid = meta.get("uid").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let state = raw.pointer("/status/state").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let creation_ts = meta
        .get("creationTimestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(0);
    let labels: SmallVec<[(String, String); 8]> = string_pairs(meta.get("labels")).collect();
    let annotations: SmallVec<[(String, String); 4]> = string_pairs(meta.get("annotations")).collect();
    let owner_refs: SmallVec<[OwnerRef; 2]> = meta
        .get("ownerReferences")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .map(|o| OwnerRef {
                    uid: o.get("uid").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    kind: o.get("kind").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    let projected = projector.map(|p| p.project(&raw)).unwrap_or_default();
    Some(ResourceObject {
        kind,
        name,
        display_name,
        namespace,
        uid,
        state,
        creation_ts,
        labels,
        annotations,
        owner_refs,
        projected,
        raw,
    })
}

/// Handle for readers to access the current snapshot and subscribe to swaps.
#[derive(Clone)]
pub struct BackendHandle {
    snap: Arc<ArcSwap<WorldSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl BackendHandle {
    pub fn current(&self) -> Arc<WorldSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Wait until the first batch is published or `timeout` elapses. Returns the epoch seen.
    pub async fn wait_for_sync(&self, timeout: Duration) -> u64 {
        let mut rx = self.subscribe_epoch();
        let deadline = Instant::now() + timeout;
        while *rx.borrow() == 0 {
            let now = Instant::now();
            if now >= deadline { break; }
            let rem = deadline.duration_since(now).min(Duration::from_secs(2));
            match tokio::time::timeout(rem, rx.changed()).await {
                Ok(Ok(())) => {}
                // sender gone or slice elapsed; re-check the deadline
                Ok(Err(_)) => break,
                Err(_) => {}
            }
        }
        let epoch = *rx.borrow();
        epoch
    }

    /// Wait until `kind` holds at least `want` objects or `timeout` elapses. Returns the count
    /// seen last; it stays below `want` when objects were deleted meanwhile.
    pub async fn wait_for_count(&self, kind: Kind, want: usize, timeout: Duration) -> usize {
        let mut rx = self.subscribe_epoch();
        let deadline = Instant::now() + timeout;
        loop {
            let have = self.current().len(kind);
            if have >= want {
                return have;
            }
            let now = Instant::now();
            if now >= deadline {
                return have;
            }
            match tokio::time::timeout(deadline - now, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return self.current().len(kind),
            }
        }
    }
}

impl CacheStore for BackendHandle {
    fn get_by_name(&self, kind: Kind, name: &str) -> Option<Arc<ResourceObject>> { self.snap.load().get_by_name(kind, name) }

    fn list_all(&self, kind: Kind) -> Vec<Arc<ResourceObject>> { self.snap.load().list_all(kind) }
}

fn publish(builder: &mut WorldBuilder, batch: Vec<Delta>, snap: &ArcSwap<WorldSnapshot>, epoch_tx: &watch::Sender<u64>) {
    let t0 = Instant::now();
    let n = batch.len();
    builder.apply(batch);
    let next = builder.freeze();
    let epoch = next.epoch;
    snap.store(next);
    let _ = epoch_tx.send(epoch);
    metrics::gauge!("store_epoch", epoch as f64);
    metrics::histogram!("store_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
    debug!(epoch, deltas = n, "snapshot published");
}

/// Spawn an ingest loop consuming deltas and swapping snapshots. Returns a sender for deltas and a handle for reads.
pub fn spawn_ingest(cap: usize) -> (mpsc::Sender<Delta>, BackendHandle) {
    spawn_ingest_with_builder(cap, WorldBuilder::new())
}

pub fn spawn_ingest_with_builder(cap: usize, mut builder: WorldBuilder) -> (mpsc::Sender<Delta>, BackendHandle) {
    let (tx, mut rx) = mpsc::channel::<Delta>(cap.max(1));
    let snap = Arc::new(ArcSwap::from_pointee(WorldSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let snap_clone = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut ticker = tokio::time::interval(Duration::from_millis(8));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(d) => {
                            coalescer.push(d);
                            if coalescer.is_full() {
                                metrics::counter!("store_full_flushes_total", 1u64);
                                publish(&mut builder, coalescer.drain_ready(), &snap_clone, &epoch_tx);
                            }
                        }
                        None => {
                            debug!("delta channel closed; draining and exiting ingest loop");
                            let batch = coalescer.drain_ready();
                            if !batch.is_empty() {
                                publish(&mut builder, batch, &snap_clone, &epoch_tx);
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let batch = coalescer.drain_ready();
                    if !batch.is_empty() {
                        publish(&mut builder, batch, &snap_clone, &epoch_tx);
                    }
                }
            }
        }
        info!(epoch = builder.epoch(), "ingest loop stopped");
    });

    (tx, BackendHandle { snap, epoch_rx })
}
