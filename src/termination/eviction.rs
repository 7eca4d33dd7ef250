//! The eviction queue.
//!
//! A single process-wide queue drains pods through the eviction subresource,
//! which is what makes PodDisruptionBudgets count. Invariants: at most one
//! in-flight request per key, exponential backoff on retry, and 404/409
//! responses are success (the pod is gone or was recreated under a new UID).
//! A 429 means a PDB is holding the pod; that is the API working as
//! intended, so it surfaces as an event and a requeue, never as a failure.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::EvictParams;
use kube::{Api, Client};
use tokio::sync::{watch, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::events::{object_ref, EventRecorder, Reason};
use crate::metrics::{ReasonLabels, SharedMetrics};

pub const BACKOFF_BASE: Duration = Duration::from_millis(100);
pub const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Fallback drain reason when the owning claim carries no
/// DisruptionReason condition.
pub const DEFAULT_REASON: &str = "Forceful Termination";

pub fn backoff_for(attempts: u32) -> Duration {
    let exp = attempts.min(16);
    BACKOFF_BASE
        .saturating_mul(2_u32.saturating_pow(exp))
        .min(BACKOFF_CAP)
}

/// Queue identity: a recreated pod (same name, new UID) is a different key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EvictionKey {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub provider_id: String,
}

#[derive(Debug, Clone)]
pub struct EvictionRequest {
    pub key: EvictionKey,
    /// Node the pod is draining from, for event targeting.
    pub node_name: String,
    /// Human-readable reason carried into the eviction note.
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvictOutcome {
    Evicted,
    /// 404 or 409: already gone, or recreated with a new UID.
    Gone,
    /// 429: a PodDisruptionBudget is blocking the eviction.
    Blocked(String),
    Failed(String),
}

/// Records scripted eviction outcomes for tests: each call pops the next
/// behavior, falling back to a default.
#[derive(Clone, Default)]
pub struct FakeEvictor {
    state: Arc<Mutex<FakeEvictorState>>,
}

#[derive(Default)]
struct FakeEvictorState {
    outcomes: VecDeque<EvictOutcome>,
    default_outcome: Option<EvictOutcome>,
    calls: Vec<EvictionKey>,
}

impl FakeEvictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_next(self, outcome: EvictOutcome) -> Self {
        self.state.lock().unwrap().outcomes.push_back(outcome);
        self
    }

    pub fn with_default(self, outcome: EvictOutcome) -> Self {
        self.state.lock().unwrap().default_outcome = Some(outcome);
        self
    }

    pub fn calls(&self) -> Vec<EvictionKey> {
        self.state.lock().unwrap().calls.clone()
    }

    fn evict(&self, key: &EvictionKey) -> EvictOutcome {
        let mut state = self.state.lock().unwrap();
        state.calls.push(key.clone());
        state
            .outcomes
            .pop_front()
            .or_else(|| state.default_outcome.clone())
            .unwrap_or(EvictOutcome::Evicted)
    }
}

/// Evicts through the API server, or through a scripted fake.
#[derive(Clone)]
pub enum PodEvictor {
    Kube(Client),
    Fake(FakeEvictor),
}

impl PodEvictor {
    pub async fn evict(&self, key: &EvictionKey) -> EvictOutcome {
        match self {
            Self::Fake(fake) => fake.evict(key),
            Self::Kube(client) => {
                let pods: Api<Pod> = Api::namespaced(client.clone(), &key.namespace);
                match pods.evict(&key.name, &EvictParams::default()).await {
                    Ok(_) => EvictOutcome::Evicted,
                    Err(kube::Error::Api(ae)) if ae.code == 404 || ae.code == 409 => {
                        EvictOutcome::Gone
                    }
                    Err(kube::Error::Api(ae)) if ae.code == 429 => {
                        EvictOutcome::Blocked(ae.message)
                    }
                    Err(e) => EvictOutcome::Failed(e.to_string()),
                }
            }
        }
    }
}

#[derive(Debug)]
struct QueuedItem {
    ready_at: Instant,
    seq: u64,
    request: EvictionRequest,
    attempts: u32,
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}
impl Eq for QueuedItem {}
impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ready_at
            .cmp(&other.ready_at)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    /// Keys queued or in flight; the dedup invariant lives here, guarded
    /// separately from the heap's ordering concerns.
    keys: HashSet<EvictionKey>,
    heap: BinaryHeap<Reverse<QueuedItem>>,
    seq: u64,
}

pub struct EvictionQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    metrics: SharedMetrics,
}

impl EvictionQueue {
    pub fn new(metrics: SharedMetrics) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            metrics,
        })
    }

    /// Add a request; duplicates of an already-queued or in-flight key are
    /// dropped. Returns whether the request was admitted.
    pub fn enqueue(&self, request: EvictionRequest) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.keys.insert(request.key.clone()) {
            return false;
        }
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(Reverse(QueuedItem {
            ready_at: Instant::now(),
            seq,
            request,
            attempts: 0,
        }));
        self.metrics
            .eviction_queue_depth
            .set(inner.keys.len() as i64);
        drop(inner);
        self.notify.notify_one();
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, key: &EvictionKey) {
        let mut inner = self.inner.lock().unwrap();
        inner.keys.remove(key);
        self.metrics
            .eviction_queue_depth
            .set(inner.keys.len() as i64);
    }

    fn requeue(&self, request: EvictionRequest, attempts: u32) {
        let backoff = backoff_for(attempts);
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(Reverse(QueuedItem {
            ready_at: Instant::now() + backoff,
            seq,
            request,
            attempts: attempts + 1,
        }));
        drop(inner);
        self.notify.notify_one();
    }

    fn pop_ready(&self) -> Result<Option<QueuedItem>, Instant> {
        let mut inner = self.inner.lock().unwrap();
        match inner.heap.peek() {
            None => Ok(None),
            Some(Reverse(item)) if item.ready_at <= Instant::now() => {
                Ok(inner.heap.pop().map(|Reverse(i)| i))
            }
            Some(Reverse(item)) => Err(item.ready_at),
        }
    }

    /// Consume the queue until `shutdown` flips. One in-flight eviction at
    /// a time: the API server rate is not the bottleneck, PDBs are.
    pub async fn run(
        self: Arc<Self>,
        evictor: PodEvictor,
        events: EventRecorder,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let item = match self.pop_ready() {
                Ok(Some(item)) => item,
                Ok(None) => {
                    tokio::select! {
                        _ = self.notify.notified() => continue,
                        _ = shutdown.changed() => return,
                    }
                }
                Err(ready_at) => {
                    tokio::select! {
                        _ = sleep_until(ready_at) => continue,
                        _ = self.notify.notified() => continue,
                        _ = shutdown.changed() => return,
                    }
                }
            };

            let outcome = evictor.evict(&item.request.key).await;
            let key = &item.request.key;
            match outcome {
                EvictOutcome::Evicted => {
                    debug!(pod = %format!("{}/{}", key.namespace, key.name), "evicted");
                    self.metrics
                        .evictions_total
                        .get_or_create(&ReasonLabels::new("evicted"))
                        .inc();
                    let reference =
                        object_ref("Pod", "v1", &key.name, Some(&key.namespace), Some(&key.uid));
                    events
                        .publish(&reference, Reason::Evicted, item.request.reason.clone())
                        .await;
                    self.forget(key);
                }
                EvictOutcome::Gone => {
                    self.metrics
                        .evictions_total
                        .get_or_create(&ReasonLabels::new("gone"))
                        .inc();
                    self.forget(key);
                }
                EvictOutcome::Blocked(message) => {
                    self.metrics
                        .evictions_total
                        .get_or_create(&ReasonLabels::new("pdb_blocked"))
                        .inc();
                    let reference =
                        object_ref("Node", "v1", &item.request.node_name, None, None);
                    events
                        .publish(
                            &reference,
                            Reason::FailedDraining,
                            format!(
                                "eviction of pod {}/{} blocked by disruption budget: {message}",
                                key.namespace, key.name
                            ),
                        )
                        .await;
                    self.requeue(item.request, item.attempts);
                }
                EvictOutcome::Failed(message) => {
                    warn!(
                        pod = %format!("{}/{}", key.namespace, key.name),
                        %message,
                        attempts = item.attempts,
                        "eviction failed"
                    );
                    self.metrics
                        .evictions_total
                        .get_or_create(&ReasonLabels::new("error"))
                        .inc();
                    self.requeue(item.request, item.attempts);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;

    fn request(name: &str) -> EvictionRequest {
        EvictionRequest {
            key: EvictionKey {
                namespace: "default".into(),
                name: name.into(),
                uid: format!("uid-{name}"),
                provider_id: "fake://i-1".into(),
            },
            node_name: "node-a".into(),
            reason: DEFAULT_REASON.into(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_for(0), Duration::from_millis(100));
        assert_eq!(backoff_for(1), Duration::from_millis(200));
        assert_eq!(backoff_for(3), Duration::from_millis(800));
        assert_eq!(backoff_for(20), BACKOFF_CAP);
    }

    #[test]
    fn duplicate_keys_are_dropped() {
        let queue = EvictionQueue::new(Arc::new(Metrics::new()));
        assert!(queue.enqueue(request("a")));
        assert!(!queue.enqueue(request("a")));
        assert_eq!(queue.len(), 1);

        // A recreated pod has a new UID and is a distinct key.
        let mut recreated = request("a");
        recreated.key.uid = "uid-a-2".into();
        assert!(queue.enqueue(recreated));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_evictions_requeue_until_allowed() {
        let metrics = Arc::new(Metrics::new());
        let queue = EvictionQueue::new(metrics.clone());
        let evictor = FakeEvictor::new()
            .on_next(EvictOutcome::Blocked("disruptions not allowed".into()))
            .on_next(EvictOutcome::Blocked("disruptions not allowed".into()))
            .on_next(EvictOutcome::Evicted);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(queue.clone().run(
            PodEvictor::Fake(evictor.clone()),
            EventRecorder::disconnected(),
            shutdown_rx,
        ));

        queue.enqueue(request("a"));
        // Two blocked attempts back off 100ms then 200ms before success.
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(evictor.calls().len(), 3);
        assert!(queue.is_empty());
        shutdown_tx.send(true).unwrap();
        let _ = worker.await;
    }

    #[tokio::test(start_paused = true)]
    async fn gone_pods_are_forgotten_without_retry() {
        let metrics = Arc::new(Metrics::new());
        let queue = EvictionQueue::new(metrics.clone());
        let evictor = FakeEvictor::new().with_default(EvictOutcome::Gone);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(queue.clone().run(
            PodEvictor::Fake(evictor.clone()),
            EventRecorder::disconnected(),
            shutdown_rx,
        ));

        queue.enqueue(request("a"));
        queue.enqueue(request("b"));
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(evictor.calls().len(), 2);
        assert!(queue.is_empty());
        shutdown_tx.send(true).unwrap();
        let _ = worker.await;
    }
}
