//! # Performance Optimizer
//!
//! Asynchronous routing, back-pressure, batching and permit-based admission
//! control, attachable to a [`Router`] after construction. A broker operates
//! correctly without one; when attached, non-broker-RPC target messages may
//! be offered here instead of inline routing so a worker pool drains them.
//!
//! Grounded in the teacher's `metrics::LatencyCollector` (HDR histogram over
//! nanosecond samples, `value_at_quantile` for percentiles) for the P99
//! tracked here, generalized from per-benchmark latency to per-dispatch
//! queueing latency feeding the adaptive loop.

use crate::bus::Bus;
use crate::message::Message;
use crate::router::Router;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Policy applied when [`Optimizer::offer`] is called against a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Reject the incoming message, leaving the queue untouched.
    DropNewest,
    /// Evict the oldest queued message to make room for the incoming one.
    DropOldest,
}

/// Tunables for one [`Optimizer`] instance.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub queue_capacity: usize,
    pub drop_policy: DropPolicy,
    pub workers: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub permit_budget: usize,
    pub adaptive_enabled: bool,
    pub adaptive_sample_interval: Duration,
    pub adaptive_sustain_samples: u32,
    pub adaptive_latency_threshold_ms: f64,
    pub adaptive_saturation_threshold: f64,
    pub adaptive_revoke_fraction: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: crate::defaults::QUEUE_CAPACITY,
            drop_policy: DropPolicy::DropNewest,
            workers: crate::defaults::MIN_WORKERS.max(num_cpus::get()),
            batch_size: crate::defaults::BATCH_SIZE,
            flush_interval: crate::defaults::FLUSH_INTERVAL,
            permit_budget: crate::defaults::PERMIT_BUDGET,
            adaptive_enabled: false,
            adaptive_sample_interval: crate::defaults::ADAPTIVE_SAMPLE_INTERVAL,
            adaptive_sustain_samples: crate::defaults::ADAPTIVE_SUSTAIN_SAMPLES,
            adaptive_latency_threshold_ms: crate::defaults::ADAPTIVE_LATENCY_THRESHOLD_MS,
            adaptive_saturation_threshold: crate::defaults::ADAPTIVE_SATURATION_THRESHOLD,
            adaptive_revoke_fraction: crate::defaults::ADAPTIVE_REVOKE_FRACTION,
        }
    }
}

/// Point-in-time snapshot returned by [`Optimizer::metrics`].
#[derive(Debug, Clone, Serialize)]
pub struct OptimizerMetrics {
    pub total_processed: u64,
    pub messages_per_second: f64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub drop_count: u64,
}

/// Kernel-level feedback snapshot backing `RPCGetKernelMetrics` and the
/// adaptive loop's breach evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct KernelMetrics {
    pub p99_latency_ms: f64,
    pub buffer_saturation: f64,
    pub active_workers: usize,
    pub total_permits: usize,
    pub allocated_permits: usize,
    pub available_permits: usize,
    pub message_rate: f64,
    pub error_rate: f64,
}

/// A ring-buffer-backed bounded queue of messages, shared by the worker
/// pool. A plain `Mutex<VecDeque>` rather than a channel because
/// `drop_oldest` needs to evict the head, which `tokio::sync::mpsc` cannot
/// express.
struct WorkQueue {
    capacity: usize,
    drop_policy: DropPolicy,
    items: Mutex<VecDeque<Message>>,
    notify: Notify,
    drop_count: AtomicU64,
}

impl WorkQueue {
    fn new(capacity: usize, drop_policy: DropPolicy) -> Self {
        Self {
            capacity,
            drop_policy,
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            notify: Notify::new(),
            drop_count: AtomicU64::new(0),
        }
    }

    /// Ingress. Returns whether `msg` was accepted.
    fn offer(&self, msg: Message) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let mut items = self.items.lock();
        if items.len() < self.capacity {
            items.push_back(msg);
            drop(items);
            self.notify.notify_one();
            return true;
        }
        match self.drop_policy {
            DropPolicy::DropNewest => false,
            DropPolicy::DropOldest => {
                items.pop_front();
                items.push_back(msg);
                drop(items);
                self.drop_count.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
                true
            }
        }
    }

    fn depth(&self) -> usize {
        self.items.lock().len()
    }

    /// Pop up to `max` queued messages, waiting for at least one unless
    /// `cancel` fires first. Used both for single-message dispatch
    /// (`max = 1`) and batching (`max = batch_size`).
    async fn pop_batch(&self, max: usize, flush_interval: Duration, cancel: &CancellationToken) -> Vec<Message> {
        loop {
            {
                let mut items = self.items.lock();
                if !items.is_empty() {
                    let n = max.min(items.len());
                    return items.drain(..n).collect();
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(flush_interval) => {}
                _ = cancel.cancelled() => return Vec::new(),
            }
        }
    }

    fn clear(&self) {
        self.items.lock().clear();
    }
}

/// Global pool of integer admission permits, partitioned per provider.
pub struct PermitManager {
    total: usize,
    available: AtomicUsize,
    allocated: Mutex<HashMap<String, usize>>,
}

impl PermitManager {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            available: AtomicUsize::new(total),
            allocated: Mutex::new(HashMap::new()),
        }
    }

    /// Grant up to `count` permits to `provider_id`. May grant fewer than
    /// requested if the pool is exhausted; never negative.
    pub fn request(&self, provider_id: &str, count: usize) -> (usize, usize) {
        let mut granted = 0;
        loop {
            let available = self.available.load(Ordering::Acquire);
            if available == 0 {
                break;
            }
            let want = (count - granted).min(available);
            if self
                .available
                .compare_exchange(available, available - want, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                granted += want;
                break;
            }
        }
        if granted > 0 {
            *self.allocated.lock().entry(provider_id.to_string()).or_insert(0) += granted;
        }
        (granted, self.available.load(Ordering::Acquire))
    }

    /// Release up to `count` permits back to the pool. Over-release past
    /// the provider's current allocation is clamped rather than erroring.
    pub fn release(&self, provider_id: &str, count: usize) -> (bool, usize) {
        let mut allocated = self.allocated.lock();
        let entry = allocated.entry(provider_id.to_string()).or_insert(0);
        let released = count.min(*entry);
        *entry -= released;
        drop(allocated);
        self.available.fetch_add(released, Ordering::AcqRel);
        (true, self.available.load(Ordering::Acquire))
    }

    /// Forcibly revoke up to `count` permits from `provider_id`, returning
    /// every permit taken to the shared pool. Used by the adaptive loop.
    fn revoke(&self, provider_id: &str, count: usize) -> usize {
        let mut allocated = self.allocated.lock();
        let entry = allocated.entry(provider_id.to_string()).or_insert(0);
        let revoked = count.min(*entry);
        *entry -= revoked;
        drop(allocated);
        self.available.fetch_add(revoked, Ordering::AcqRel);
        revoked
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    pub fn allocated_total(&self) -> usize {
        self.allocated.lock().values().sum()
    }

    fn allocations_snapshot(&self) -> Vec<(String, usize)> {
        self.allocated
            .lock()
            .iter()
            .filter(|(_, &n)| n > 0)
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

struct Counters {
    total_processed: AtomicU64,
    total_errors: AtomicU64,
    active_workers: AtomicUsize,
    started_at: Instant,
}

/// Bounded work queue, worker pool, batching, permit admission control and
/// the adaptive kernel-metric feedback loop, attached to a [`Router`].
pub struct Optimizer {
    config: OptimizerConfig,
    queue: Arc<WorkQueue>,
    router: Arc<Router>,
    bus: Arc<Bus>,
    counters: Arc<Counters>,
    latency_ns: Arc<Mutex<Histogram<u64>>>,
    permits: Arc<PermitManager>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    adaptive_breach_streak: AtomicI64,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig, router: Arc<Router>, bus: Arc<Bus>) -> Self {
        let queue = Arc::new(WorkQueue::new(config.queue_capacity, config.drop_policy));
        let permits = Arc::new(PermitManager::new(config.permit_budget));
        Self {
            queue,
            router,
            bus,
            counters: Arc::new(Counters {
                total_processed: AtomicU64::new(0),
                total_errors: AtomicU64::new(0),
                active_workers: AtomicUsize::new(0),
                started_at: Instant::now(),
            }),
            latency_ns: Arc::new(Mutex::new(Histogram::new(3).expect("valid histogram precision"))),
            permits,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            adaptive_breach_streak: AtomicI64::new(0),
        }
    }

    pub fn permits(&self) -> &Arc<PermitManager> {
        &self.permits
    }

    /// Ingress. Returns whether the message was accepted onto the queue.
    pub fn offer(&self, msg: Message) -> bool {
        self.queue.offer(msg)
    }

    /// Spawn the worker pool (and, if configured, the adaptive loop).
    pub fn start(self: &Arc<Self>) {
        let workers = self.config.workers.max(crate::defaults::MIN_WORKERS);
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            handles.push(self.spawn_worker());
        }
        if self.config.adaptive_enabled {
            handles.push(self.spawn_adaptive_loop());
        }
        *self.workers.lock() = handles;
        info!(workers, "optimizer worker pool started");
    }

    fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let optimizer = self.clone();
        tokio::spawn(async move {
            loop {
                let batch = optimizer
                    .queue
                    .pop_batch(optimizer.config.batch_size.max(1), optimizer.config.flush_interval, &optimizer.cancel)
                    .await;
                if batch.is_empty() {
                    if optimizer.cancel.is_cancelled() {
                        break;
                    }
                    continue;
                }
                optimizer.counters.active_workers.fetch_add(1, Ordering::Relaxed);
                for msg in batch {
                    optimizer.dispatch_one(msg).await;
                }
                optimizer.counters.active_workers.fetch_sub(1, Ordering::Relaxed);
                if optimizer.cancel.is_cancelled() {
                    break;
                }
            }
        })
    }

    async fn dispatch_one(&self, msg: Message) {
        let started = Instant::now();
        let source = msg.source.clone();
        let result = self.router.route(msg, &source).await;
        let elapsed_ns = started.elapsed().as_nanos() as u64;
        let _ = self.latency_ns.lock().record(elapsed_ns);
        self.counters.total_processed.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = result {
            self.counters.total_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "optimizer worker dispatch failed");
        }
    }

    /// Snapshot of throughput-facing metrics.
    pub fn metrics(&self) -> OptimizerMetrics {
        let elapsed = self.counters.started_at.elapsed().as_secs_f64().max(1e-6);
        let total = self.counters.total_processed.load(Ordering::Relaxed);
        OptimizerMetrics {
            total_processed: total,
            messages_per_second: total as f64 / elapsed,
            queue_depth: self.queue.depth(),
            queue_capacity: self.config.queue_capacity,
            worker_count: self.config.workers.max(crate::defaults::MIN_WORKERS),
            drop_count: self.queue.drop_count.load(Ordering::Relaxed),
        }
    }

    /// Snapshot feeding the adaptive loop and `RPCGetKernelMetrics`.
    pub fn kernel_metrics(&self) -> KernelMetrics {
        let basic = self.metrics();
        let histogram = self.latency_ns.lock();
        let p99_ns = histogram.value_at_quantile(0.99);
        let total = self.counters.total_processed.load(Ordering::Relaxed);
        let errors = self.counters.total_errors.load(Ordering::Relaxed);
        let saturation = if basic.queue_capacity == 0 {
            1.0
        } else {
            basic.queue_depth as f64 / basic.queue_capacity as f64
        };
        KernelMetrics {
            p99_latency_ms: p99_ns as f64 / 1_000_000.0,
            buffer_saturation: saturation,
            active_workers: self.counters.active_workers.load(Ordering::Relaxed),
            total_permits: self.permits.total(),
            allocated_permits: self.permits.allocated_total(),
            available_permits: self.permits.available(),
            message_rate: basic.messages_per_second,
            error_rate: if total == 0 { 0.0 } else { errors as f64 / total as f64 },
        }
    }

    /// Periodically samples kernel metrics; on a sustained breach of the
    /// latency or saturation threshold, revokes a proportional share of
    /// permits from every provider currently holding an allocation and
    /// publishes `RPCOnQuotaUpdate` to each.
    fn spawn_adaptive_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let optimizer = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(optimizer.config.adaptive_sample_interval) => {}
                    _ = optimizer.cancel.cancelled() => break,
                }
                let metrics = optimizer.kernel_metrics();
                let breached = metrics.p99_latency_ms > optimizer.config.adaptive_latency_threshold_ms
                    || metrics.buffer_saturation > optimizer.config.adaptive_saturation_threshold;

                if breached {
                    let streak = optimizer.adaptive_breach_streak.fetch_add(1, Ordering::Relaxed) + 1;
                    if streak >= optimizer.config.adaptive_sustain_samples as i64 {
                        optimizer.revoke_from_heaviest(&metrics).await;
                        optimizer.adaptive_breach_streak.store(0, Ordering::Relaxed);
                    }
                } else {
                    optimizer.adaptive_breach_streak.store(0, Ordering::Relaxed);
                }
            }
        })
    }

    async fn revoke_from_heaviest(&self, metrics: &KernelMetrics) {
        let allocations = self.permits.allocations_snapshot();
        if allocations.is_empty() {
            return;
        }
        let reason = if metrics.p99_latency_ms > self.config.adaptive_latency_threshold_ms {
            "p99_latency_breach"
        } else {
            "buffer_saturation_breach"
        };
        for (provider_id, allocated) in allocations {
            let to_revoke = ((allocated as f64) * self.config.adaptive_revoke_fraction).ceil() as usize;
            if to_revoke == 0 {
                continue;
            }
            let revoked = self.permits.revoke(&provider_id, to_revoke);
            if revoked == 0 {
                continue;
            }
            debug!(provider_id, revoked, reason, "adaptive loop revoking permits");
            if let Ok(event) = Message::new_event(
                "RPCOnQuotaUpdate",
                "broker",
                &json!({
                    "revoked_permits": revoked,
                    "reason": reason,
                    "kernel_metrics": metrics,
                }),
            ) {
                let mut targeted = event;
                targeted.target = provider_id;
                self.bus.send_internal(targeted);
            }
        }
    }

    /// Close the worker signal; workers finish their current message then
    /// exit. Queued but not-yet-dispatched messages are discarded.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport_manager::TransportManager;
    use serde_json::json;

    fn event(target: &str, id: &str) -> Message {
        let mut msg = Message::new_event(id, "src", &json!({})).unwrap();
        msg.target = target.to_string();
        msg
    }

    #[test]
    fn drop_newest_rejects_when_full_and_leaves_queue_untouched() {
        let queue = WorkQueue::new(2, DropPolicy::DropNewest);
        assert!(queue.offer(event("", "m1")));
        assert!(queue.offer(event("", "m2")));
        assert!(!queue.offer(event("", "m3")));
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn capacity_zero_always_drops() {
        let queue = WorkQueue::new(0, DropPolicy::DropNewest);
        assert!(!queue.offer(event("", "m1")));
    }

    #[tokio::test]
    async fn s1_drop_oldest_evicts_head_and_counts_one_drop() {
        let queue = WorkQueue::new(2, DropPolicy::DropOldest);
        assert!(queue.offer(event("", "m1")));
        assert!(queue.offer(event("", "m2")));
        assert!(queue.offer(event("", "m3")));
        let cancel = CancellationToken::new();
        let drained = queue.pop_batch(2, Duration::from_millis(10), &cancel).await;
        let ids: Vec<_> = drained.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec!["m2", "m3"]);
        assert_eq!(queue.drop_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn permit_requests_are_partial_when_pool_exhausted() {
        let permits = PermitManager::new(10);
        let (granted, available) = permits.request("provider-a", 7);
        assert_eq!(granted, 7);
        assert_eq!(available, 3);
        let (granted, available) = permits.request("provider-b", 5);
        assert_eq!(granted, 3);
        assert_eq!(available, 0);
    }

    #[test]
    fn over_release_is_clamped_at_allocation() {
        let permits = PermitManager::new(10);
        permits.request("provider-a", 4);
        let (ok, available) = permits.release("provider-a", 100);
        assert!(ok);
        assert_eq!(available, 10);
    }

    #[tokio::test]
    async fn optimizer_processes_offered_messages() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(Bus::new(16));
        let transport_manager = Arc::new(TransportManager::new(dir.path()));
        let router = Arc::new(Router::new(bus.clone(), transport_manager, CancellationToken::new()));
        let optimizer = Arc::new(Optimizer::new(
            OptimizerConfig {
                queue_capacity: 10,
                workers: 1,
                ..OptimizerConfig::default()
            },
            router,
            bus.clone(),
        ));
        optimizer.start();
        assert!(optimizer.offer(event("", "m1")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let received = bus.receive(&CancellationToken::new()).await.unwrap();
        assert_eq!(received.id, "m1");
        optimizer.stop().await;
        assert_eq!(optimizer.metrics().total_processed, 1);
    }

    #[tokio::test]
    async fn s2_batch_flush_dispatches_all_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(Bus::new(16));
        let transport_manager = Arc::new(TransportManager::new(dir.path()));
        let router = Arc::new(Router::new(bus.clone(), transport_manager, CancellationToken::new()));
        let optimizer = Arc::new(Optimizer::new(
            OptimizerConfig {
                queue_capacity: 10,
                workers: 1,
                batch_size: 3,
                flush_interval: Duration::from_millis(20),
                ..OptimizerConfig::default()
            },
            router,
            bus.clone(),
        ));
        optimizer.start();
        for id in ["m_a", "m_b", "m_c", "m_d", "m_e"] {
            assert!(optimizer.offer(event("", id)));
        }
        let mut seen = Vec::new();
        for _ in 0..5 {
            let msg = tokio::time::timeout(Duration::from_millis(100), bus.receive(&CancellationToken::new()))
                .await
                .expect("message observed within 100ms")
                .unwrap();
            seen.push(msg.id);
        }
        assert_eq!(seen, vec!["m_a", "m_b", "m_c", "m_d", "m_e"]);
        optimizer.stop().await;
    }
}
