//! Request Queue Manager
//!
//! One FIFO queue per upstream service class (STT, TTS, LLM). `submit`
//! fast-rejects with `QueueFull` at the pending limit, otherwise the item is
//! dispatched in submission order, bounded by the class's max-concurrency.
//! Dispatch acquires a connection slot from the pool; `Busy` keeps the item
//! at the head of its queue and retries after a short backoff, so pool
//! exhaustion is never surfaced to the submitting caller.
//!
//! Classes are isolated: each has its own dispatcher task and its own
//! pending list, so an LLM backlog cannot starve STT capacity.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::error::{PerfError, PerfResult};
use crate::monitoring::metrics;
use crate::pool::{AcquireOutcome, ConnectionPool, PoolSlot};

/// Rolling-window size for wait/processing latency averages
const LATENCY_WINDOW: usize = 100;
/// Dispatcher wakes at least this often to prune expired pending items
const PRUNE_TICK: Duration = Duration::from_millis(100);

pub type WorkOutput = PerfResult<Vec<u8>>;
type BoxWorkFuture = BoxFuture<'static, WorkOutput>;

/// Upstream service class; one named queue each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueClass {
    Stt,
    Tts,
    Llm,
}

impl QueueClass {
    pub const ALL: [QueueClass; 3] = [QueueClass::Stt, QueueClass::Tts, QueueClass::Llm];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueClass::Stt => "stt",
            QueueClass::Tts => "tts",
            QueueClass::Llm => "llm",
        }
    }
}

impl std::fmt::Display for QueueClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work, owned by the queue from admission until dispatch
struct QueueItem {
    enqueued_at: Instant,
    deadline: Instant,
    work: BoxWorkFuture,
    tx: oneshot::Sender<WorkOutput>,
}

struct LatencyWindow {
    samples: VecDeque<u64>,
}

impl LatencyWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(LATENCY_WINDOW),
        }
    }

    fn record(&mut self, ms: u64) {
        if self.samples.len() == LATENCY_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
    }

    fn avg(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }
}

/// Sliding one-minute completion counter
struct ThroughputWindow {
    completions: VecDeque<Instant>,
}

impl ThroughputWindow {
    fn new() -> Self {
        Self {
            completions: VecDeque::new(),
        }
    }

    fn record(&mut self, now: Instant) {
        self.completions.push_back(now);
        self.prune(now);
    }

    fn per_minute(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.completions.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.completions.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                self.completions.pop_front();
            } else {
                break;
            }
        }
    }
}

struct NamedQueue {
    class: QueueClass,
    host: String,
    max_concurrency: usize,
    max_pending: usize,
    pending: Mutex<VecDeque<QueueItem>>,
    /// Reserved under the pending lock, so it never overshoots max_concurrency
    in_flight: AtomicUsize,
    /// True while the dispatcher holds a popped head item (for example during
    /// Busy backoff); blocks the submit fast path so nothing overtakes it
    dispatch_hold: AtomicBool,
    notify: Notify,
    wait_ms: Mutex<LatencyWindow>,
    processing_ms: Mutex<LatencyWindow>,
    throughput: Mutex<ThroughputWindow>,
    rejected_total: AtomicU64,
    timed_out_total: AtomicU64,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
    /// Set while in-flight is pinned at max with a non-empty backlog
    saturated_since: Mutex<Option<Instant>>,
    high_load_latched: AtomicBool,
}

impl NamedQueue {
    fn pending_ratio(&self, pending_len: usize) -> f64 {
        if self.max_pending == 0 {
            return 1.0;
        }
        pending_len as f64 / self.max_pending as f64
    }

    /// High-load evaluation with hysteresis: latches on at `threshold`,
    /// releases below `threshold - 0.1`, so one borderline sample can't flap
    /// the signal. Saturation (pinned at max-concurrency with a backlog)
    /// counts only once it has persisted beyond `grace`.
    fn evaluate_high_load(&self, threshold: f64, grace: Duration) -> bool {
        let pending_len = self.pending.lock().len();
        let ratio = self.pending_ratio(pending_len);

        let latched = self.high_load_latched.load(Ordering::Relaxed);
        let ratio_high = if latched {
            ratio > (threshold - 0.1).max(0.0)
        } else {
            ratio >= threshold
        };
        self.high_load_latched.store(ratio_high, Ordering::Relaxed);

        let pinned =
            self.in_flight.load(Ordering::SeqCst) >= self.max_concurrency && pending_len > 0;
        let pinned_long = {
            let mut since = self.saturated_since.lock();
            if pinned {
                since.get_or_insert_with(Instant::now).elapsed() >= grace
            } else {
                *since = None;
                false
            }
        };

        ratio_high || pinned_long
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub max_concurrency: usize,
    pub max_pending: usize,
    pub avg_wait_ms: f64,
    pub avg_processing_ms: f64,
    pub throughput_per_minute: usize,
    pub rejected_total: u64,
    pub timed_out_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueDetailedStats {
    pub queues: HashMap<&'static str, QueueStats>,
    pub total_pending: usize,
    pub high_load: bool,
}

pub struct RequestQueueManager {
    config: QueueConfig,
    queues: HashMap<QueueClass, Arc<NamedQueue>>,
    pool: Arc<ConnectionPool>,
    shutdown: Notify,
    shutting_down: AtomicBool,
}

impl RequestQueueManager {
    pub fn new(config: QueueConfig, pool: Arc<ConnectionPool>) -> Arc<Self> {
        let mut queues = HashMap::new();
        for class in QueueClass::ALL {
            let class_cfg = config.class(class);
            queues.insert(
                class,
                Arc::new(NamedQueue {
                    class,
                    host: class_cfg.host.clone(),
                    max_concurrency: class_cfg.max_concurrency,
                    max_pending: class_cfg.max_pending,
                    pending: Mutex::new(VecDeque::new()),
                    in_flight: AtomicUsize::new(0),
                    dispatch_hold: AtomicBool::new(false),
                    notify: Notify::new(),
                    wait_ms: Mutex::new(LatencyWindow::new()),
                    processing_ms: Mutex::new(LatencyWindow::new()),
                    throughput: Mutex::new(ThroughputWindow::new()),
                    rejected_total: AtomicU64::new(0),
                    timed_out_total: AtomicU64::new(0),
                    completed_total: AtomicU64::new(0),
                    failed_total: AtomicU64::new(0),
                    saturated_since: Mutex::new(None),
                    high_load_latched: AtomicBool::new(false),
                }),
            );
        }
        Arc::new(Self {
            config,
            queues,
            pool,
            shutdown: Notify::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    fn queue(&self, class: QueueClass) -> &Arc<NamedQueue> {
        &self.queues[&class]
    }

    /// Spawn one dispatcher task per class. Must be called before queued
    /// items can dispatch; the synchronous fast path in `submit` works
    /// regardless.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        QueueClass::ALL
            .iter()
            .map(|class| {
                let mgr = Arc::clone(self);
                let queue = Arc::clone(self.queue(*class));
                tokio::spawn(async move { dispatch_loop(mgr, queue).await })
            })
            .collect()
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Submit one unit of work to the named queue.
    ///
    /// Resolves with the work's result, `QueueFull` when the pending limit is
    /// already reached, or `Timeout` once `deadline` elapses - whether the
    /// item was still pending or already in flight. An in-flight upstream
    /// call is never cancelled; it finishes in the background so its result
    /// can still populate the cache.
    pub async fn submit<F, Fut>(
        &self,
        class: QueueClass,
        work: F,
        deadline: Duration,
    ) -> WorkOutput
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = WorkOutput> + Send + 'static,
    {
        enum Admission {
            Dispatch(QueueItem, PoolSlot),
            Enqueued,
            Rejected(usize),
        }

        let queue = Arc::clone(self.queue(class));
        let now = Instant::now();
        let (tx, rx) = oneshot::channel();
        let item = QueueItem {
            enqueued_at: now,
            deadline: now + deadline,
            work: Box::pin(work()),
            tx,
        };

        let admission = {
            let mut pending = queue.pending.lock();
            if pending.len() >= queue.max_pending {
                Admission::Rejected(pending.len())
            } else if pending.is_empty()
                && !queue.dispatch_hold.load(Ordering::SeqCst)
                && queue.in_flight.load(Ordering::SeqCst) < queue.max_concurrency
            {
                // Fast path: nothing ahead of us and a free slot. FIFO-safe
                // because the pending lock is held across the check.
                match self.pool.acquire(&queue.host) {
                    AcquireOutcome::Acquired(slot) => {
                        queue.in_flight.fetch_add(1, Ordering::SeqCst);
                        Admission::Dispatch(item, slot)
                    }
                    AcquireOutcome::Busy => {
                        pending.push_back(item);
                        Admission::Enqueued
                    }
                }
            } else {
                pending.push_back(item);
                Admission::Enqueued
            }
        };

        match admission {
            Admission::Rejected(pending_len) => {
                queue.rejected_total.fetch_add(1, Ordering::Relaxed);
                metrics::QUEUE_REJECTIONS_TOTAL
                    .with_label_values(&[class.as_str()])
                    .inc();
                tracing::warn!(
                    queue = %class,
                    pending = pending_len,
                    "submission rejected: queue full"
                );
                return Err(PerfError::QueueFull {
                    queue: class,
                    pending: pending_len,
                    max_pending: queue.max_pending,
                });
            }
            Admission::Dispatch(item, slot) => {
                queue.wait_ms.lock().record(0);
                spawn_in_flight(Arc::clone(&queue), Arc::clone(&self.pool), item, slot);
            }
            Admission::Enqueued => queue.notify.notify_one(),
        }

        await_result(&queue, class, rx, deadline).await
    }

    /// Pending-to-max-pending ratio per class, the raw load signal.
    pub fn current_load(&self) -> HashMap<&'static str, f64> {
        QueueClass::ALL
            .iter()
            .map(|class| {
                let queue = self.queue(*class);
                let len = queue.pending.lock().len();
                (class.as_str(), queue.pending_ratio(len))
            })
            .collect()
    }

    /// Single backpressure signal for external callers: shed load (for
    /// example, refuse new interview sessions) while this is true.
    pub fn is_high_load(&self) -> bool {
        self.queues.values().any(|queue| {
            queue.evaluate_high_load(self.config.high_load_ratio, self.config.saturation_grace)
        })
    }

    pub fn detailed_stats(&self) -> QueueDetailedStats {
        let now = Instant::now();
        let mut queues = HashMap::new();
        let mut total_pending = 0usize;
        for class in QueueClass::ALL {
            let queue = self.queue(class);
            let pending = queue.pending.lock().len();
            total_pending += pending;
            queues.insert(
                class.as_str(),
                QueueStats {
                    pending,
                    in_flight: queue.in_flight.load(Ordering::SeqCst),
                    max_concurrency: queue.max_concurrency,
                    max_pending: queue.max_pending,
                    avg_wait_ms: queue.wait_ms.lock().avg(),
                    avg_processing_ms: queue.processing_ms.lock().avg(),
                    throughput_per_minute: queue.throughput.lock().per_minute(now),
                    rejected_total: queue.rejected_total.load(Ordering::Relaxed),
                    timed_out_total: queue.timed_out_total.load(Ordering::Relaxed),
                    completed_total: queue.completed_total.load(Ordering::Relaxed),
                    failed_total: queue.failed_total.load(Ordering::Relaxed),
                },
            );
        }
        QueueDetailedStats {
            queues,
            total_pending,
            high_load: self.is_high_load(),
        }
    }
}

/// Await the result channel under the caller's deadline. The deadline is the
/// only cancellation path, and it cancels only the caller's wait.
async fn await_result(
    queue: &NamedQueue,
    class: QueueClass,
    rx: oneshot::Receiver<WorkOutput>,
    deadline: Duration,
) -> WorkOutput {
    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(result)) => result,
        // Dispatcher dropped the sender without resolving; shutdown path.
        Ok(Err(_)) => Err(PerfError::upstream("queue dispatcher went away")),
        Err(_) => {
            queue.timed_out_total.fetch_add(1, Ordering::Relaxed);
            metrics::QUEUE_TIMEOUTS_TOTAL
                .with_label_values(&[class.as_str()])
                .inc();
            Err(PerfError::Timeout {
                queue: class,
                deadline_ms: deadline.as_millis() as u64,
            })
        }
    }
}

/// Run one dispatched item to completion on its own task, then release the
/// slot and record stats. `tx.send` fails harmlessly when the caller already
/// timed out.
fn spawn_in_flight(
    queue: Arc<NamedQueue>,
    pool: Arc<ConnectionPool>,
    item: QueueItem,
    slot: PoolSlot,
) {
    tokio::spawn(async move {
        let started = Instant::now();
        let result = item.work.await;
        pool.release(slot);

        let elapsed = started.elapsed();
        queue.processing_ms.lock().record(elapsed.as_millis() as u64);
        queue.throughput.lock().record(Instant::now());
        match &result {
            Ok(_) => {
                queue.completed_total.fetch_add(1, Ordering::Relaxed);
                metrics::UPSTREAM_CALLS_TOTAL
                    .with_label_values(&[queue.class.as_str(), "ok"])
                    .inc();
            }
            Err(err) => {
                queue.failed_total.fetch_add(1, Ordering::Relaxed);
                metrics::UPSTREAM_CALLS_TOTAL
                    .with_label_values(&[queue.class.as_str(), "error"])
                    .inc();
                tracing::warn!(queue = %queue.class, error = %err, "upstream call failed");
            }
        }
        queue.in_flight.fetch_sub(1, Ordering::SeqCst);
        let _ = item.tx.send(result);
        queue.notify.notify_one();
    });
}

/// Resolve `item` with `Timeout`. The send fails when the caller's own
/// deadline already fired and counted; only a delivered send counts here.
fn resolve_timeout(queue: &NamedQueue, item: QueueItem) {
    let deadline_ms = item
        .deadline
        .saturating_duration_since(item.enqueued_at)
        .as_millis() as u64;
    let delivered = item
        .tx
        .send(Err(PerfError::Timeout {
            queue: queue.class,
            deadline_ms,
        }))
        .is_ok();
    if delivered {
        queue.timed_out_total.fetch_add(1, Ordering::Relaxed);
        metrics::QUEUE_TIMEOUTS_TOTAL
            .with_label_values(&[queue.class.as_str()])
            .inc();
    }
}

/// Remove pending items whose deadline passed or whose caller stopped
/// waiting. Keeps `total_pending` honest between dispatches.
fn prune_pending(queue: &NamedQueue, pending: &mut VecDeque<QueueItem>) {
    let now = Instant::now();
    let mut i = 0;
    while i < pending.len() {
        let expired = {
            let item = &pending[i];
            item.tx.is_closed() || now >= item.deadline
        };
        if expired {
            // remove preserves FIFO order of the remainder
            if let Some(item) = pending.remove(i) {
                resolve_timeout(queue, item);
            }
        } else {
            i += 1;
        }
    }
}

async fn dispatch_loop(mgr: Arc<RequestQueueManager>, queue: Arc<NamedQueue>) {
    tracing::debug!(queue = %queue.class, host = %queue.host, "dispatcher started");
    loop {
        if mgr.shutting_down.load(Ordering::SeqCst) {
            break;
        }

        // Reserve an in-flight slot and pop the head under one lock, so the
        // fast path in `submit` can never push us past max-concurrency.
        let popped = {
            let mut pending = queue.pending.lock();
            prune_pending(&queue, &mut pending);
            if queue.in_flight.load(Ordering::SeqCst) < queue.max_concurrency {
                let item = pending.pop_front();
                if item.is_some() {
                    queue.in_flight.fetch_add(1, Ordering::SeqCst);
                    queue.dispatch_hold.store(true, Ordering::SeqCst);
                }
                item
            } else {
                None
            }
        };

        let Some(item) = popped else {
            tokio::select! {
                _ = queue.notify.notified() => {}
                _ = tokio::time::sleep(PRUNE_TICK) => {}
                _ = mgr.shutdown.notified() => break,
            }
            continue;
        };

        if item.tx.is_closed() {
            queue.in_flight.fetch_sub(1, Ordering::SeqCst);
            queue.dispatch_hold.store(false, Ordering::SeqCst);
            continue;
        }

        // Head-of-line pool acquisition. Busy is transient: hold the item
        // (it stays at the front, nothing can overtake it) and retry with
        // backoff until a slot frees or the item's deadline passes.
        let slot = loop {
            match mgr.pool.acquire(&queue.host) {
                AcquireOutcome::Acquired(slot) => break Some(slot),
                AcquireOutcome::Busy => {
                    if item.tx.is_closed() || Instant::now() >= item.deadline {
                        break None;
                    }
                    tokio::time::sleep(mgr.config.busy_backoff).await;
                }
            }
        };

        match slot {
            Some(slot) => {
                let waited = item.enqueued_at.elapsed();
                queue.wait_ms.lock().record(waited.as_millis() as u64);
                spawn_in_flight(Arc::clone(&queue), Arc::clone(&mgr.pool), item, slot);
            }
            None => {
                // Deadline passed while waiting for a slot
                queue.in_flight.fetch_sub(1, Ordering::SeqCst);
                resolve_timeout(&queue, item);
            }
        }
        queue.dispatch_hold.store(false, Ordering::SeqCst);
    }
    tracing::debug!(queue = %queue.class, "dispatcher stopped");
}
