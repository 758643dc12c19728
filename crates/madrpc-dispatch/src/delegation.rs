//! Call delegation thread.
//!
//! Calls that opt into detection are handed to a single background thread
//! that re-evaluates them on a fixed tick. Producers append to a bounded push
//! queue; the tick owns a separate active queue and splices the push queue
//! into it once per pass, so callers never wait on an evaluation.
//!
//! # Admission
//!
//! When the push queue already holds `queue_max_size` items the new item is
//! dropped on the spot and counted. The call itself is unaffected; it only
//! loses early termination and retries.

use crate::detection::{DetectStatus, InflightCall, TickTime};
use crate::reply::Reply;
use crate::topology::{TopologyHolder, TopologySnapshot};
use madrpc_common::protocol::error::Result;
use madrpc_metrics::MetricsCollector;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Delegation thread configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    /// Tick interval in milliseconds
    pub interval_ms: u64,
    /// Push queue bound; items beyond it are dropped
    pub queue_max_size: usize,
    /// How long `stop` waits for the queues to drain
    pub stop_drain_timeout_ms: u64,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2,
            queue_max_size: 100_000,
            stop_drain_timeout_ms: 5_000,
        }
    }
}

impl DelegationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// One in-flight call owned by the delegation queues.
pub struct CallDelegationWorkItem {
    call: InflightCall,
}

impl CallDelegationWorkItem {
    pub fn new(call: InflightCall) -> Self {
        Self { call }
    }

    pub fn evaluate(&self, now: &TickTime, topology: Option<&TopologySnapshot>) -> DetectStatus {
        self.call.detect(now, topology)
    }

    pub fn reply(&self) -> &Arc<Reply> {
        self.call.reply()
    }
}

struct Worker {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

struct Inner {
    config: DelegationConfig,
    push_queue: Mutex<VecDeque<CallDelegationWorkItem>>,
    active_queue: Mutex<VecDeque<CallDelegationWorkItem>>,
    /// Items owned by either queue or by the pass evaluating them
    depth: AtomicUsize,
    dropped: AtomicU64,
    accepting: AtomicBool,
    topology: Arc<TopologyHolder>,
    metrics: Arc<dyn MetricsCollector>,
}

impl Inner {
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.work_loop(),
                _ = shutdown.changed() => break,
            }
        }
        self.release_leftovers();
        debug!("Delegation tick stopped");
    }

    /// One evaluation pass over the active queue, then splice in new arrivals.
    fn work_loop(&self) {
        let now = TickTime::now();
        let topology = self.topology.current();

        // No queue lock is held while evaluating: retries reach the transport
        // and completion callbacks may call back into the thread handle.
        let mut active = std::mem::take(&mut *self.active_queue.lock().unwrap());
        let before = active.len();
        active.retain(|item| item.evaluate(&now, topology.as_deref()) == DetectStatus::StillPending);
        self.depth.fetch_sub(before - active.len(), Ordering::AcqRel);

        let mut arrivals = std::mem::take(&mut *self.push_queue.lock().unwrap());
        active.append(&mut arrivals);
        self.active_queue.lock().unwrap().append(&mut active);

        self.metrics.report_queue_depth(self.depth());
    }

    /// Drops everything still queued, counting each item as dropped.
    fn release_leftovers(&self) {
        let mut leftovers: Vec<CallDelegationWorkItem> =
            self.active_queue.lock().unwrap().drain(..).collect();
        leftovers.extend(self.push_queue.lock().unwrap().drain(..));
        for item in leftovers {
            warn!(
                "Dropping undrained delegation work item ({} pending slots)",
                item.reply().pending_count()
            );
            self.depth.fetch_sub(1, Ordering::AcqRel);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_drop();
        }
        self.metrics.report_queue_depth(self.depth());
    }

    fn record_drop(&self) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.record_drop();
        if dropped == 1 || dropped % 1024 == 0 {
            warn!(
                "Delegation queue full (max {}), {} work items dropped so far",
                self.config.queue_max_size, dropped
            );
        }
    }

    fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

/// Periodic re-evaluator for calls with detection on.
pub struct CallDelegationThread {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl CallDelegationThread {
    pub fn new(
        config: DelegationConfig,
        topology: Arc<TopologyHolder>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                push_queue: Mutex::new(VecDeque::new()),
                active_queue: Mutex::new(VecDeque::new()),
                depth: AtomicUsize::new(0),
                dropped: AtomicU64::new(0),
                accepting: AtomicBool::new(true),
                topology,
                metrics,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the tick thread. Calling it on a running thread is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime or the OS thread cannot be created.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("madrpc-delegation".to_string())
            .spawn(move || runtime.block_on(inner.run(shutdown_rx)))?;

        self.inner.accepting.store(true, Ordering::Release);
        *worker = Some(Worker { handle, shutdown });
        info!(
            "Delegation thread started (interval {}ms, queue max {})",
            self.inner.config.interval_ms, self.inner.config.queue_max_size
        );
        Ok(())
    }

    /// Queues `item` for evaluation on the next tick.
    ///
    /// # Returns
    ///
    /// `false` if the item was dropped (queue full or thread stopped).
    pub fn push_work_item(&self, item: CallDelegationWorkItem) -> bool {
        let mut queue = self.inner.push_queue.lock().unwrap();
        // Checked under the push lock so nothing lands after `stop` drained
        if !self.inner.accepting.load(Ordering::Acquire)
            || queue.len() >= self.inner.config.queue_max_size
        {
            drop(queue);
            self.inner.record_drop();
            return false;
        }
        queue.push_back(item);
        self.inner.depth.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Items tracked by the thread, queued or being evaluated.
    pub fn queue_depth(&self) -> usize {
        self.inner.depth()
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().unwrap().is_some()
    }

    pub fn config(&self) -> &DelegationConfig {
        &self.inner.config
    }

    /// Drains the queues (bounded by `stop_drain_timeout_ms`), stops the tick
    /// and drops whatever is still queued.
    pub fn stop(&self) {
        self.inner.accepting.store(false, Ordering::Release);

        // From a completion callback the tick cannot advance until we return
        if self.is_running() && !self.on_worker_thread() {
            let deadline =
                Instant::now() + Duration::from_millis(self.inner.config.stop_drain_timeout_ms);
            while self.queue_depth() > 0 && Instant::now() < deadline {
                std::thread::sleep(self.inner.config.interval());
            }
        }
        self.shutdown_worker();
        self.inner.release_leftovers();
    }

    fn on_worker_thread(&self) -> bool {
        self.worker
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|worker| worker.handle.thread().id() == std::thread::current().id())
    }

    fn shutdown_worker(&self) {
        let Some(worker) = self.worker.lock().unwrap().take() else {
            return;
        };
        let _ = worker.shutdown.send(true);
        if worker.handle.thread().id() == std::thread::current().id() {
            return;
        }
        if worker.handle.join().is_err() {
            warn!("Delegation thread panicked");
        } else {
            info!("Delegation thread stopped");
        }
    }

    #[cfg(test)]
    fn tick(&self) {
        self.inner.work_loop();
    }
}

impl Drop for CallDelegationThread {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}
