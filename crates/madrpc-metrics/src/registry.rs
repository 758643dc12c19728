// Copyright 2025 MaDRPC Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::snapshot::{BizMetrics, MetricsSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Instant;

/// Internal storage for per-business metrics.
///
/// # Thread Safety
///
/// All fields use atomic operations for lock-free concurrent access once the
/// entry exists.
#[derive(Debug, Default)]
struct BizStats {
    call_count: AtomicU64,
    expected_providers: AtomicU64,
    retry_count: AtomicU64,
    early_termination_count: AtomicU64,
}

impl BizStats {
    fn snapshot(&self) -> BizMetrics {
        // Relaxed ordering is enough for a best-effort point-in-time snapshot
        BizMetrics {
            call_count: self.call_count.load(Ordering::Relaxed),
            expected_providers: self.expected_providers.load(Ordering::Relaxed),
            retry_count: self.retry_count.load(Ordering::Relaxed),
            early_termination_count: self.early_termination_count.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe dispatch metrics registry.
///
/// # Concurrency Model
///
/// - **Global counters**: lock-free `AtomicU64` with relaxed ordering
/// - **Per-business stats**: lock-free `AtomicU64` once the entry is created
/// - **Business registry**: `RwLock`, probed under the read lock and written
///   only when a business is seen for the first time
///
/// # Example
///
/// ```rust
/// use madrpc_metrics::MetricsRegistry;
///
/// let registry = MetricsRegistry::new();
/// registry.record_call("biz.a", 3);
///
/// let snapshot = registry.snapshot();
/// assert_eq!(snapshot.total_calls, 1);
/// assert_eq!(snapshot.bizs["biz.a"].expected_providers, 3);
/// ```
#[derive(Debug)]
pub struct MetricsRegistry {
    total_calls: AtomicU64,
    failed_calls: AtomicU64,
    detection_calls: AtomicU64,
    delegation_queue_depth: AtomicU64,
    delegation_dropped: AtomicU64,
    bizs: StdRwLock<HashMap<String, Arc<BizStats>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            detection_calls: AtomicU64::new(0),
            delegation_queue_depth: AtomicU64::new(0),
            delegation_dropped: AtomicU64::new(0),
            bizs: StdRwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Records one dispatched call toward `biz_name`.
    ///
    /// # Arguments
    /// * `biz_name` - The backend business that was called
    /// * `expected_providers` - Number of providers the composer planned for it
    pub fn record_call(&self, biz_name: &str, expected_providers: u64) {
        let stats = self.biz_stats(biz_name);
        stats.call_count.fetch_add(1, Ordering::Relaxed);
        stats
            .expected_providers
            .store(expected_providers, Ordering::Relaxed);
    }

    /// Counts one logical request (all businesses together).
    pub fn increment_total(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_detection(&self) {
        self.detection_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.delegation_queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn increment_dropped(&self) {
        self.delegation_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self, biz_name: &str) {
        self.biz_stats(biz_name)
            .retry_count
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_early_termination(&self, biz_name: &str) {
        self.biz_stats(biz_name)
            .early_termination_count
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Milliseconds since the registry was created.
    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Takes a snapshot of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::new(self.uptime_ms());
        snapshot.total_calls = self.total_calls.load(Ordering::Relaxed);
        snapshot.failed_calls = self.failed_calls.load(Ordering::Relaxed);
        snapshot.detection_calls = self.detection_calls.load(Ordering::Relaxed);
        snapshot.delegation_queue_depth = self.delegation_queue_depth.load(Ordering::Relaxed);
        snapshot.delegation_dropped = self.delegation_dropped.load(Ordering::Relaxed);

        let bizs = self.bizs.read().unwrap();
        snapshot.bizs = bizs
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();
        snapshot
    }

    fn biz_stats(&self, biz_name: &str) -> Arc<BizStats> {
        if let Some(stats) = self.bizs.read().unwrap().get(biz_name) {
            return stats.clone();
        }

        let mut bizs = self.bizs.write().unwrap();
        bizs.entry(biz_name.to_string())
            .or_insert_with(|| Arc::new(BizStats::default()))
            .clone()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_empty_snapshot() {
        let registry = MetricsRegistry::new();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_calls, 0);
        assert_eq!(snapshot.delegation_dropped, 0);
        assert!(snapshot.bizs.is_empty());
    }

    #[test]
    fn test_record_call_per_biz() {
        let registry = MetricsRegistry::new();
        registry.record_call("a", 2);
        registry.record_call("a", 4);
        registry.record_call("b", 1);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.bizs.len(), 2);
        assert_eq!(snapshot.bizs["a"].call_count, 2);
        assert_eq!(snapshot.bizs["a"].expected_providers, 4);
        assert_eq!(snapshot.bizs["b"].call_count, 1);
    }

    #[test]
    fn test_global_counters() {
        let registry = MetricsRegistry::new();
        registry.increment_total();
        registry.increment_total();
        registry.increment_failure();
        registry.increment_detection();
        registry.increment_dropped();
        registry.set_queue_depth(17);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_calls, 2);
        assert_eq!(snapshot.failed_calls, 1);
        assert_eq!(snapshot.detection_calls, 1);
        assert_eq!(snapshot.delegation_dropped, 1);
        assert_eq!(snapshot.delegation_queue_depth, 17);
    }

    #[test]
    fn test_retry_and_early_termination() {
        let registry = MetricsRegistry::new();
        registry.record_retry("a");
        registry.record_retry("a");
        registry.record_early_termination("b");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.bizs["a"].retry_count, 2);
        assert_eq!(snapshot.bizs["b"].early_termination_count, 1);
        assert_eq!(snapshot.total_retries(), 2);
    }

    #[test]
    fn test_concurrent_recording() {
        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        registry.record_call("shared", 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.snapshot().bizs["shared"].call_count, 1000);
    }
}
