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

use crate::registry::MetricsRegistry;
use crate::snapshot::MetricsSnapshot;
use std::sync::Arc;

/// Sink for dispatch-layer metrics.
///
/// The dispatch layer reports through this trait so the emission format stays
/// pluggable. Every method must be cheap and non-blocking: they are called on
/// the request path and from the delegation tick.
///
/// # Example
///
/// ```rust
/// use madrpc_metrics::{DispatchMetricsCollector, MetricsCollector};
///
/// let collector = DispatchMetricsCollector::new();
/// collector.record_request();
/// collector.record_call("biz.a", 2);
/// collector.report_queue_depth(5);
///
/// let snapshot = collector.snapshot();
/// assert_eq!(snapshot.total_calls, 1);
/// assert_eq!(snapshot.delegation_queue_depth, 5);
/// ```
pub trait MetricsCollector: Send + Sync {
    /// Records one logical request entering the dispatch layer.
    fn record_request(&self);

    /// Records the call toward one business.
    ///
    /// # Arguments
    /// * `biz_name` - The business name
    /// * `expected_providers` - Providers the composer planned for this business
    fn record_call(&self, biz_name: &str, expected_providers: u64);

    /// Records a request whose reply failed before any provider was called.
    fn record_failure(&self);

    /// Records a request that registered for asynchronous detection.
    fn record_detection(&self);

    /// Reports the delegation queue depth after a tick.
    fn report_queue_depth(&self, depth: usize);

    /// Records a work item dropped because the delegation queue was full.
    fn record_drop(&self);

    /// Records one retry issued toward `biz_name`.
    fn record_retry(&self, biz_name: &str);

    /// Records one early termination of `biz_name`.
    fn record_early_termination(&self, biz_name: &str);

    /// Takes a snapshot of the current metrics state.
    fn snapshot(&self) -> MetricsSnapshot;
}

/// Registry-backed [`MetricsCollector`].
pub struct DispatchMetricsCollector {
    registry: Arc<MetricsRegistry>,
}

impl DispatchMetricsCollector {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(MetricsRegistry::new()),
        }
    }

    /// Creates a collector over an existing registry.
    ///
    /// Useful for sharing one registry between several collectors.
    pub fn with_registry(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }
}

impl Default for DispatchMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector for DispatchMetricsCollector {
    fn record_request(&self) {
        self.registry.increment_total();
    }

    fn record_call(&self, biz_name: &str, expected_providers: u64) {
        self.registry.record_call(biz_name, expected_providers);
    }

    fn record_failure(&self) {
        self.registry.increment_failure();
    }

    fn record_detection(&self) {
        self.registry.increment_detection();
    }

    fn report_queue_depth(&self, depth: usize) {
        self.registry.set_queue_depth(depth as u64);
    }

    fn record_drop(&self) {
        self.registry.increment_dropped();
    }

    fn record_retry(&self, biz_name: &str) {
        self.registry.record_retry(biz_name);
    }

    fn record_early_termination(&self, biz_name: &str) {
        self.registry.record_early_termination(biz_name);
    }

    fn snapshot(&self) -> MetricsSnapshot {
        self.registry.snapshot()
    }
}
