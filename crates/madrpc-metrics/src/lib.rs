//! MaDRPC Dispatch Metrics
//!
//! This crate provides a thread-safe metrics sink for the MaDRPC dispatch
//! layer: request and failure counts, per-business call statistics, and the
//! health of the asynchronous delegation queue (depth and drops).
//!
//! # Architecture
//!
//! - [`MetricsRegistry`]: Thread-safe storage with lock-free counters
//! - [`MetricsCollector`]: Trait the dispatch layer reports through
//! - [`MetricsSnapshot`]: Serializable snapshot of current metrics state
//!
//! # Usage Example
//!
//! ```rust
//! use madrpc_metrics::{DispatchMetricsCollector, MetricsCollector};
//!
//! let collector = DispatchMetricsCollector::new();
//! collector.record_request();
//! collector.record_call("search.summary", 4);
//!
//! let snapshot = collector.snapshot();
//! println!("Total calls: {}", snapshot.total_calls);
//! ```
//!
//! # Thread Safety
//!
//! Collectors are `Send + Sync` and meant to be shared behind an `Arc`.
//! Counter updates are relaxed atomics; the per-business map takes a write
//! lock only the first time a business is seen.

mod collector;
mod registry;
mod snapshot;

pub use collector::{DispatchMetricsCollector, MetricsCollector};
pub use registry::MetricsRegistry;
pub use snapshot::{BizMetrics, MetricsSnapshot};
