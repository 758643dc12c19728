//! MaDRPC Common Types and Flow Control
//!
//! This crate provides the protocol definitions and flow-control primitives
//! shared by the MaDRPC dispatch layer.
//!
//! # Overview
//!
//! A logical request fans out to several named backend businesses. Each
//! business is described by a [`Generator`]; the dispatch layer expands
//! generators into provider calls and decides, per flow-control strategy,
//! whether a call may terminate early or retry stragglers.
//!
//! # Components
//!
//! - [`protocol`] - Generators, sessions, provider results and the error type
//! - [`flow_config`] - Per-strategy policy and the immutable config snapshot
//! - [`rate_limit`] - Per-strategy, per-second retry admission
//! - [`latency`] - Per-business moving-average latency
//!
//! # Example
//!
//! ```
//! use madrpc_common::flow_config::{FlowConfigSnapshot, FlowControlConfig};
//! use madrpc_common::rate_limit::RetryLimitChecker;
//!
//! let mut snapshot = FlowConfigSnapshot::new();
//! snapshot.update("s1", Some(FlowControlConfig::default().with_retry(true).with_retry_count_limit(1)));
//!
//! let checker = RetryLimitChecker::new();
//! let limit = snapshot.get_flow_control_config("s1").retry_count_limit;
//! assert!(checker.can_retry("s1", 10, limit));
//! assert!(!checker.can_retry("s1", 10, limit));
//! ```

pub mod flow_config;
pub mod latency;
pub mod protocol;
pub mod rate_limit;

pub use flow_config::{FlowConfigSnapshot, FlowControlConfig, FlowControlSwitch};
pub use latency::{LatencyTimeSnapshot, LatencyTimeWindow};
pub use protocol::*;
pub use rate_limit::RetryLimitChecker;
