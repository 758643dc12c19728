//! MaDRPC Dispatch
//!
//! Client-side request dispatch and admission control. A logical request
//! names several backend businesses; this crate expands it into provider
//! calls, aggregates their answers, and watches slow calls in the background
//! for early termination and retry.
//!
//! # Components
//!
//! - [`service`] - The [`SearchService`] facade owning all shared state
//! - [`caller`] - Per-request [`ChildNodeCaller`]
//! - [`delegation`] - Background [`CallDelegationThread`] with a bounded queue
//! - [`detection`] - Early termination and retry policy
//! - [`reply`] - Per-call answer aggregation
//! - [`resource`] / [`topology`] / [`transport`] - Seams to composition,
//!   service discovery and the wire
//!
//! # Example
//!
//! ```
//! use madrpc_common::protocol::error::Result;
//! use madrpc_common::protocol::{CallSession, Generator, ProviderResult};
//! use madrpc_dispatch::{
//!     CallResource, FanOutComposer, Provider, Reply, ReplyStatus, SearchParam, SearchService,
//!     SearchServiceConfig, TopologySnapshot, Transport,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl Transport for Echo {
//!     fn issue(&self, resource: &CallResource, reply: &Arc<Reply>) -> Result<()> {
//!         reply.on_result(
//!             resource.slot,
//!             ProviderResult::success(&resource.provider.id, 1, resource.payload.clone()),
//!         );
//!         Ok(())
//!     }
//! }
//!
//! let service = SearchService::init(
//!     SearchServiceConfig::default(),
//!     Arc::new(FanOutComposer::new()),
//!     Arc::new(Echo),
//! )
//! .unwrap();
//! service.update_topology(Some(Arc::new(
//!     TopologySnapshot::new(1).with_biz("summary", vec![Provider::new("s0", "10.0.0.1:9000")]),
//! )));
//!
//! let reply = service.search(
//!     SearchParam::new(vec![Generator::new("summary", json!({"q": "rust"}))]).wait(),
//!     &CallSession::new("docs"),
//! );
//! assert_eq!(reply.status(), ReplyStatus::Completed);
//! service.stop();
//! ```

pub mod caller;
pub mod delegation;
pub mod detection;
pub mod reply;
pub mod resource;
pub mod service;
pub mod topology;
pub mod transport;

pub use caller::{AfterCall, CallerContext, ChildNodeCaller};
pub use delegation::{CallDelegationThread, CallDelegationWorkItem, DelegationConfig};
pub use detection::{DetectStatus, InflightCall, TickTime};
pub use reply::{BizReplyInfo, Reply, ReplyInfoCollector, ReplyStatus, SlotState, SlotView};
pub use resource::{CallResource, ComposedResources, FanOutComposer, ResourceComposer, ResourceKind};
pub use service::{BindParam, SearchParam, SearchService, SearchServiceConfig};
pub use topology::{Provider, TopologyHolder, TopologySnapshot};
pub use transport::{CallStream, Transport};
