//! MaDRPC Request Types
//!
//! Caller-side descriptions of a logical request: the generators that say how
//! to reach each backend business, and the session metadata that travels with
//! every provider call.

use serde::{Deserialize, Serialize};

/// Identifier used by resource composers to spread a request over providers.
pub type SourceId = u64;
/// Request payload (JSON value)
pub type RpcArgs = serde_json::Value;

/// Describes how to build requests toward one backend business.
///
/// A generator names the business, the flow-control strategy that governs
/// it, and the payload every provider of that business receives.
///
/// # Example
///
/// ```
/// use madrpc_common::protocol::Generator;
/// use serde_json::json;
///
/// let generator = Generator::new("search.summary", json!({"q": "rust"}))
///     .with_strategy("summary-flow")
///     .with_retry_disabled();
/// assert_eq!(generator.strategy, "summary-flow");
/// assert!(!generator.allows_retry());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Generator {
    /// Logical backend service identifier
    pub biz_name: String,
    /// Flow-control strategy name (defaults to the business name)
    pub strategy: String,
    /// Source id; a random one is assigned at call time when absent
    pub source_id: Option<SourceId>,
    /// Opt this generator out of retries regardless of strategy
    pub disable_retry: bool,
    /// Payload sent to every provider of the business
    pub payload: RpcArgs,
}

impl Generator {
    pub fn new(biz_name: impl Into<String>, payload: RpcArgs) -> Self {
        let biz_name = biz_name.into();
        Generator {
            strategy: biz_name.clone(),
            biz_name,
            source_id: None,
            disable_retry: false,
            payload,
        }
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = strategy.into();
        self
    }

    pub fn with_source_id(mut self, source_id: SourceId) -> Self {
        self.source_id = Some(source_id);
        self
    }

    pub fn with_retry_disabled(mut self) -> Self {
        self.disable_retry = true;
        self
    }

    /// Whether this generator permits retries at all.
    pub fn allows_retry(&self) -> bool {
        !self.disable_retry
    }
}

/// Load-balancer context carried by a session.
///
/// Composers and the retry path use it to steer provider choice; the
/// dispatch layer itself treats it as opaque apart from `excluded_providers`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LbContext {
    /// Consistent-hash key, if the caller wants sticky routing
    pub hash_key: Option<u64>,
    /// Provider ids that must not receive retries
    pub excluded_providers: Vec<String>,
}

impl LbContext {
    pub fn is_excluded(&self, provider_id: &str) -> bool {
        self.excluded_providers.iter().any(|p| p == provider_id)
    }
}

/// Per-request session metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CallSession {
    /// Source tag of the caller
    pub src: String,
    /// A/B experiment tag
    pub ab_tag: String,
    /// Whether this is stress-test traffic
    pub stress_test: bool,
    pub lb_context: LbContext,
}

impl CallSession {
    pub fn new(src: impl Into<String>) -> Self {
        CallSession {
            src: src.into(),
            ..Default::default()
        }
    }

    pub fn with_ab_tag(mut self, ab_tag: impl Into<String>) -> Self {
        self.ab_tag = ab_tag.into();
        self
    }

    pub fn with_stress_test(mut self, stress_test: bool) -> Self {
        self.stress_test = stress_test;
        self
    }

    pub fn with_lb_context(mut self, lb_context: LbContext) -> Self {
        self.lb_context = lb_context;
        self
    }
}

/// Generates a random source id.
pub fn generate_source_id() -> SourceId {
    rand::random::<SourceId>()
}
