//! MaDRPC Response Types
//!
//! This module defines what a single provider call reports back.

use serde::{Deserialize, Serialize};

/// Provider call result (JSON value)
pub type RpcResult = serde_json::Value;

/// The outcome of one provider call.
///
/// # Fields
///
/// - `provider_id`: The provider that answered
/// - `latency_ms`: Time from issue to answer, in milliseconds
/// - `result`: The result value (present on success)
/// - `error`: Error message (present on failure)
///
/// # Example
///
/// ```
/// use madrpc_common::protocol::ProviderResult;
/// use serde_json::json;
///
/// let ok = ProviderResult::success("p1", 12, json!({"hits": 3}));
/// assert!(ok.is_success());
///
/// let failed = ProviderResult::error("p2", 40, "connection reset");
/// assert!(!failed.is_success());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderResult {
    pub provider_id: String,
    pub latency_ms: u64,
    pub result: Option<RpcResult>,
    pub error: Option<String>,
}

impl ProviderResult {
    pub fn success(provider_id: impl Into<String>, latency_ms: u64, result: RpcResult) -> Self {
        ProviderResult {
            provider_id: provider_id.into(),
            latency_ms,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(provider_id: impl Into<String>, latency_ms: u64, error: impl Into<String>) -> Self {
        ProviderResult {
            provider_id: provider_id.into(),
            latency_ms,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
