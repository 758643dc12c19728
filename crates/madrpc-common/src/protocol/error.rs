use thiserror::Error;

/// Errors raised by the dispatch layer.
///
/// Configuration errors are recovered locally (the previously published
/// snapshot stays in place), resource errors end up inside the call's reply,
/// and queue admission drops never leave the delegation thread.
#[derive(Error, Debug)]
pub enum MadrpcError {
    #[error("Invalid flow config for strategy '{strategy}': {reason}")]
    InvalidFlowConfig { strategy: String, reason: String },

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Topology unavailable: {0}")]
    TopologyUnavailable(String),

    #[error("No call resource produced: {0}")]
    NoResource(String),

    #[error("Invalid generator: {0}")]
    InvalidGenerator(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MadrpcError {
    /// Shorthand for building an [`MadrpcError::InvalidFlowConfig`].
    pub fn invalid_flow_config(strategy: impl Into<String>, reason: impl Into<String>) -> Self {
        MadrpcError::InvalidFlowConfig {
            strategy: strategy.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error belongs to the configuration class.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            MadrpcError::InvalidFlowConfig { .. } | MadrpcError::JsonSerialization(_)
        )
    }

    /// Whether this error means no provider call could be produced.
    pub fn is_resource_error(&self) -> bool {
        matches!(
            self,
            MadrpcError::TopologyUnavailable(_) | MadrpcError::NoResource(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MadrpcError>;
