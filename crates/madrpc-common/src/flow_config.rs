//! Flow-Control Configuration
//!
//! Per-strategy flow-control policy and the immutable snapshot that maps
//! strategy names to policies.
//!
//! # Snapshot Model
//!
//! A [`FlowConfigSnapshot`] is never mutated once it has been published.
//! Updates go through clone-mutate-publish: the writer clones the current
//! snapshot, applies its change to the private copy, and swaps the shared
//! pointer. Calls that captured the old snapshot keep reading it until they
//! finish.
//!
//! # Example
//!
//! ```
//! use madrpc_common::flow_config::{FlowConfigSnapshot, FlowControlConfig};
//!
//! let snapshot = FlowConfigSnapshot::new();
//! let mut next = snapshot.clone();
//! next.update("s1", Some(FlowControlConfig::default().with_retry(true)));
//!
//! assert!(!snapshot.get_flow_control_config("s1").retry_enabled);
//! assert!(next.get_flow_control_config("s1").retry_enabled);
//! ```

use crate::protocol::error::{MadrpcError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reserved strategy name addressing the fallback config.
pub const DEFAULT_FLOW_CONFIG_STRATEGY: &str = "default";

/// Flow-control policy for one strategy.
///
/// # Fields
///
/// * `early_termination_enabled` - Allow ending a call before every provider answered
/// * `et_trigger_percent` - Share of providers (per business) that must have answered first
/// * `et_wait_time_factor` - Wait this multiple of the slowest answer before terminating
/// * `et_min_wait_time_ms` - Lower bound on that wait
/// * `retry_enabled` - Allow retrying straggling providers
/// * `single_retry_enabled` - Allow retrying a business that has only one provider
/// * `retry_trigger_percent` - Share of providers that must have answered before retrying
/// * `retry_wait_time_factor` - Wait this multiple of the slowest answer before retrying
/// * `single_retry_wait_percent` - Share of the call timeout to wait before a single retry
/// * `retry_count_limit` - Retries admitted per second for this strategy (negative = unlimited)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlConfig {
    pub early_termination_enabled: bool,
    pub et_trigger_percent: u32,
    pub et_wait_time_factor: f64,
    pub et_min_wait_time_ms: u64,
    pub retry_enabled: bool,
    pub single_retry_enabled: bool,
    pub retry_trigger_percent: u32,
    pub retry_wait_time_factor: f64,
    pub single_retry_wait_percent: u32,
    pub retry_count_limit: i64,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            early_termination_enabled: false,
            et_trigger_percent: 80,
            et_wait_time_factor: 1.0,
            et_min_wait_time_ms: 1,
            retry_enabled: false,
            single_retry_enabled: false,
            retry_trigger_percent: 50,
            retry_wait_time_factor: 1.0,
            single_retry_wait_percent: 50,
            retry_count_limit: -1,
        }
    }
}

impl FlowControlConfig {
    pub fn with_early_termination(mut self, enabled: bool) -> Self {
        self.early_termination_enabled = enabled;
        self
    }

    pub fn with_retry(mut self, enabled: bool) -> Self {
        self.retry_enabled = enabled;
        self
    }

    pub fn with_single_retry(mut self, enabled: bool) -> Self {
        self.single_retry_enabled = enabled;
        self
    }

    pub fn with_retry_count_limit(mut self, limit: i64) -> Self {
        self.retry_count_limit = limit;
        self
    }

    /// Parses a config from JSON and validates it.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// - `MadrpcError::JsonSerialization` when the text is not valid JSON for this type
    /// - `MadrpcError::InvalidFlowConfig` when a value is out of range
    pub fn from_json(strategy: &str, json: &str) -> Result<Self> {
        let config: FlowControlConfig = serde_json::from_str(json)?;
        config.validate(strategy)?;
        Ok(config)
    }

    /// Checks that every value is within range.
    pub fn validate(&self, strategy: &str) -> Result<()> {
        let percents = [
            ("et_trigger_percent", self.et_trigger_percent),
            ("retry_trigger_percent", self.retry_trigger_percent),
            ("single_retry_wait_percent", self.single_retry_wait_percent),
        ];
        for (name, value) in percents {
            if value > 100 {
                return Err(MadrpcError::invalid_flow_config(
                    strategy,
                    format!("{} must be <= 100, got {}", name, value),
                ));
            }
        }

        let factors = [
            ("et_wait_time_factor", self.et_wait_time_factor),
            ("retry_wait_time_factor", self.retry_wait_time_factor),
        ];
        for (name, value) in factors {
            if !value.is_finite() || value < 0.0 {
                return Err(MadrpcError::invalid_flow_config(
                    strategy,
                    format!("{} must be a non-negative number, got {}", name, value),
                ));
            }
        }

        Ok(())
    }
}

/// Aggregated on/off flags for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowControlSwitch {
    pub early_termination: bool,
    pub retry: bool,
    pub single_retry: bool,
}

/// Immutable mapping from strategy name to [`FlowControlConfig`].
///
/// Unknown strategies resolve to the default config, so lookups never fail.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowConfigSnapshot {
    configs: HashMap<String, FlowControlConfig>,
    default_config: FlowControlConfig,
}

impl FlowConfigSnapshot {
    /// Creates an empty snapshot using the default config as fallback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty snapshot with a custom fallback config.
    pub fn with_default(default_config: FlowControlConfig) -> Self {
        Self {
            configs: HashMap::new(),
            default_config,
        }
    }

    /// Returns the config for `strategy`, falling back to the default.
    pub fn get_flow_control_config(&self, strategy: &str) -> &FlowControlConfig {
        self.configs.get(strategy).unwrap_or(&self.default_config)
    }

    /// The fallback config.
    pub fn default_config(&self) -> &FlowControlConfig {
        &self.default_config
    }

    /// ORs each flag across every resolved strategy.
    ///
    /// A flag is on for the call as soon as one strategy turns it on.
    pub fn get_flow_control_switch<'a, I>(&self, strategies: I) -> FlowControlSwitch
    where
        I: IntoIterator<Item = &'a str>,
    {
        strategies
            .into_iter()
            .map(|strategy| self.get_flow_control_config(strategy))
            .fold(FlowControlSwitch::default(), |acc, config| FlowControlSwitch {
                early_termination: acc.early_termination || config.early_termination_enabled,
                retry: acc.retry || config.retry_enabled,
                single_retry: acc.single_retry || config.single_retry_enabled,
            })
    }

    /// Sets or removes the override for `strategy`.
    ///
    /// `None` removes the override so the strategy falls back to the default.
    /// The reserved name [`DEFAULT_FLOW_CONFIG_STRATEGY`] replaces the fallback
    /// itself; passing `None` for it restores the built-in default.
    pub fn update(&mut self, strategy: &str, config: Option<FlowControlConfig>) {
        if strategy == DEFAULT_FLOW_CONFIG_STRATEGY {
            self.default_config = config.unwrap_or_default();
            return;
        }
        match config {
            Some(config) => {
                self.configs.insert(strategy.to_string(), config);
            }
            None => {
                self.configs.remove(strategy);
            }
        }
    }

    /// Replaces the fallback config.
    pub fn update_default(&mut self, config: FlowControlConfig) {
        self.default_config = config;
    }

    /// Whether `strategy` has its own override.
    pub fn contains(&self, strategy: &str) -> bool {
        self.configs.contains_key(strategy)
    }

    /// Number of strategy overrides (the default is not counted).
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Copies out every override plus the fallback under the reserved name.
    pub fn to_map(&self) -> HashMap<String, FlowControlConfig> {
        let mut map = self.configs.clone();
        map.insert(
            DEFAULT_FLOW_CONFIG_STRATEGY.to_string(),
            self.default_config.clone(),
        );
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_on() -> FlowControlConfig {
        FlowControlConfig::default().with_retry(true)
    }

    #[test]
    fn test_flow_control_config_default() {
        let config = FlowControlConfig::default();
        assert!(!config.early_termination_enabled);
        assert!(!config.retry_enabled);
        assert!(!config.single_retry_enabled);
        assert_eq!(config.retry_count_limit, -1);
        assert!(config.validate("s").is_ok());
    }

    #[test]
    fn test_unknown_strategy_falls_back_to_default() {
        let snapshot = FlowConfigSnapshot::with_default(retry_on());
        assert!(snapshot.get_flow_control_config("missing").retry_enabled);
    }

    #[test]
    fn test_update_and_remove_override() {
        let mut snapshot = FlowConfigSnapshot::new();
        snapshot.update("s1", Some(retry_on()));
        assert!(snapshot.contains("s1"));
        assert!(snapshot.get_flow_control_config("s1").retry_enabled);

        snapshot.update("s1", None);
        assert!(!snapshot.contains("s1"));
        assert!(!snapshot.get_flow_control_config("s1").retry_enabled);
    }

    #[test]
    fn test_update_reserved_default_name() {
        let mut snapshot = FlowConfigSnapshot::new();
        snapshot.update(DEFAULT_FLOW_CONFIG_STRATEGY, Some(retry_on()));
        assert!(snapshot.is_empty());
        assert!(snapshot.default_config().retry_enabled);
        assert!(snapshot.get_flow_control_config("anything").retry_enabled);

        snapshot.update(DEFAULT_FLOW_CONFIG_STRATEGY, None);
        assert_eq!(snapshot.default_config(), &FlowControlConfig::default());
    }

    #[test]
    fn test_clone_is_disconnected() {
        let mut original = FlowConfigSnapshot::new();
        original.update("s", Some(FlowControlConfig::default()));

        let mut copy = original.clone();
        copy.update("s", Some(retry_on().with_retry_count_limit(3)));
        copy.update_default(FlowControlConfig::default().with_early_termination(true));

        assert!(!original.get_flow_control_config("s").retry_enabled);
        assert_eq!(original.get_flow_control_config("s").retry_count_limit, -1);
        assert!(!original.default_config().early_termination_enabled);
        assert!(copy.get_flow_control_config("s").retry_enabled);
    }

    #[test]
    fn test_switch_is_or_across_strategies() {
        let mut snapshot = FlowConfigSnapshot::new();
        snapshot.update("s1", Some(retry_on()));
        snapshot.update(
            "s2",
            Some(FlowControlConfig::default().with_early_termination(true)),
        );

        let switch = snapshot.get_flow_control_switch(["s1", "s2"]);
        assert!(switch.retry);
        assert!(switch.early_termination);
        assert!(!switch.single_retry);

        let only_s1 = snapshot.get_flow_control_switch(["s1"]);
        assert!(only_s1.retry);
        assert!(!only_s1.early_termination);
    }

    #[test]
    fn test_switch_all_false_when_everything_defaults() {
        let snapshot = FlowConfigSnapshot::new();
        let switch = snapshot.get_flow_control_switch(["s1", "s2"]);
        assert_eq!(switch, FlowControlSwitch::default());

        let empty: [&str; 0] = [];
        assert_eq!(snapshot.get_flow_control_switch(empty), FlowControlSwitch::default());
    }

    #[test]
    fn test_to_map_includes_default() {
        let mut snapshot = FlowConfigSnapshot::new();
        snapshot.update("s1", Some(retry_on()));
        let map = snapshot.to_map();
        assert_eq!(map.len(), 2);
        assert!(map.contains_key(DEFAULT_FLOW_CONFIG_STRATEGY));
        assert!(map["s1"].retry_enabled);
    }

    #[test]
    fn test_from_json_partial_fields() {
        let config =
            FlowControlConfig::from_json("s1", r#"{"retry_enabled": true, "retry_count_limit": 3}"#)
                .unwrap();
        assert!(config.retry_enabled);
        assert_eq!(config.retry_count_limit, 3);
        assert_eq!(config.et_trigger_percent, 80);
    }

    #[test]
    fn test_from_json_rejects_malformed() {
        let err = FlowControlConfig::from_json("s1", "{retry_enabled: yes").unwrap_err();
        assert!(matches!(err, MadrpcError::JsonSerialization(_)));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let err = FlowControlConfig::from_json("s1", r#"{"et_trigger_percent": 150}"#).unwrap_err();
        assert!(matches!(err, MadrpcError::InvalidFlowConfig { .. }));

        let config = FlowControlConfig {
            retry_wait_time_factor: -0.5,
            ..Default::default()
        };
        assert!(config.validate("s1").is_err());

        let config = FlowControlConfig {
            et_wait_time_factor: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate("s1").is_err());
    }
}
