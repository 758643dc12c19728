//! Search service facade.
//!
//! [`SearchService`] owns everything that lives for the whole process: the
//! published flow config, the retry limiter, the latency tracker, the
//! topology holder and the delegation thread. Every `search` builds a fresh
//! [`ChildNodeCaller`] from the snapshots current at that moment.
//!
//! # Flow config updates
//!
//! Updates clone the current snapshot, apply the change and publish the new
//! pointer. Publication is serialized by a dedicated update lock so two
//! concurrent updates never lose each other's change; readers only hold the
//! pointer lock long enough to clone the `Arc`.

use crate::caller::{AfterCall, CallerContext, ChildNodeCaller};
use crate::delegation::{CallDelegationThread, DelegationConfig};
use crate::reply::Reply;
use crate::resource::ResourceComposer;
use crate::topology::{TopologyHolder, TopologySnapshot};
use crate::transport::{CallStream, Transport};
use madrpc_common::flow_config::{FlowConfigSnapshot, FlowControlConfig, DEFAULT_FLOW_CONFIG_STRATEGY};
use madrpc_common::latency::LatencyTimeSnapshot;
use madrpc_common::protocol::error::Result;
use madrpc_common::protocol::{CallSession, Generator};
use madrpc_common::rate_limit::RetryLimitChecker;
use madrpc_metrics::{DispatchMetricsCollector, MetricsCollector, MetricsSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Search service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchServiceConfig {
    pub delegation: DelegationConfig,
    /// Call timeout used when a search does not set one
    pub default_call_timeout_ms: u64,
    pub default_flow_config: FlowControlConfig,
    /// Per-strategy flow config overrides
    pub flow_configs: HashMap<String, FlowControlConfig>,
    /// Per-business latency window sizes
    pub latency_windows: HashMap<String, u64>,
}

impl Default for SearchServiceConfig {
    fn default() -> Self {
        Self {
            delegation: DelegationConfig::default(),
            default_call_timeout_ms: 1_000,
            default_flow_config: FlowControlConfig::default(),
            flow_configs: HashMap::new(),
            latency_windows: HashMap::new(),
        }
    }
}

impl SearchServiceConfig {
    /// Parses a config from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_delegation(mut self, delegation: DelegationConfig) -> Self {
        self.delegation = delegation;
        self
    }

    pub fn with_default_call_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_call_timeout_ms = timeout_ms;
        self
    }

    pub fn with_default_flow_config(mut self, config: FlowControlConfig) -> Self {
        self.default_flow_config = config;
        self
    }

    pub fn with_flow_config(mut self, strategy: impl Into<String>, config: FlowControlConfig) -> Self {
        self.flow_configs.insert(strategy.into(), config);
        self
    }

    pub fn with_latency_window(mut self, biz_name: impl Into<String>, window_size: u64) -> Self {
        self.latency_windows.insert(biz_name.into(), window_size);
        self
    }

    fn build_flow_snapshot(&self) -> Result<FlowConfigSnapshot> {
        self.default_flow_config.validate(DEFAULT_FLOW_CONFIG_STRATEGY)?;
        let mut snapshot = FlowConfigSnapshot::with_default(self.default_flow_config.clone());
        for (strategy, config) in &self.flow_configs {
            config.validate(strategy)?;
            snapshot.update(strategy, Some(config.clone()));
        }
        Ok(snapshot)
    }
}

/// Parameters of one search.
pub struct SearchParam {
    /// `None` entries are skipped
    pub generators: Vec<Option<Generator>>,
    pub timeout: Option<Duration>,
    pub after_call: Option<AfterCall>,
}

impl SearchParam {
    pub fn new(generators: Vec<Generator>) -> Self {
        Self::with_nullable(generators.into_iter().map(Some).collect())
    }

    pub fn with_nullable(generators: Vec<Option<Generator>>) -> Self {
        Self {
            generators,
            timeout: None,
            after_call: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Blocks `search` until the reply finishes or times out.
    pub fn wait(mut self) -> Self {
        self.after_call = Some(AfterCall::Wait);
        self
    }

    pub fn with_callback(mut self, callback: impl FnOnce(&Reply) + Send + 'static) -> Self {
        self.after_call = Some(AfterCall::callback(callback));
        self
    }
}

/// Parameters of a streaming bind.
pub struct BindParam {
    pub generators: Vec<Option<Generator>>,
    pub stream: Arc<dyn CallStream>,
}

impl BindParam {
    pub fn new(generators: Vec<Generator>, stream: Arc<dyn CallStream>) -> Self {
        Self {
            generators: generators.into_iter().map(Some).collect(),
            stream,
        }
    }
}

/// Process-lifetime dispatch facade.
pub struct SearchService {
    config: SearchServiceConfig,
    flow_config: Mutex<Arc<FlowConfigSnapshot>>,
    flow_update_lock: Mutex<()>,
    retry_checker: Arc<RetryLimitChecker>,
    latency: Arc<LatencyTimeSnapshot>,
    topology: Arc<TopologyHolder>,
    delegation: Arc<CallDelegationThread>,
    composer: Arc<dyn ResourceComposer>,
    transport: Arc<dyn Transport>,
    metrics: Arc<dyn MetricsCollector>,
}

impl SearchService {
    /// Builds the service and starts its delegation thread.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured flow config is out of range or the
    /// delegation thread cannot be started.
    pub fn init(
        config: SearchServiceConfig,
        composer: Arc<dyn ResourceComposer>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Self::init_with_metrics(
            config,
            composer,
            transport,
            Arc::new(DispatchMetricsCollector::new()),
        )
    }

    pub fn init_with_metrics(
        config: SearchServiceConfig,
        composer: Arc<dyn ResourceComposer>,
        transport: Arc<dyn Transport>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Result<Self> {
        let flow_snapshot = config.build_flow_snapshot()?;

        let latency = Arc::new(LatencyTimeSnapshot::new());
        for (biz_name, window_size) in &config.latency_windows {
            latency.update_latency_time_window(biz_name, *window_size);
        }

        let topology = Arc::new(TopologyHolder::new());
        let delegation = Arc::new(CallDelegationThread::new(
            config.delegation.clone(),
            topology.clone(),
            metrics.clone(),
        ));
        delegation.start()?;

        info!(
            "Search service initialized ({} flow configs, {} latency windows)",
            flow_snapshot.len(),
            config.latency_windows.len()
        );

        Ok(Self {
            config,
            flow_config: Mutex::new(Arc::new(flow_snapshot)),
            flow_update_lock: Mutex::new(()),
            retry_checker: Arc::new(RetryLimitChecker::new()),
            latency,
            topology,
            delegation,
            composer,
            transport,
            metrics,
        })
    }

    /// Dispatches one logical request and returns its reply.
    pub fn search(&self, param: SearchParam, session: &CallSession) -> Arc<Reply> {
        let timeout = param
            .timeout
            .unwrap_or_else(|| Duration::from_millis(self.config.default_call_timeout_ms));
        let mut caller =
            ChildNodeCaller::new(self.caller_context(), param.generators, session.clone(), timeout);
        let reply = caller.call();
        if let Some(after_call) = param.after_call {
            caller.after_call(after_call);
        }
        reply
    }

    /// Binds a request's resources to a streaming call.
    pub fn bind(&self, param: BindParam, session: &CallSession) -> bool {
        let timeout = Duration::from_millis(self.config.default_call_timeout_ms);
        let mut caller =
            ChildNodeCaller::new(self.caller_context(), param.generators, session.clone(), timeout);
        caller.bind(&param.stream)
    }

    fn caller_context(&self) -> CallerContext {
        CallerContext {
            flow_config: self.get_flow_config_snapshot(),
            retry_checker: self.retry_checker.clone(),
            latency: self.latency.clone(),
            delegation: self.delegation.clone(),
            composer: self.composer.clone(),
            transport: self.transport.clone(),
            metrics: self.metrics.clone(),
            topology: self.topology.current(),
        }
    }

    /// Sets (`Some`) or removes (`None`) the override for `strategy`.
    ///
    /// The reserved name `"default"` replaces the fallback config.
    ///
    /// # Errors
    ///
    /// Returns `MadrpcError::InvalidFlowConfig` for out-of-range values; the
    /// published snapshot is left unchanged.
    pub fn update_flow_config(&self, strategy: &str, config: Option<FlowControlConfig>) -> Result<()> {
        if let Some(config) = &config {
            if let Err(e) = config.validate(strategy) {
                warn!("Rejected flow config update: {}", e);
                return Err(e);
            }
        }

        let removed = config.is_none();
        self.publish_flow_config(|snapshot| snapshot.update(strategy, config));
        if removed {
            info!("Removed flow config override for strategy '{}'", strategy);
        } else {
            info!("Published flow config for strategy '{}'", strategy);
        }
        Ok(())
    }

    /// JSON form of [`update_flow_config`](Self::update_flow_config).
    pub fn update_flow_config_json(&self, strategy: &str, json: Option<&str>) -> Result<()> {
        let config = match json {
            Some(json) => match FlowControlConfig::from_json(strategy, json) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Rejected flow config update for '{}': {}", strategy, e);
                    return Err(e);
                }
            },
            None => None,
        };
        self.update_flow_config(strategy, config)
    }

    /// Replaces the fallback config used for unknown strategies.
    pub fn update_default_flow_config(&self, config: FlowControlConfig) -> Result<()> {
        if let Err(e) = config.validate(DEFAULT_FLOW_CONFIG_STRATEGY) {
            warn!("Rejected default flow config update: {}", e);
            return Err(e);
        }
        self.publish_flow_config(|snapshot| snapshot.update_default(config));
        info!("Published default flow config");
        Ok(())
    }

    fn publish_flow_config(&self, mutate: impl FnOnce(&mut FlowConfigSnapshot)) {
        let _guard = self.flow_update_lock.lock().unwrap();
        let mut next = (*self.get_flow_config_snapshot()).clone();
        mutate(&mut next);
        *self.flow_config.lock().unwrap() = Arc::new(next);
    }

    /// The currently published flow config snapshot.
    pub fn get_flow_config_snapshot(&self) -> Arc<FlowConfigSnapshot> {
        self.flow_config.lock().unwrap().clone()
    }

    /// Strategy to config map of the current snapshot, including `"default"`.
    pub fn get_flow_config_map(&self) -> HashMap<String, FlowControlConfig> {
        self.get_flow_config_snapshot().to_map()
    }

    pub fn get_avg_latency(&self, biz_name: &str) -> Option<u64> {
        self.latency.get_avg_latency(biz_name)
    }

    /// Creates, resizes or (with size 0) removes a business's latency window.
    pub fn update_latency_time_window(&self, biz_name: &str, window_size: u64) {
        self.latency.update_latency_time_window(biz_name, window_size);
        info!("Latency window for biz '{}' set to {}", biz_name, window_size);
    }

    /// Topology subscription callback.
    pub fn update_topology(&self, snapshot: Option<Arc<TopologySnapshot>>) {
        match &snapshot {
            Some(topology) => info!("Topology version {} published", topology.version()),
            None => warn!("Topology withdrawn, searches will fail until a new one arrives"),
        }
        self.topology.publish(snapshot);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn delegation(&self) -> &Arc<CallDelegationThread> {
        &self.delegation
    }

    pub fn retry_checker(&self) -> &Arc<RetryLimitChecker> {
        &self.retry_checker
    }

    pub fn config(&self) -> &SearchServiceConfig {
        &self.config
    }

    /// Drains and stops the delegation thread and withdraws the topology.
    pub fn stop(&self) {
        info!("Stopping search service");
        self.delegation.stop();
        self.topology.publish(None);
        info!(
            "Search service stopped ({} delegation drops)",
            self.delegation.dropped_count()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::ReplyStatus;
    use crate::resource::{CallResource, FanOutComposer};
    use crate::topology::Provider;
    use madrpc_common::protocol::ProviderResult;
    use serde_json::json;

    struct EchoTransport;

    impl Transport for EchoTransport {
        fn issue(&self, resource: &CallResource, reply: &Arc<Reply>) -> Result<()> {
            reply.on_result(
                resource.slot,
                ProviderResult::success(&resource.provider.id, 20, resource.payload.clone()),
            );
            Ok(())
        }
    }

    fn service(config: SearchServiceConfig) -> SearchService {
        let service =
            SearchService::init(config, Arc::new(FanOutComposer::new()), Arc::new(EchoTransport)).unwrap();
        service.update_topology(Some(Arc::new(
            TopologySnapshot::new(1).with_biz("a", vec![Provider::new("a0", "h:1")]),
        )));
        service
    }

    #[test]
    fn test_config_defaults_and_json() {
        let config = SearchServiceConfig::from_json(
            r#"{"default_call_timeout_ms": 250, "flow_configs": {"s": {"retry_enabled": true}}}"#,
        )
        .unwrap();
        assert_eq!(config.default_call_timeout_ms, 250);
        assert!(config.flow_configs["s"].retry_enabled);
        assert_eq!(config.delegation, DelegationConfig::default());
    }

    #[test]
    fn test_init_rejects_invalid_flow_config() {
        let bad = FlowControlConfig {
            et_trigger_percent: 150,
            ..FlowControlConfig::default()
        };
        let result = SearchService::init(
            SearchServiceConfig::default().with_flow_config("s", bad),
            Arc::new(FanOutComposer::new()),
            Arc::new(EchoTransport),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_search_and_latency() {
        let service = service(SearchServiceConfig::default().with_latency_window("a", 8));
        let reply = service.search(
            SearchParam::new(vec![Generator::new("a", json!({"q": 1}))]).wait(),
            &CallSession::new("test"),
        );
        assert_eq!(reply.status(), ReplyStatus::Completed);
        assert_eq!(reply.results()[0].result, Some(json!({"q": 1})));
        assert_eq!(service.get_avg_latency("a"), Some(20));
        assert_eq!(service.metrics().total_calls, 1);
        service.stop();
    }

    #[test]
    fn test_update_flow_config_publishes_new_snapshot() {
        let service = service(SearchServiceConfig::default());
        let before = service.get_flow_config_snapshot();

        service
            .update_flow_config("s", Some(FlowControlConfig::default().with_retry(true)))
            .unwrap();
        let after = service.get_flow_config_snapshot();

        assert!(!before.contains("s"));
        assert!(after.get_flow_control_config("s").retry_enabled);
        assert!(service.get_flow_config_map().contains_key("s"));

        service.update_flow_config("s", None).unwrap();
        assert!(!service.get_flow_config_snapshot().contains("s"));
        service.stop();
    }

    #[test]
    fn test_rejected_update_keeps_snapshot() {
        let service = service(SearchServiceConfig::default());
        let before = service.get_flow_config_snapshot();

        let err = service
            .update_flow_config_json("s", Some(r#"{"retry_trigger_percent": 101}"#))
            .unwrap_err();
        assert!(err.is_config_error());
        assert!(service.update_flow_config_json("s", Some("not json")).is_err());
        assert!(Arc::ptr_eq(&before, &service.get_flow_config_snapshot()));
        service.stop();
    }

    #[test]
    fn test_update_default_flow_config() {
        let service = service(SearchServiceConfig::default());
        service
            .update_default_flow_config(FlowControlConfig::default().with_early_termination(true))
            .unwrap();
        assert!(
            service
                .get_flow_config_snapshot()
                .get_flow_control_config("anything")
                .early_termination_enabled
        );
        service.stop();
    }

    #[test]
    fn test_stop_withdraws_topology() {
        let service = service(SearchServiceConfig::default());
        service.stop();
        assert!(!service.delegation().is_running());

        let reply = service.search(
            SearchParam::new(vec![Generator::new("a", json!({}))]),
            &CallSession::default(),
        );
        assert_eq!(reply.status(), ReplyStatus::Failed);
    }
}
