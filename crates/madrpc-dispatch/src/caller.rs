//! Per-request orchestration.
//!
//! A [`ChildNodeCaller`] dispatches one logical request: it expands the
//! request's generators into provider calls, issues them, and hands the call
//! to the delegation thread when early termination or retry may apply.
//! A caller is built fresh for every request and never reused.

use crate::delegation::{CallDelegationThread, CallDelegationWorkItem};
use crate::detection::InflightCall;
use crate::reply::{Reply, ReplyInfoCollector, ReplyStatus};
use crate::resource::{ComposedResources, ResourceComposer};
use crate::topology::TopologySnapshot;
use crate::transport::{CallStream, Transport};
use madrpc_common::flow_config::{FlowConfigSnapshot, FlowControlSwitch};
use madrpc_common::latency::LatencyTimeSnapshot;
use madrpc_common::protocol::error::{MadrpcError, Result};
use madrpc_common::protocol::{generate_source_id, CallSession, Generator, ProviderResult};
use madrpc_common::rate_limit::RetryLimitChecker;
use madrpc_metrics::MetricsCollector;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Shared state a caller borrows for the duration of one request.
///
/// `flow_config` and `topology` are the snapshots current when the request
/// started; later publications do not affect this call.
#[derive(Clone)]
pub struct CallerContext {
    pub flow_config: Arc<FlowConfigSnapshot>,
    pub retry_checker: Arc<RetryLimitChecker>,
    pub latency: Arc<LatencyTimeSnapshot>,
    pub delegation: Arc<CallDelegationThread>,
    pub composer: Arc<dyn ResourceComposer>,
    pub transport: Arc<dyn Transport>,
    pub metrics: Arc<dyn MetricsCollector>,
    pub topology: Option<Arc<TopologySnapshot>>,
}

/// What to do once the calls have been issued.
pub enum AfterCall {
    /// Block until the reply finishes or times out
    Wait,
    /// Run the closure when the reply finishes
    Callback(Box<dyn FnOnce(&Reply) + Send>),
}

impl AfterCall {
    pub fn callback(f: impl FnOnce(&Reply) + Send + 'static) -> Self {
        AfterCall::Callback(Box::new(f))
    }
}

impl std::fmt::Debug for AfterCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AfterCall::Wait => write!(f, "Wait"),
            AfterCall::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}

/// Orchestrates one logical request.
pub struct ChildNodeCaller {
    ctx: CallerContext,
    generators: Vec<Generator>,
    session: CallSession,
    reply: Arc<Reply>,
    switch: FlowControlSwitch,
    can_retry: bool,
    skipped_generators: usize,
}

impl ChildNodeCaller {
    /// Builds the caller and its reply.
    ///
    /// `None` entries in `generators` are skipped with a warning; the rest of
    /// the request goes ahead.
    pub fn new(
        ctx: CallerContext,
        generators: Vec<Option<Generator>>,
        session: CallSession,
        timeout: Duration,
    ) -> Self {
        let mut kept = Vec::with_capacity(generators.len());
        let mut info = ReplyInfoCollector::new();
        let mut skipped_generators = 0;

        for (index, generator) in generators.into_iter().enumerate() {
            match generator {
                Some(generator) => {
                    info.add(&generator, &session);
                    kept.push(generator);
                }
                None => {
                    let err = MadrpcError::InvalidGenerator(format!("null generator at index {}", index));
                    warn!("Skipping generator: {}", err);
                    skipped_generators += 1;
                }
            }
        }

        // Any generator permitting retry enables it for the call
        let can_retry = kept.iter().any(Generator::allows_retry);
        let switch = ctx
            .flow_config
            .get_flow_control_switch(kept.iter().map(|g| g.strategy.as_str()));
        let reply = Arc::new(Reply::new(
            info,
            ctx.flow_config.clone(),
            ctx.retry_checker.clone(),
            ctx.latency.clone(),
            timeout,
        ));

        Self {
            ctx,
            generators: kept,
            session,
            reply,
            switch,
            can_retry,
            skipped_generators,
        }
    }

    /// Issues every provider call of the request.
    ///
    /// Always returns the reply. Without a topology snapshot, or when no
    /// resource can be produced, the reply is failed before any call is made.
    pub fn call(&mut self) -> Arc<Reply> {
        self.ctx.metrics.record_request();

        let Some(topology) = self.ctx.topology.clone() else {
            warn!("No topology snapshot published, failing call without dispatch");
            self.fail(MadrpcError::TopologyUnavailable(
                "no topology snapshot published".to_string(),
            ));
            return self.reply.clone();
        };

        self.fill_source_id();
        let mut composed = match self.prepare_search_resource(&topology) {
            Ok(composed) => composed,
            Err(e) => {
                warn!("Failing call: {}", e);
                self.fail(e);
                return self.reply.clone();
            }
        };

        self.reply.set_expected_providers(&composed.expected_providers);
        for resource in composed.resources.iter_mut().filter(|r| r.is_normal()) {
            self.reply.register(resource);
        }
        self.reply.seal();

        for resource in &composed.resources {
            if let Err(e) = self.ctx.transport.issue(resource, &self.reply) {
                warn!(
                    "Failed to issue call to {} for biz '{}': {}",
                    resource.provider.id, resource.biz_name, e
                );
                if resource.is_normal() {
                    self.reply.on_result(
                        resource.slot,
                        ProviderResult::error(&resource.provider.id, 0, e.to_string()),
                    );
                }
            }
        }

        for (biz_name, expected) in &composed.expected_providers {
            self.ctx.metrics.record_call(biz_name, *expected as u64);
        }

        if self.is_detection_on() && !composed.resources.is_empty() {
            self.ctx.metrics.record_detection();
            let item = CallDelegationWorkItem::new(InflightCall::new(
                self.reply.clone(),
                self.ctx.transport.clone(),
                self.session.lb_context.clone(),
                self.switch,
                self.can_retry,
                self.ctx.metrics.clone(),
            ));
            if !self.ctx.delegation.push_work_item(item) {
                debug!("Detection skipped for call, delegation queue refused it");
            }
        }

        self.reply.clone()
    }

    /// Binds every resource of the request to `stream`.
    ///
    /// # Returns
    ///
    /// `true` if at least one resource was bound.
    pub fn bind(&mut self, stream: &Arc<dyn CallStream>) -> bool {
        let Some(topology) = self.ctx.topology.clone() else {
            warn!("No topology snapshot published, cannot bind stream {}", stream.stream_id());
            self.ctx.metrics.record_failure();
            return false;
        };

        self.fill_source_id();
        let composed = match self.prepare_search_resource(&topology) {
            Ok(composed) => composed,
            Err(e) => {
                warn!("Cannot bind stream {}: {}", stream.stream_id(), e);
                self.ctx.metrics.record_failure();
                return false;
            }
        };

        let mut bound = 0;
        for resource in &composed.resources {
            match self.ctx.transport.bind(resource, stream) {
                Ok(()) => bound += 1,
                Err(e) => warn!(
                    "Failed to bind {} to stream {}: {}",
                    resource.provider.id,
                    stream.stream_id(),
                    e
                ),
            }
        }
        bound > 0
    }

    /// Blocks on the reply or registers a completion callback.
    ///
    /// # Returns
    ///
    /// The reply status once `after_call` returns.
    pub fn after_call(&self, after: AfterCall) -> ReplyStatus {
        match after {
            AfterCall::Wait => self.reply.wait(),
            AfterCall::Callback(callback) => {
                self.reply.on_complete(callback);
                self.reply.status()
            }
        }
    }

    pub fn is_detection_on(&self) -> bool {
        self.switch.early_termination || self.is_retry_on()
    }

    pub fn is_retry_on(&self) -> bool {
        self.can_retry && (self.switch.retry || self.switch.single_retry)
    }

    pub fn switch(&self) -> FlowControlSwitch {
        self.switch
    }

    pub fn can_retry(&self) -> bool {
        self.can_retry
    }

    pub fn reply(&self) -> &Arc<Reply> {
        &self.reply
    }

    pub fn generators(&self) -> &[Generator] {
        &self.generators
    }

    pub fn skipped_generators(&self) -> usize {
        self.skipped_generators
    }

    fn fill_source_id(&mut self) {
        for generator in self.generators.iter_mut().filter(|g| g.source_id.is_none()) {
            generator.source_id = Some(generate_source_id());
        }
    }

    fn prepare_search_resource(&self, topology: &TopologySnapshot) -> Result<ComposedResources> {
        let composed = self
            .ctx
            .composer
            .compose(&self.generators, &self.session, topology);
        if composed.resources.is_empty() {
            return Err(MadrpcError::NoResource(format!(
                "{} generators produced no resource against topology version {}",
                self.generators.len(),
                topology.version()
            )));
        }
        Ok(composed)
    }

    fn fail(&self, error: MadrpcError) {
        self.ctx.metrics.record_failure();
        self.reply.fail(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::DelegationConfig;
    use crate::resource::{CallResource, FanOutComposer};
    use crate::topology::{Provider, TopologyHolder};
    use madrpc_common::FlowControlConfig;
    use madrpc_metrics::DispatchMetricsCollector;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InlineTransport {
        issued: Mutex<Vec<CallResource>>,
        answer: bool,
    }

    impl Transport for InlineTransport {
        fn issue(&self, resource: &CallResource, reply: &Arc<Reply>) -> Result<()> {
            self.issued.lock().unwrap().push(resource.clone());
            if self.answer {
                reply.on_result(
                    resource.slot,
                    ProviderResult::success(&resource.provider.id, 1, json!(resource.biz_name)),
                );
            }
            Ok(())
        }
    }

    struct Setup {
        transport: Arc<InlineTransport>,
        delegation: Arc<CallDelegationThread>,
        metrics: Arc<DispatchMetricsCollector>,
        flow: FlowConfigSnapshot,
        topology: Option<Arc<TopologySnapshot>>,
    }

    impl Setup {
        fn new(answer: bool) -> Self {
            let metrics = Arc::new(DispatchMetricsCollector::new());
            let topology = TopologySnapshot::new(1)
                .with_biz("a", vec![Provider::new("a0", "h:1"), Provider::new("a1", "h:2")])
                .with_biz("b", vec![Provider::new("b0", "h:3")]);
            Self {
                transport: Arc::new(InlineTransport {
                    answer,
                    ..Default::default()
                }),
                delegation: Arc::new(CallDelegationThread::new(
                    DelegationConfig::default(),
                    Arc::new(TopologyHolder::new()),
                    metrics.clone(),
                )),
                metrics,
                flow: FlowConfigSnapshot::new(),
                topology: Some(Arc::new(topology)),
            }
        }

        fn caller(&self, generators: Vec<Option<Generator>>) -> ChildNodeCaller {
            let ctx = CallerContext {
                flow_config: Arc::new(self.flow.clone()),
                retry_checker: Arc::new(RetryLimitChecker::new()),
                latency: Arc::new(LatencyTimeSnapshot::new()),
                delegation: self.delegation.clone(),
                composer: Arc::new(FanOutComposer::new()),
                transport: self.transport.clone(),
                metrics: self.metrics.clone(),
                topology: self.topology.clone(),
            };
            ChildNodeCaller::new(ctx, generators, CallSession::new("test"), Duration::from_millis(500))
        }
    }

    fn gen(biz: &str) -> Option<Generator> {
        Some(Generator::new(biz, json!({"q": biz})))
    }

    #[test]
    fn test_call_issues_every_resource() {
        let setup = Setup::new(true);
        let mut caller = setup.caller(vec![gen("a"), gen("b")]);
        let reply = caller.call();

        assert_eq!(setup.transport.issued.lock().unwrap().len(), 3);
        assert_eq!(reply.status(), ReplyStatus::Completed);
        assert_eq!(reply.results().len(), 3);
        assert!(caller.generators().iter().all(|g| g.source_id.is_some()));

        let snapshot = setup.metrics.snapshot();
        assert_eq!(snapshot.total_calls, 1);
        assert_eq!(snapshot.bizs["a"].expected_providers, 2);
        assert_eq!(reply.info().get("a").unwrap().expected_providers, 2);
    }

    #[test]
    fn test_missing_topology_fails_fast() {
        let mut setup = Setup::new(true);
        setup.topology = None;
        let mut caller = setup.caller(vec![gen("a")]);
        let reply = caller.call();

        assert_eq!(reply.status(), ReplyStatus::Failed);
        assert!(reply.is_resource_error());
        assert!(setup.transport.issued.lock().unwrap().is_empty());
        assert_eq!(setup.metrics.snapshot().failed_calls, 1);
    }

    #[test]
    fn test_no_resource_fails_reply() {
        let setup = Setup::new(true);
        let reply = setup.caller(vec![gen("unknown")]).call();
        assert_eq!(reply.status(), ReplyStatus::Failed);
        assert!(reply.error_message().unwrap().contains("No call resource produced"));
    }

    #[test]
    fn test_null_generator_is_skipped() {
        let setup = Setup::new(true);
        let mut caller = setup.caller(vec![None, gen("b")]);
        assert_eq!(caller.skipped_generators(), 1);
        assert_eq!(caller.generators().len(), 1);

        let reply = caller.call();
        assert_eq!(reply.status(), ReplyStatus::Completed);
        assert_eq!(reply.results().len(), 1);
    }

    #[test]
    fn test_retry_on_when_any_generator_allows_it() {
        let mut setup = Setup::new(false);
        setup
            .flow
            .update("s1", Some(FlowControlConfig::default().with_retry(false)));
        setup
            .flow
            .update("s2", Some(FlowControlConfig::default().with_retry(true)));

        let caller = setup.caller(vec![
            Some(Generator::new("a", json!({})).with_strategy("s1").with_retry_disabled()),
            Some(Generator::new("b", json!({})).with_strategy("s2")),
        ]);
        assert!(caller.can_retry());
        assert!(caller.is_retry_on());
        assert!(caller.is_detection_on());
    }

    #[test]
    fn test_retry_off_when_every_generator_disables_it() {
        let mut setup = Setup::new(false);
        let enabled = FlowControlConfig::default()
            .with_retry(true)
            .with_single_retry(true);
        setup.flow.update("s1", Some(enabled.clone()));
        setup.flow.update("s2", Some(enabled));

        let caller = setup.caller(vec![
            Some(Generator::new("a", json!({})).with_strategy("s1").with_retry_disabled()),
            Some(Generator::new("b", json!({})).with_strategy("s2").with_retry_disabled()),
        ]);
        assert!(!caller.is_retry_on());
        assert!(!caller.is_detection_on());
    }

    #[test]
    fn test_detection_pushes_one_work_item() {
        let mut setup = Setup::new(false);
        setup.flow.update(
            "a",
            Some(FlowControlConfig::default().with_early_termination(true)),
        );
        let mut caller = setup.caller(vec![gen("a"), gen("b")]);
        assert!(caller.is_detection_on());

        caller.call();
        assert_eq!(setup.delegation.queue_depth(), 1);
        assert_eq!(setup.metrics.snapshot().detection_calls, 1);
    }

    #[test]
    fn test_detection_off_pushes_nothing() {
        let setup = Setup::new(false);
        setup.caller(vec![gen("a")]).call();
        assert_eq!(setup.delegation.queue_depth(), 0);
    }

    #[test]
    fn test_after_call_wait_times_out() {
        let setup = Setup::new(false);
        let mut caller = setup.caller(vec![gen("b")]);
        caller.call();
        let started = std::time::Instant::now();
        assert_eq!(caller.after_call(AfterCall::Wait), ReplyStatus::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn test_after_call_callback_runs_on_completion() {
        let setup = Setup::new(true);
        let mut caller = setup.caller(vec![gen("a")]);
        caller.call();

        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        let status = caller.after_call(AfterCall::callback(move |reply| {
            *slot.lock().unwrap() = Some(reply.results().len());
        }));
        assert_eq!(status, ReplyStatus::Completed);
        assert_eq!(*seen.lock().unwrap(), Some(2));
    }

    #[test]
    fn test_bind_unsupported_transport_returns_false() {
        struct Stream;
        impl CallStream for Stream {
            fn stream_id(&self) -> u64 {
                7
            }
        }

        let setup = Setup::new(false);
        let stream: Arc<dyn CallStream> = Arc::new(Stream);
        assert!(!setup.caller(vec![gen("a")]).bind(&stream));
    }
}
