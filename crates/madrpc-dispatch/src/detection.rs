//! Post-dispatch detection: early termination and retry of in-flight calls.
//!
//! The delegation thread calls [`InflightCall::detect`] once per tick for
//! every call that opted into detection. Each evaluation looks at the reply's
//! slots grouped by business and strategy and decides, from the strategy's
//! [`FlowControlConfig`](madrpc_common::FlowControlConfig), whether the
//! stragglers should be cut off or retried.

use crate::reply::{Reply, SlotView};
use crate::topology::{Provider, TopologySnapshot};
use crate::transport::Transport;
use madrpc_common::flow_config::{FlowControlConfig, FlowControlSwitch};
use madrpc_common::protocol::LbContext;
use madrpc_common::rate_limit::current_unix_seconds;
use madrpc_metrics::MetricsCollector;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Clock reading shared by every evaluation of one tick.
#[derive(Debug, Clone, Copy)]
pub struct TickTime {
    pub instant: Instant,
    pub unix_secs: i64,
}

impl TickTime {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            unix_secs: current_unix_seconds(),
        }
    }
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectStatus {
    /// Nothing left to watch; the work item can be released
    Completed,
    StillPending,
}

/// A dispatched call watched by the delegation thread.
pub struct InflightCall {
    reply: Arc<Reply>,
    transport: Arc<dyn Transport>,
    lb_context: LbContext,
    switch: FlowControlSwitch,
    can_retry: bool,
    metrics: Arc<dyn MetricsCollector>,
}

impl InflightCall {
    pub fn new(
        reply: Arc<Reply>,
        transport: Arc<dyn Transport>,
        lb_context: LbContext,
        switch: FlowControlSwitch,
        can_retry: bool,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self {
            reply,
            transport,
            lb_context,
            switch,
            can_retry,
            metrics,
        }
    }

    pub fn reply(&self) -> &Arc<Reply> {
        &self.reply
    }

    /// Re-evaluates the call at `now`.
    pub fn detect(&self, now: &TickTime, topology: Option<&TopologySnapshot>) -> DetectStatus {
        if self.reply.is_finished() {
            return DetectStatus::Completed;
        }

        if now.instant >= self.reply.deadline() {
            if self.reply.expire() {
                debug!(
                    "Call expired after {}ms with {} pending slots",
                    self.reply.timeout().as_millis(),
                    self.reply.pending_count()
                );
            }
            return DetectStatus::Completed;
        }

        let elapsed_ms = now
            .instant
            .saturating_duration_since(self.reply.start())
            .as_millis() as u64;

        let views = self.reply.slot_views();
        let mut groups: BTreeMap<(&str, &str), Vec<&SlotView>> = BTreeMap::new();
        for view in &views {
            groups
                .entry((view.resource.biz_name.as_str(), view.resource.strategy.as_str()))
                .or_default()
                .push(view);
        }

        let flow_config = self.reply.flow_config().clone();
        for ((biz_name, strategy), slots) in groups {
            let config = flow_config.get_flow_control_config(strategy);
            let stats = GroupStats::of(&slots);
            if stats.pending == 0 {
                continue;
            }

            if self.should_terminate(config, &stats, elapsed_ms) {
                let terminated = self.reply.terminate_pending(biz_name, strategy);
                if terminated > 0 {
                    debug!(
                        "Early terminated {} slots of biz '{}' after {}ms",
                        terminated, biz_name, elapsed_ms
                    );
                    self.metrics.record_early_termination(biz_name);
                }
                continue;
            }

            if self.should_retry(config, &stats, elapsed_ms) {
                self.retry_pending(biz_name, strategy, config, &slots, now, topology);
            }
        }

        if self.reply.is_finished() {
            DetectStatus::Completed
        } else {
            DetectStatus::StillPending
        }
    }

    fn should_terminate(&self, config: &FlowControlConfig, stats: &GroupStats, elapsed_ms: u64) -> bool {
        if !self.switch.early_termination || !config.early_termination_enabled || stats.responded == 0 {
            return false;
        }
        let wait_ms = config
            .et_min_wait_time_ms
            .max(scaled_ms(stats.slowest_ms, config.et_wait_time_factor));
        stats.responded * 100 >= stats.total * config.et_trigger_percent as u64 && elapsed_ms >= wait_ms
    }

    fn should_retry(&self, config: &FlowControlConfig, stats: &GroupStats, elapsed_ms: u64) -> bool {
        if !self.can_retry {
            return false;
        }

        if stats.total == 1 {
            if !self.switch.single_retry || !config.single_retry_enabled {
                return false;
            }
            let timeout_ms = self.reply.timeout().as_millis() as u64;
            return elapsed_ms >= timeout_ms * config.single_retry_wait_percent as u64 / 100;
        }

        if !self.switch.retry || !config.retry_enabled || stats.responded == 0 {
            return false;
        }
        stats.responded * 100 >= stats.total * config.retry_trigger_percent as u64
            && elapsed_ms >= scaled_ms(stats.slowest_ms, config.retry_wait_time_factor)
    }

    fn retry_pending(
        &self,
        biz_name: &str,
        strategy: &str,
        config: &FlowControlConfig,
        slots: &[&SlotView],
        now: &TickTime,
        topology: Option<&TopologySnapshot>,
    ) {
        let checker = self.reply.retry_checker();
        for view in slots.iter().filter(|v| v.is_pending() && !v.retried) {
            if !checker.can_retry(strategy, now.unix_secs, config.retry_count_limit) {
                debug!("Retry budget of strategy '{}' exhausted", strategy);
                return;
            }

            let provider = self.pick_retry_provider(view, topology);
            if !self.reply.mark_retried(view.slot, &provider.id) {
                continue;
            }

            let resource = view.resource.retry_to(provider);
            debug!(
                "Retrying slot {} of biz '{}' on provider {}",
                view.slot, biz_name, resource.provider.id
            );
            self.metrics.record_retry(biz_name);
            if let Err(e) = self.transport.issue(&resource, &self.reply) {
                warn!(
                    "Failed to issue retry for biz '{}' to {}: {}",
                    biz_name, resource.provider.id, e
                );
            }
        }
    }

    /// Picks a provider of the same business that this slot has not tried and
    /// the session did not exclude; falls back to the original provider.
    fn pick_retry_provider(&self, view: &SlotView, topology: Option<&TopologySnapshot>) -> Provider {
        let providers = topology
            .map(|t| t.providers(&view.resource.biz_name))
            .unwrap_or(&[]);
        let candidates: Vec<&Provider> = providers
            .iter()
            .filter(|p| !view.tried_providers.contains(&p.id) && !self.lb_context.is_excluded(&p.id))
            .collect();

        if candidates.is_empty() {
            return view.resource.provider.clone();
        }
        let index = (view.resource.source_id % candidates.len() as u64) as usize;
        candidates[index].clone()
    }
}

struct GroupStats {
    total: u64,
    responded: u64,
    pending: u64,
    slowest_ms: u64,
}

impl GroupStats {
    fn of(slots: &[&SlotView]) -> Self {
        let mut stats = GroupStats {
            total: slots.len() as u64,
            responded: 0,
            pending: 0,
            slowest_ms: 0,
        };
        for slot in slots {
            if let Some(latency) = slot.answered_latency_ms() {
                stats.responded += 1;
                stats.slowest_ms = stats.slowest_ms.max(latency);
            } else if slot.is_pending() {
                stats.pending += 1;
            }
        }
        stats
    }
}

fn scaled_ms(ms: u64, factor: f64) -> u64 {
    (ms as f64 * factor).ceil() as u64
}
