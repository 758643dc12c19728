//! Reply aggregation.
//!
//! A [`Reply`] collects the answers of every normal resource of one logical
//! request. Each registered resource owns a slot; the first answer for a slot
//! wins, so a retry racing its original never double counts.
//!
//! # Completion
//!
//! A reply finishes exactly once, in one of these ways:
//!
//! - every slot answered (`Completed`)
//! - the detection policy terminated the remaining slots (`EarlyTerminated`)
//! - the deadline passed (`TimedOut`)
//! - no provider call could be produced (`Failed`)
//!
//! Callers can block on [`Reply::wait`], await [`Reply::completed`], or
//! register a callback with [`Reply::on_complete`].

use crate::resource::CallResource;
use madrpc_common::flow_config::FlowConfigSnapshot;
use madrpc_common::latency::LatencyTimeSnapshot;
use madrpc_common::protocol::error::MadrpcError;
use madrpc_common::protocol::{CallSession, Generator, ProviderResult};
use madrpc_common::rate_limit::RetryLimitChecker;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Lifecycle of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Running,
    Completed,
    EarlyTerminated,
    TimedOut,
    Failed,
}

impl ReplyStatus {
    pub fn is_finished(self) -> bool {
        self != ReplyStatus::Running
    }
}

/// State of one slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotState {
    Pending,
    Done(ProviderResult),
    Terminated,
}

/// Read-only copy of a slot, used by the detection policy.
#[derive(Debug, Clone)]
pub struct SlotView {
    pub slot: usize,
    pub resource: CallResource,
    pub state: SlotState,
    pub retried: bool,
    /// Providers this slot has been sent to so far
    pub tried_providers: Vec<String>,
}

impl SlotView {
    pub fn is_pending(&self) -> bool {
        matches!(self.state, SlotState::Pending)
    }

    /// Latency of the answer, if the slot is done.
    pub fn answered_latency_ms(&self) -> Option<u64> {
        match &self.state {
            SlotState::Done(result) => Some(result.latency_ms),
            _ => None,
        }
    }
}

/// Per-business metadata gathered when the call starts.
#[derive(Debug, Clone, PartialEq)]
pub struct BizReplyInfo {
    pub biz_name: String,
    pub strategy: String,
    pub src: String,
    pub ab_tag: String,
    pub stress_test: bool,
    pub expected_providers: usize,
}

/// Collects [`BizReplyInfo`] for every generator of a call.
#[derive(Debug, Clone, Default)]
pub struct ReplyInfoCollector {
    entries: Vec<BizReplyInfo>,
}

impl ReplyInfoCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, generator: &Generator, session: &CallSession) {
        self.entries.push(BizReplyInfo {
            biz_name: generator.biz_name.clone(),
            strategy: generator.strategy.clone(),
            src: session.src.clone(),
            ab_tag: session.ab_tag.clone(),
            stress_test: session.stress_test,
            expected_providers: 0,
        });
    }

    /// Records the composer's expected provider counts.
    pub fn set_expected_providers(&mut self, expected: &HashMap<String, usize>) {
        for entry in &mut self.entries {
            entry.expected_providers = expected.get(&entry.biz_name).copied().unwrap_or(0);
        }
    }

    pub fn entries(&self) -> &[BizReplyInfo] {
        &self.entries
    }

    pub fn get(&self, biz_name: &str) -> Option<&BizReplyInfo> {
        self.entries.iter().find(|e| e.biz_name == biz_name)
    }
}

type CompletionCallback = Box<dyn FnOnce(&Reply) + Send>;

struct Slot {
    resource: CallResource,
    state: SlotState,
    retried: bool,
    tried_providers: Vec<String>,
}

struct ReplyState {
    slots: Vec<Slot>,
    /// Set once every normal resource has been registered
    sealed: bool,
    status: ReplyStatus,
    error: Option<MadrpcError>,
    info: ReplyInfoCollector,
    callbacks: Vec<CompletionCallback>,
}

impl ReplyState {
    fn all_settled(&self) -> bool {
        self.sealed
            && self
                .slots
                .iter()
                .all(|s| !matches!(s.state, SlotState::Pending))
    }

    fn settled_status(&self) -> ReplyStatus {
        if self
            .slots
            .iter()
            .any(|s| matches!(s.state, SlotState::Terminated))
        {
            ReplyStatus::EarlyTerminated
        } else {
            ReplyStatus::Completed
        }
    }
}

/// Aggregated answer of one logical request.
pub struct Reply {
    state: Mutex<ReplyState>,
    finished: Condvar,
    status_tx: watch::Sender<ReplyStatus>,
    start: Instant,
    timeout: Duration,
    flow_config: Arc<FlowConfigSnapshot>,
    retry_checker: Arc<RetryLimitChecker>,
    latency: Arc<LatencyTimeSnapshot>,
}

impl Reply {
    pub fn new(
        info: ReplyInfoCollector,
        flow_config: Arc<FlowConfigSnapshot>,
        retry_checker: Arc<RetryLimitChecker>,
        latency: Arc<LatencyTimeSnapshot>,
        timeout: Duration,
    ) -> Self {
        let (status_tx, _) = watch::channel(ReplyStatus::Running);
        Self {
            state: Mutex::new(ReplyState {
                slots: Vec::new(),
                sealed: false,
                status: ReplyStatus::Running,
                error: None,
                info,
                callbacks: Vec::new(),
            }),
            finished: Condvar::new(),
            status_tx,
            start: Instant::now(),
            timeout,
            flow_config,
            retry_checker,
            latency,
        }
    }

    /// Registers a normal resource and assigns its slot.
    pub fn register(&self, resource: &mut CallResource) -> usize {
        let mut state = self.state.lock().unwrap();
        let slot = state.slots.len();
        resource.slot = slot;
        state.slots.push(Slot {
            resource: resource.clone(),
            state: SlotState::Pending,
            retried: false,
            tried_providers: vec![resource.provider.id.clone()],
        });
        slot
    }

    /// Marks registration as finished; completes at once if nothing is pending.
    pub fn seal(&self) {
        let mut state = self.state.lock().unwrap();
        state.sealed = true;
        if state.status == ReplyStatus::Running && state.all_settled() {
            let status = state.settled_status();
            self.finish(state, status);
        }
    }

    /// Records the composer's expected provider counts.
    pub fn set_expected_providers(&self, expected: &HashMap<String, usize>) {
        self.state
            .lock()
            .unwrap()
            .info
            .set_expected_providers(expected);
    }

    /// Delivers the answer for `slot`.
    ///
    /// # Returns
    ///
    /// `false` if the slot is unknown, already answered or terminated, or the
    /// reply has finished.
    pub fn on_result(&self, slot: usize, result: ProviderResult) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status.is_finished() {
            return false;
        }
        let biz_name = match state.slots.get_mut(slot) {
            Some(entry) if entry.state == SlotState::Pending => {
                let biz_name = entry.resource.biz_name.clone();
                entry.state = SlotState::Done(result.clone());
                biz_name
            }
            _ => return false,
        };

        if state.all_settled() {
            let status = state.settled_status();
            self.finish(state, status);
        } else {
            drop(state);
        }

        self.latency.push(&biz_name, result.latency_ms);
        true
    }

    /// Terminates every pending slot of `biz_name` under `strategy`.
    ///
    /// # Returns
    ///
    /// The number of slots terminated.
    pub fn terminate_pending(&self, biz_name: &str, strategy: &str) -> usize {
        let mut state = self.state.lock().unwrap();
        if state.status.is_finished() {
            return 0;
        }
        let mut terminated = 0;
        for slot in state.slots.iter_mut() {
            if slot.state == SlotState::Pending
                && slot.resource.biz_name == biz_name
                && slot.resource.strategy == strategy
            {
                slot.state = SlotState::Terminated;
                terminated += 1;
            }
        }

        if terminated > 0 && state.all_settled() {
            let status = state.settled_status();
            self.finish(state, status);
        }
        terminated
    }

    /// Marks `slot` as retried toward `provider_id`.
    ///
    /// # Returns
    ///
    /// `false` if the slot is no longer pending or was already retried.
    pub fn mark_retried(&self, slot: usize, provider_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status.is_finished() {
            return false;
        }
        match state.slots.get_mut(slot) {
            Some(entry) if entry.state == SlotState::Pending && !entry.retried => {
                entry.retried = true;
                entry.tried_providers.push(provider_id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Fails the reply. No effect if it already finished.
    pub fn fail(&self, error: MadrpcError) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status.is_finished() {
            return false;
        }
        state.error = Some(error);
        self.finish(state, ReplyStatus::Failed);
        true
    }

    /// Times the reply out. No effect if it already finished.
    pub fn expire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status.is_finished() {
            return false;
        }
        state.error = Some(MadrpcError::Timeout(self.timeout.as_millis() as u64));
        self.finish(state, ReplyStatus::TimedOut);
        true
    }

    fn finish(&self, mut state: std::sync::MutexGuard<'_, ReplyState>, status: ReplyStatus) {
        state.status = status;
        let callbacks = std::mem::take(&mut state.callbacks);
        drop(state);

        self.finished.notify_all();
        self.status_tx.send_replace(status);
        for callback in callbacks {
            callback(self);
        }
    }

    /// Blocks until the reply finishes or its deadline passes.
    pub fn wait(&self) -> ReplyStatus {
        let deadline = self.deadline();
        let mut state = self.state.lock().unwrap();
        while !state.status.is_finished() {
            let now = Instant::now();
            if now >= deadline {
                drop(state);
                self.expire();
                return self.status();
            }
            let (guard, _) = self.finished.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
        state.status
    }

    /// Resolves once the reply finishes, without applying the deadline.
    pub async fn completed(&self) -> ReplyStatus {
        let mut rx = self.status_tx.subscribe();
        let status = match rx.wait_for(|status| status.is_finished()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }

    /// Awaits completion, expiring the reply at its deadline.
    pub async fn wait_async(&self) -> ReplyStatus {
        let remaining = self.deadline().saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, self.completed()).await {
            Ok(status) => status,
            Err(_) => {
                self.expire();
                self.status()
            }
        }
    }

    /// Runs `callback` once the reply finishes (immediately if it already has).
    pub fn on_complete(&self, callback: impl FnOnce(&Reply) + Send + 'static) {
        let mut state = self.state.lock().unwrap();
        if state.status.is_finished() {
            drop(state);
            callback(self);
            return;
        }
        state.callbacks.push(Box::new(callback));
    }

    pub fn status(&self) -> ReplyStatus {
        self.state.lock().unwrap().status
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    /// Message of the error that failed or expired the reply.
    pub fn error_message(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .error
            .as_ref()
            .map(ToString::to_string)
    }

    /// Whether the failure was a resource error (no provider call produced).
    pub fn is_resource_error(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .error
            .as_ref()
            .is_some_and(MadrpcError::is_resource_error)
    }

    /// Answers received so far, in slot order.
    pub fn results(&self) -> Vec<ProviderResult> {
        self.state
            .lock()
            .unwrap()
            .slots
            .iter()
            .filter_map(|slot| match &slot.state {
                SlotState::Done(result) => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn slot_views(&self) -> Vec<SlotView> {
        self.state
            .lock()
            .unwrap()
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotView {
                slot: index,
                resource: slot.resource.clone(),
                state: slot.state.clone(),
                retried: slot.retried,
                tried_providers: slot.tried_providers.clone(),
            })
            .collect()
    }

    pub fn slot_count(&self) -> usize {
        self.state.lock().unwrap().slots.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .slots
            .iter()
            .filter(|s| s.state == SlotState::Pending)
            .count()
    }

    pub fn info(&self) -> ReplyInfoCollector {
        self.state.lock().unwrap().info.clone()
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.start + self.timeout
    }

    /// Flow config captured when the call started.
    pub fn flow_config(&self) -> &Arc<FlowConfigSnapshot> {
        &self.flow_config
    }

    pub fn retry_checker(&self) -> &Arc<RetryLimitChecker> {
        &self.retry_checker
    }

    pub fn latency(&self) -> &Arc<LatencyTimeSnapshot> {
        &self.latency
    }
}
