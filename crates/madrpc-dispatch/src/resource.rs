//! Call resources and resource composition.
//!
//! A [`ResourceComposer`] expands the generators of one logical request into
//! concrete per-provider [`CallResource`]s against a topology snapshot.
//! Provider selection policy belongs to the composer; the dispatch layer only
//! needs the resource list and the expected provider count per business.

use crate::topology::{Provider, TopologySnapshot};
use madrpc_common::protocol::{CallSession, Generator, RpcArgs, SourceId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

static RESOURCE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique resource id.
pub fn next_resource_id() -> u64 {
    RESOURCE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// How a resource's answer is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Answer is awaited and aggregated into the reply
    Normal,
    /// Fire-and-forget call whose answer is not awaited
    Probe,
    /// Re-issue of a straggling normal resource
    Retry,
}

/// One concrete provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResource {
    pub id: u64,
    /// Reply slot this resource answers into (assigned when registered)
    pub slot: usize,
    pub biz_name: String,
    pub strategy: String,
    pub source_id: SourceId,
    pub provider: Provider,
    pub kind: ResourceKind,
    pub payload: RpcArgs,
}

impl CallResource {
    /// Builds a normal resource for `generator` toward `provider`.
    pub fn for_generator(generator: &Generator, provider: Provider, kind: ResourceKind) -> Self {
        Self {
            id: next_resource_id(),
            slot: 0,
            biz_name: generator.biz_name.clone(),
            strategy: generator.strategy.clone(),
            source_id: generator.source_id.unwrap_or_default(),
            provider,
            kind,
            payload: generator.payload.clone(),
        }
    }

    pub fn is_normal(&self) -> bool {
        self.kind == ResourceKind::Normal
    }

    /// Copy of this resource redirected to `provider` as a retry.
    pub fn retry_to(&self, provider: Provider) -> Self {
        Self {
            id: next_resource_id(),
            provider,
            kind: ResourceKind::Retry,
            ..self.clone()
        }
    }
}

/// Output of a composer run.
#[derive(Debug, Clone, Default)]
pub struct ComposedResources {
    pub resources: Vec<CallResource>,
    /// Providers the composer planned per business (for statistics)
    pub expected_providers: HashMap<String, usize>,
}

/// Expands generators into call resources.
pub trait ResourceComposer: Send + Sync {
    fn compose(
        &self,
        generators: &[Generator],
        session: &CallSession,
        topology: &TopologySnapshot,
    ) -> ComposedResources;
}

/// Default composer: one resource per provider of each generator's business.
///
/// Providers are visited starting at `source_id % provider_count`, so
/// different source ids spread load across the list. With
/// `max_normal_per_biz` set, providers past that count are still called but
/// as [`ResourceKind::Probe`] (their answers are not awaited).
#[derive(Debug, Clone, Default)]
pub struct FanOutComposer {
    max_normal_per_biz: Option<usize>,
}

impl FanOutComposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_normal_per_biz(mut self, max: usize) -> Self {
        self.max_normal_per_biz = Some(max);
        self
    }
}

impl ResourceComposer for FanOutComposer {
    fn compose(
        &self,
        generators: &[Generator],
        _session: &CallSession,
        topology: &TopologySnapshot,
    ) -> ComposedResources {
        let mut composed = ComposedResources::default();

        for generator in generators {
            let providers = topology.providers(&generator.biz_name);
            let expected = composed
                .expected_providers
                .entry(generator.biz_name.clone())
                .or_insert(0);

            if providers.is_empty() {
                warn!(
                    "No provider for biz '{}' in topology version {}",
                    generator.biz_name,
                    topology.version()
                );
                continue;
            }

            let start = (generator.source_id.unwrap_or_default() % providers.len() as u64) as usize;
            for offset in 0..providers.len() {
                let provider = providers[(start + offset) % providers.len()].clone();
                let kind = match self.max_normal_per_biz {
                    Some(max) if offset >= max => ResourceKind::Probe,
                    _ => {
                        *expected += 1;
                        ResourceKind::Normal
                    }
                };
                composed
                    .resources
                    .push(CallResource::for_generator(generator, provider, kind));
            }
        }

        composed
    }
}
