// Copyright 2025 MaDRPC Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{bail, Result};
use madrpc_common::protocol::error::{MadrpcError, Result as MadrpcResult};
use madrpc_common::protocol::{CallSession, Generator, ProviderResult};
use madrpc_dispatch::{
    CallResource, FanOutComposer, Provider, Reply, ResourceKind, SearchParam, SearchService,
    SearchServiceConfig, TopologySnapshot, Transport,
};
use rand::Rng;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::info;

/// Latency window applied to every simulated business
const LATENCY_WINDOW: u64 = 64;

/// Transport that answers from tokio timers after a random latency.
///
/// A share of calls (`silent_rate`) never answers, which is what gives early
/// termination and retry something to do. Another share (`reject_rate`) is
/// refused when issued.
pub struct SimulatedTransport {
    handle: Handle,
    min_latency_ms: u64,
    max_latency_ms: u64,
    silent_rate: f64,
    reject_rate: f64,
}

impl SimulatedTransport {
    pub fn new(handle: Handle, min_latency_ms: u64, max_latency_ms: u64, silent_rate: f64) -> Self {
        Self {
            handle,
            min_latency_ms: min_latency_ms.min(max_latency_ms),
            max_latency_ms,
            silent_rate: silent_rate.clamp(0.0, 1.0),
            reject_rate: 0.0,
        }
    }

    pub fn with_reject_rate(mut self, reject_rate: f64) -> Self {
        self.reject_rate = reject_rate.clamp(0.0, 1.0);
        self
    }
}

impl Transport for SimulatedTransport {
    fn issue(&self, resource: &CallResource, reply: &Arc<Reply>) -> MadrpcResult<()> {
        if resource.kind == ResourceKind::Probe {
            return Ok(());
        }

        let mut rng = rand::thread_rng();
        if rng.gen_bool(self.reject_rate) {
            return Err(MadrpcError::Transport(format!(
                "provider {} refused the call",
                resource.provider.id
            )));
        }
        if rng.gen_bool(self.silent_rate) {
            return Ok(());
        }
        let latency_ms = rng.gen_range(self.min_latency_ms..=self.max_latency_ms);

        let reply = reply.clone();
        let slot = resource.slot;
        let provider_id = resource.provider.id.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
            reply.on_result(
                slot,
                ProviderResult::success(provider_id, latency_ms, json!({"latency_ms": latency_ms})),
            );
        });
        Ok(())
    }
}

/// Parameters of one simulation run.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub businesses: usize,
    pub providers: usize,
    pub requests: usize,
    pub threads: usize,
    pub timeout_ms: u64,
    pub strategy: String,
    /// JSON flow config applied to `strategy`
    pub flow_config: Option<String>,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub silent_rate: f64,
    pub reject_rate: f64,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            businesses: 3,
            providers: 4,
            requests: 1000,
            threads: 4,
            timeout_ms: 200,
            strategy: "sim".to_string(),
            flow_config: None,
            min_latency_ms: 1,
            max_latency_ms: 20,
            silent_rate: 0.05,
            reject_rate: 0.0,
        }
    }
}

impl SimulationOptions {
    fn validate(&self) -> Result<()> {
        if self.businesses == 0 || self.providers == 0 || self.threads == 0 {
            bail!("businesses, providers and threads must all be at least 1");
        }
        if !(0.0..=1.0).contains(&self.silent_rate) {
            bail!("silent rate must be between 0 and 1, got {}", self.silent_rate);
        }
        if !(0.0..=1.0).contains(&self.reject_rate) {
            bail!("reject rate must be between 0 and 1, got {}", self.reject_rate);
        }
        Ok(())
    }

    fn biz_name(index: usize) -> String {
        format!("biz-{}", index)
    }

    fn topology(&self) -> TopologySnapshot {
        (0..self.businesses).fold(TopologySnapshot::new(1), |topology, b| {
            let providers = (0..self.providers)
                .map(|p| {
                    Provider::new(
                        format!("{}-p{}", Self::biz_name(b), p),
                        format!("127.0.0.1:{}", 9000 + b * self.providers + p),
                    )
                })
                .collect();
            topology.with_biz(Self::biz_name(b), providers)
        })
    }
}

/// Runs `options.requests` searches spread over `options.threads` blocking
/// workers and returns a JSON report.
pub async fn run_simulation(options: SimulationOptions) -> Result<serde_json::Value> {
    options.validate()?;

    let mut config = SearchServiceConfig::default().with_default_call_timeout_ms(options.timeout_ms);
    for b in 0..options.businesses {
        config = config.with_latency_window(SimulationOptions::biz_name(b), LATENCY_WINDOW);
    }

    let transport = SimulatedTransport::new(
        Handle::current(),
        options.min_latency_ms,
        options.max_latency_ms,
        options.silent_rate,
    )
    .with_reject_rate(options.reject_rate);
    let service = Arc::new(SearchService::init(
        config,
        Arc::new(FanOutComposer::new()),
        Arc::new(transport),
    )?);

    if let Some(json) = &options.flow_config {
        service.update_flow_config_json(&options.strategy, Some(json))?;
    }
    service.update_topology(Some(Arc::new(options.topology())));

    info!(
        "Simulating {} requests over {} businesses x {} providers on {} threads",
        options.requests, options.businesses, options.providers, options.threads
    );

    let started = Instant::now();
    let mut workers = Vec::with_capacity(options.threads);
    for t in 0..options.threads {
        let share = options.requests / options.threads + usize::from(t < options.requests % options.threads);
        let service = service.clone();
        let options = options.clone();
        workers.push(tokio::task::spawn_blocking(move || {
            let mut statuses: HashMap<String, u64> = HashMap::new();
            let session = CallSession::new("simulate");
            for _ in 0..share {
                let generators = (0..options.businesses)
                    .map(|b| {
                        Generator::new(SimulationOptions::biz_name(b), json!({"q": "sim"}))
                            .with_strategy(options.strategy.clone())
                    })
                    .collect();
                let reply = service.search(SearchParam::new(generators).wait(), &session);
                *statuses.entry(format!("{:?}", reply.status())).or_default() += 1;
            }
            statuses
        }));
    }

    let mut statuses: HashMap<String, u64> = HashMap::new();
    for worker in workers {
        for (status, count) in worker.await? {
            *statuses.entry(status).or_default() += count;
        }
    }
    let elapsed = started.elapsed();

    let avg_latency: HashMap<String, Option<u64>> = (0..options.businesses)
        .map(SimulationOptions::biz_name)
        .map(|biz| {
            let avg = service.get_avg_latency(&biz);
            (biz, avg)
        })
        .collect();
    let metrics = serde_json::to_value(service.metrics())?;
    service.stop();

    Ok(json!({
        "elapsed_ms": elapsed.as_millis() as u64,
        "statuses": statuses,
        "avg_latency_ms": avg_latency,
        "metrics": metrics,
    }))
}
