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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metrics for a specific backend business
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BizMetrics {
    pub call_count: u64,
    /// Providers the composer expected for the most recent call
    pub expected_providers: u64,
    pub retry_count: u64,
    pub early_termination_count: u64,
}

/// Complete dispatch metrics snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub failed_calls: u64,
    /// Calls that registered with the delegation thread
    pub detection_calls: u64,
    /// Most recently reported delegation queue depth
    pub delegation_queue_depth: u64,
    /// Work items dropped because the delegation queue was full
    pub delegation_dropped: u64,
    pub uptime_ms: u64,
    pub bizs: HashMap<String, BizMetrics>,
}

impl MetricsSnapshot {
    pub fn new(uptime_ms: u64) -> Self {
        Self {
            total_calls: 0,
            failed_calls: 0,
            detection_calls: 0,
            delegation_queue_depth: 0,
            delegation_dropped: 0,
            uptime_ms,
            bizs: HashMap::new(),
        }
    }

    /// Sum of retries across every business.
    pub fn total_retries(&self) -> u64 {
        self.bizs.values().map(|b| b.retry_count).sum()
    }
}
