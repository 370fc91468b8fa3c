// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::common::types::ResourceId;

/// Counters a single query's merge updates while it runs. Folded into the
/// process totals when the query's reservation is cleaned.
#[derive(Debug, Default)]
pub struct PerQueryStats {
    acquisition_wait_ns: AtomicU64,
    spilled_bytes: AtomicU64,
    spilled_runs: AtomicU64,
    dictionary_peak_bytes: AtomicU64,
}

impl PerQueryStats {
    pub fn add_acquisition_wait(&self, wait: Duration) {
        let ns = u64::try_from(wait.as_nanos()).unwrap_or(u64::MAX);
        self.acquisition_wait_ns.fetch_add(ns, Ordering::AcqRel);
    }

    pub fn add_spill_run(&self, bytes: u64) {
        self.spilled_runs.fetch_add(1, Ordering::AcqRel);
        self.spilled_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn record_dictionary_bytes(&self, bytes: u64) {
        let mut prev = self.dictionary_peak_bytes.load(Ordering::Relaxed);
        while bytes > prev {
            match self.dictionary_peak_bytes.compare_exchange(
                prev,
                bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn acquisition_wait(&self) -> Duration {
        Duration::from_nanos(self.acquisition_wait_ns.load(Ordering::Acquire))
    }

    pub fn spilled_bytes(&self) -> u64 {
        self.spilled_bytes.load(Ordering::Acquire)
    }

    pub fn spilled_runs(&self) -> u64 {
        self.spilled_runs.load(Ordering::Acquire)
    }

    pub fn dictionary_peak_bytes(&self) -> u64 {
        self.dictionary_peak_bytes.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub closed_queries: u64,
    pub acquisition_wait: Duration,
    pub spilled_bytes: u64,
    pub spilled_runs: u64,
}

/// Per-resource-id stats slots plus running process totals.
#[derive(Debug, Default)]
pub struct MergeStatsRegistry {
    slots: Mutex<HashMap<ResourceId, Arc<PerQueryStats>>>,
    closed_queries: AtomicU64,
    total_acquisition_wait_ns: AtomicU64,
    total_spilled_bytes: AtomicU64,
    total_spilled_runs: AtomicU64,
}

impl MergeStatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn per_query(&self, resource_id: &ResourceId) -> Arc<PerQueryStats> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            slots
                .entry(resource_id.clone())
                .or_insert_with(|| Arc::new(PerQueryStats::default())),
        )
    }

    /// Retire a query's slot, folding its counters into the process totals.
    /// Unknown ids are ignored.
    pub fn close_query(&self, resource_id: &ResourceId) {
        let removed = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.remove(resource_id)
        };
        if let Some(stats) = removed {
            self.closed_queries.fetch_add(1, Ordering::AcqRel);
            self.total_acquisition_wait_ns.fetch_add(
                stats.acquisition_wait_ns.load(Ordering::Acquire),
                Ordering::AcqRel,
            );
            self.total_spilled_bytes
                .fetch_add(stats.spilled_bytes(), Ordering::AcqRel);
            self.total_spilled_runs
                .fetch_add(stats.spilled_runs(), Ordering::AcqRel);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            closed_queries: self.closed_queries.load(Ordering::Acquire),
            acquisition_wait: Duration::from_nanos(
                self.total_acquisition_wait_ns.load(Ordering::Acquire),
            ),
            spilled_bytes: self.total_spilled_bytes.load(Ordering::Acquire),
            spilled_runs: self.total_spilled_runs.load(Ordering::Acquire),
        }
    }
}

static STATS_REGISTRY: OnceLock<Arc<MergeStatsRegistry>> = OnceLock::new();

pub fn merge_stats_registry() -> Arc<MergeStatsRegistry> {
    Arc::clone(STATS_REGISTRY.get_or_init(|| Arc::new(MergeStatsRegistry::new())))
}
