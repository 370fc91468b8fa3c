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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::error::MergeError;
use crate::common::hash::SHARD_SEED;
use crate::exec::aggregator::Aggregator;
use crate::exec::grouper::AccumulateResult;
use crate::exec::grouper::spilling::{KWayMerge, RowSource, SpillingGrouper};
use crate::exec::grouper::temp_storage::LimitedTemporaryStorage;
use crate::exec::query::{DimensionSpec, GroupByQuery};
use crate::exec::row::{ResultRow, RowStream, hash_dims_with_seed};
use crate::runtime::buffer_pool::MergeBufferHandle;
use crate::runtime::resource::ResourceClose;
use crate::runtime::stats::PerQueryStats;

/// Thread-safe grouper: one spilling shard per region of the first merge
/// buffer, with each row routed to exactly one shard by key hash.
///
/// With parallel combine the drain runs a second phase that folds every
/// shard's output into a combining grouper over the second merge buffer;
/// otherwise shard outputs are chained or heap-merged directly, which is
/// sound because shards hold disjoint key sets.
pub(crate) struct ConcurrentGrouper {
    specs: Vec<DimensionSpec>,
    aggregators: Vec<Arc<dyn Aggregator>>,
    shards: Vec<Mutex<SpillingGrouper>>,
    combine: Mutex<Option<SpillingGrouper>>,
    buffers: Mutex<Vec<MergeBufferHandle>>,
    parallel_combine: bool,
    sort_output: bool,
    max_dictionary_bytes: u64,
    storage: Arc<LimitedTemporaryStorage>,
    stats: Arc<PerQueryStats>,
    closed: AtomicBool,
}

impl ConcurrentGrouper {
    pub(crate) fn new(
        query: &GroupByQuery,
        buffers: Vec<MergeBufferHandle>,
        max_dictionary_bytes: u64,
        storage: Arc<LimitedTemporaryStorage>,
        stats: Arc<PerQueryStats>,
    ) -> Result<Self, MergeError> {
        let parallel_combine = query.parallel_combine_threads > 1;
        if buffers.is_empty() || (parallel_combine && buffers.len() < 2) {
            return Err(MergeError::defensive(format!(
                "grouper needs {} merge buffers, got {}",
                if parallel_combine { 2 } else { 1 },
                buffers.len()
            )));
        }
        let mut buffers = buffers;
        let shard_regions = buffers[0].take_regions()?;
        let shard_count = shard_regions.len() as u64;
        let shard_dictionary_bytes = max_dictionary_bytes / shard_count.max(1);
        let shards = shard_regions
            .into_iter()
            .map(|region| {
                Mutex::new(SpillingGrouper::new(
                    query.dimensions.clone(),
                    query.aggregators.clone(),
                    vec![region],
                    shard_dictionary_bytes,
                    Arc::clone(&storage),
                    Arc::clone(&stats),
                ))
            })
            .collect();
        Ok(Self {
            specs: query.dimensions.clone(),
            aggregators: query.aggregators.clone(),
            shards,
            combine: Mutex::new(None),
            buffers: Mutex::new(buffers),
            parallel_combine,
            sort_output: query.sort_by_key,
            max_dictionary_bytes,
            storage,
            stats,
            closed: AtomicBool::new(false),
        })
    }

    /// Routes one partial row to its shard and folds it in.
    pub(crate) fn aggregate(&self, row: &ResultRow) -> Result<AccumulateResult, MergeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MergeError::defensive("aggregate on a closed grouper"));
        }
        let shard = (hash_dims_with_seed(&row.dims, SHARD_SEED) % self.shards.len() as u64) as usize;
        let mut grouper = self.shards[shard]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        grouper.aggregate(row)
    }

    /// One-shot merged output over everything aggregated so far.
    pub(crate) fn drain(&self) -> Result<RowStream, MergeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MergeError::defensive("drain on a closed grouper"));
        }
        if self.parallel_combine {
            return self.drain_with_combine();
        }
        let mut streams = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let mut grouper = shard.lock().unwrap_or_else(|e| e.into_inner());
            streams.push(grouper.drain(self.sort_output)?);
        }
        if self.sort_output {
            let sources = streams.into_iter().map(RowSource::Stream).collect();
            return Ok(Box::new(KWayMerge::new(sources, self.aggregators.clone())?));
        }
        Ok(Box::new(streams.into_iter().flatten()))
    }

    /// Second combine phase: folds every shard's output into a fresh grouper
    /// over the second merge buffer, then drains that grouper.
    fn drain_with_combine(&self) -> Result<RowStream, MergeError> {
        let mut combine_slot = self.combine.lock().unwrap_or_else(|e| e.into_inner());
        if combine_slot.is_some() {
            return Err(MergeError::defensive("grouper output already drained"));
        }
        let combine_regions = {
            let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
            buffers[1].take_regions()?
        };
        let mut combiner = SpillingGrouper::new(
            self.specs.clone(),
            self.aggregators.clone(),
            combine_regions,
            self.max_dictionary_bytes,
            Arc::clone(&self.storage),
            Arc::clone(&self.stats),
        );
        let result = self
            .fold_shards_into(&mut combiner)
            .and_then(|_| combiner.drain(self.sort_output));
        match result {
            Ok(stream) => {
                *combine_slot = Some(combiner);
                Ok(stream)
            }
            Err(err) => {
                let regions = combiner.close();
                let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
                buffers[1].restore_regions(regions);
                Err(err)
            }
        }
    }

    fn fold_shards_into(&self, combiner: &mut SpillingGrouper) -> Result<(), MergeError> {
        for shard in &self.shards {
            let mut grouper = shard.lock().unwrap_or_else(|e| e.into_inner());
            for row in grouper.drain(false)? {
                match combiner.aggregate(&row?)? {
                    AccumulateResult::Ok => {}
                    AccumulateResult::Failed(reason) => {
                        return Err(MergeError::resource_exhausted(reason));
                    }
                }
            }
        }
        Ok(())
    }

    /// Closes every shard, restores all regions to their buffer handles, and
    /// returns the buffers to the pool. Safe to call more than once.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut shard_regions = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let mut grouper = shard.lock().unwrap_or_else(|e| e.into_inner());
            shard_regions.extend(grouper.close());
        }
        let combine_regions = self
            .combine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(|mut combiner| combiner.close());
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = buffers.first_mut() {
            handle.restore_regions(shard_regions);
        }
        if let (Some(regions), Some(handle)) = (combine_regions, buffers.get_mut(1)) {
            handle.restore_regions(regions);
        }
        buffers.clear();
    }
}

impl ResourceClose for ConcurrentGrouper {
    fn close_resource(&self) {
        self.close();
    }
}
