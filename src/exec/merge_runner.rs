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

//! Fan-out merge dispatcher.
//!
//! Responsibilities:
//! - Run every leaf runner as a prioritized work unit and fold the partial
//!   rows into one concurrent grouper under a fixed merge-buffer budget.
//! - Enforce the shared wall-clock deadline and cooperative cancellation:
//!   any unit failure cancels all siblings; there is no partial success.
//! - Release buffers, temporary storage, and the reservation exactly once
//!   when the merged output is closed, no matter how the merge ended.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::config;
use crate::common::error::MergeError;
use crate::common::logging::debug;
use crate::common::types::{Deadline, QueryId, ResourceId};
use crate::exec::chained::ChainedRunner;
use crate::exec::grouper::AccumulateResult;
use crate::exec::grouper::concurrent::ConcurrentGrouper;
use crate::exec::grouper::temp_storage::LimitedTemporaryStorage;
use crate::exec::query::GroupByQuery;
use crate::exec::row::{QueryRunner, ResultRow, RowStream};
use crate::runtime::reservation::{ReservationPool, reservation_pool, runner_buffer_count};
use crate::runtime::resource::{ResourceHolder, ResourceToken};
use crate::runtime::task_pool::{ProcessingPool, TaskContext, TaskFuture, processing_pool};
use crate::runtime::watcher::query_watcher;

/// Merges partial group-by results from a set of leaf runners into one
/// deduplicated, fully aggregated stream.
pub struct GroupByMergeRunner {
    runners: Vec<Arc<dyn QueryRunner>>,
    reservations: Arc<ReservationPool>,
}

impl GroupByMergeRunner {
    pub fn new(runners: Vec<Arc<dyn QueryRunner>>) -> Self {
        Self::with_reservations(runners, reservation_pool())
    }

    pub fn with_reservations(
        runners: Vec<Arc<dyn QueryRunner>>,
        reservations: Arc<ReservationPool>,
    ) -> Self {
        Self {
            runners,
            reservations,
        }
    }

    /// Starts a merge. All acquisition and leaf dispatch happens lazily on
    /// the first `next_row` pull; by-segment and chained-merge queries bypass
    /// the buffers entirely and concatenate instead.
    pub fn merge(&self, query: &GroupByQuery) -> MergedRows {
        if query.by_segment || query.chained_merge {
            return MergedRows::passthrough(query, ChainedRunner::new(self.runners.clone()));
        }
        MergedRows::grouped(
            query,
            self.runners.clone(),
            Arc::clone(&self.reservations),
        )
    }
}

impl QueryRunner for GroupByMergeRunner {
    fn run(&self, query: &GroupByQuery) -> Result<RowStream, MergeError> {
        Ok(Box::new(self.merge(query)))
    }
}

enum MergedState {
    Pending {
        runners: Vec<Arc<dyn QueryRunner>>,
        query: GroupByQuery,
    },
    Failed(MergeError),
    Streaming(RowStream),
    Finished,
}

struct MergeCleanup {
    grouper_holder: ResourceHolder<Arc<ConcurrentGrouper>>,
    storage_holder: ResourceHolder<Arc<LimitedTemporaryStorage>>,
}

/// Lazily merged output of one group-by merge stage.
///
/// `close` is idempotent, runs on drop, and releases the grouper holder, the
/// temporary storage holder, and the reservation bookkeeping.
pub struct MergedRows {
    query_id: QueryId,
    resource_id: ResourceId,
    reservations: Option<Arc<ReservationPool>>,
    state: MergedState,
    cleanup: Option<MergeCleanup>,
    closed: bool,
}

impl MergedRows {
    fn grouped(
        query: &GroupByQuery,
        runners: Vec<Arc<dyn QueryRunner>>,
        reservations: Arc<ReservationPool>,
    ) -> Self {
        Self {
            query_id: query.id,
            resource_id: query.resource_id.clone(),
            reservations: Some(reservations),
            state: MergedState::Pending {
                runners,
                query: query.clone(),
            },
            cleanup: None,
            closed: false,
        }
    }

    fn passthrough(query: &GroupByQuery, chained: ChainedRunner) -> Self {
        let state = match chained.run(query) {
            Ok(stream) => MergedState::Streaming(stream),
            Err(err) => MergedState::Failed(err),
        };
        Self {
            query_id: query.id,
            resource_id: query.resource_id.clone(),
            reservations: None,
            state,
            cleanup: None,
            closed: false,
        }
    }

    /// Pulls the next fully merged row. The first pull performs the whole
    /// acquisition and fan-out.
    pub fn next_row(&mut self) -> Result<Option<ResultRow>, MergeError> {
        if matches!(self.state, MergedState::Pending { .. }) {
            let state = std::mem::replace(&mut self.state, MergedState::Finished);
            let MergedState::Pending { runners, query } = state else {
                return Err(MergeError::defensive("merged rows state out of step"));
            };
            match self.start(&runners, &query) {
                Ok(stream) => self.state = MergedState::Streaming(stream),
                Err(err) => {
                    self.close();
                    return Err(err);
                }
            }
        }
        if matches!(self.state, MergedState::Failed(_)) {
            let state = std::mem::replace(&mut self.state, MergedState::Finished);
            let MergedState::Failed(err) = state else {
                return Err(MergeError::defensive("merged rows state out of step"));
            };
            self.close();
            return Err(err);
        }
        match &mut self.state {
            MergedState::Streaming(stream) => match stream.next() {
                Some(Ok(row)) => Ok(Some(row)),
                Some(Err(err)) => {
                    self.state = MergedState::Finished;
                    self.close();
                    Err(err)
                }
                None => {
                    self.state = MergedState::Finished;
                    self.close();
                    Ok(None)
                }
            },
            _ => Ok(None),
        }
    }

    fn start(
        &mut self,
        runners: &[Arc<dyn QueryRunner>],
        query: &GroupByQuery,
    ) -> Result<RowStream, MergeError> {
        let deadline = Deadline::from_timeout(query.effective_timeout());
        if deadline.expired() {
            return Err(MergeError::timeout("merge deadline passed before dispatch"));
        }
        let Some(reservations) = self.reservations.as_ref() else {
            return Err(MergeError::defensive("grouped merge without a reservation pool"));
        };
        self.cleanup = Some(acquire(query, reservations)?);
        let cleanup = self
            .cleanup
            .as_ref()
            .ok_or_else(|| MergeError::defensive("merge resources vanished during setup"))?;
        debug!(
            "dispatching {} merge units for query {}",
            runners.len(),
            query.id
        );
        dispatch_and_drain(runners, query, cleanup, &deadline)
    }

    /// Releases every held resource. Safe to call more than once; also runs
    /// on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Dropping the stream first lets go of any open spill-run readers.
        self.state = MergedState::Finished;
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.grouper_holder.close();
            cleanup.storage_holder.close();
        }
        if let Some(reservations) = self.reservations.take() {
            query_watcher().unregister(&self.query_id);
            reservations.clean(&self.resource_id);
        }
    }
}

impl Iterator for MergedRows {
    type Item = Result<ResultRow, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

impl Drop for MergedRows {
    fn drop(&mut self) {
        self.close();
    }
}

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

fn merge_scratch_dir(query: &GroupByQuery) -> PathBuf {
    config::spill_dir().join(format!(
        "merge-{}-{}-{}",
        std::process::id(),
        SCRATCH_SEQ.fetch_add(1, Ordering::AcqRel),
        query.id
    ))
}

/// Takes the runner buffers out of the reservation and builds the grouper
/// and temporary storage. On failure everything acquired so far is released
/// before the error propagates.
fn acquire(query: &GroupByQuery, reservations: &ReservationPool) -> Result<MergeCleanup, MergeError> {
    let buffers =
        reservations.take_runner_buffers(&query.resource_id, runner_buffer_count(query))?;
    let stats = reservations.stats().per_query(&query.resource_id);
    let storage = Arc::new(LimitedTemporaryStorage::new(
        merge_scratch_dir(query),
        query.effective_max_spill_bytes(),
    ));
    let storage_holder = ResourceHolder::new(Arc::clone(&storage));
    match ConcurrentGrouper::new(query, buffers, config::max_dictionary_bytes(), storage, stats) {
        Ok(grouper) => Ok(MergeCleanup {
            grouper_holder: ResourceHolder::new(Arc::new(grouper)),
            storage_holder,
        }),
        Err(err) => {
            storage_holder.close();
            Err(err)
        }
    }
}

fn dispatch_and_drain(
    runners: &[Arc<dyn QueryRunner>],
    query: &GroupByQuery,
    cleanup: &MergeCleanup,
    deadline: &Deadline,
) -> Result<RowStream, MergeError> {
    let pool = processing_pool();
    let watcher = query_watcher();
    let holder = &cleanup.grouper_holder;

    if query.single_threaded {
        for runner in runners {
            let future = submit_unit(pool, holder, runner, query)?;
            let handle = future.handle();
            watcher.register(query.id, std::slice::from_ref(&handle));
            if let Err(err) = unit_outcome(future.wait(deadline)) {
                handle.cancel(&err.message);
                return Err(err);
            }
        }
    } else {
        let mut futures = Vec::with_capacity(runners.len());
        for runner in runners {
            futures.push(submit_unit(pool, holder, runner, query)?);
        }
        let handles: Vec<_> = futures.iter().map(|f| f.handle()).collect();
        watcher.register(query.id, &handles);
        for future in &futures {
            if let Err(err) = unit_outcome(future.wait(deadline)) {
                for handle in &handles {
                    handle.cancel(&err.message);
                }
                return Err(err);
            }
        }
    }
    holder.get().drain()
}

fn submit_unit(
    pool: &ProcessingPool,
    holder: &ResourceHolder<Arc<ConcurrentGrouper>>,
    runner: &Arc<dyn QueryRunner>,
    query: &GroupByQuery,
) -> Result<TaskFuture<AccumulateResult>, MergeError> {
    let token = holder.increment()?;
    let runner = Arc::clone(runner);
    // Leaf copies carry the chained-merge mark so a nested merge stage
    // concatenates instead of reserving merge buffers of its own.
    let leaf_query = query.for_chained_execution();
    Ok(pool.submit(query.priority, move |ctx| {
        accumulate_leaf(&token, &runner, &leaf_query, ctx)
    }))
}

fn accumulate_leaf(
    token: &ResourceToken<Arc<ConcurrentGrouper>>,
    runner: &Arc<dyn QueryRunner>,
    query: &GroupByQuery,
    ctx: &TaskContext,
) -> Result<AccumulateResult, MergeError> {
    let grouper = token.get();
    let stream = runner.run(query)?;
    for row in stream {
        ctx.check_cancelled()?;
        match grouper.aggregate(&row?)? {
            AccumulateResult::Ok => {}
            failed @ AccumulateResult::Failed(_) => return Ok(failed),
        }
    }
    Ok(AccumulateResult::Ok)
}

fn unit_outcome(result: Result<AccumulateResult, MergeError>) -> Result<(), MergeError> {
    match result {
        Ok(AccumulateResult::Ok) => Ok(()),
        Ok(AccumulateResult::Failed(reason)) => Err(MergeError::resource_exhausted(format!(
            "merge resources exhausted: {reason}"
        ))),
        Err(err) => Err(err),
    }
}
