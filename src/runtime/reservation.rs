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

//! Up-front merge buffer reservation, keyed by resource id.
//!
//! A query's full buffer requirement is taken from the pool in one
//! all-or-nothing batch before the merge starts. The merge stage later
//! fetches its runner share out of the reservation; auxiliary buffers for
//! nested or sub-totaled execution stay registered until `clean`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use crate::common::error::MergeError;
use crate::common::types::{Deadline, ResourceId};
use crate::exec::query::GroupByQuery;
use crate::runtime::buffer_pool::{BlockingBufferPool, MergeBufferHandle, merge_buffer_pool};
use crate::runtime::stats::{MergeStatsRegistry, merge_stats_registry};

/// Buffers needed by the merging runner itself: one for the sharded
/// aggregation, a second when a parallel combine phase runs over it.
pub fn runner_buffer_count(query: &GroupByQuery) -> usize {
    if query.parallel_combine_threads > 1 { 2 } else { 1 }
}

fn subtotals_buffer_count(query: &GroupByQuery) -> usize {
    match &query.subtotal_specs {
        None => 0,
        Some(specs) if specs.is_empty() => 0,
        Some(specs) => {
            let names = query.dimension_names();
            let all_prefixes = specs.iter().all(|spec| {
                spec.len() <= names.len()
                    && spec.iter().zip(names.iter()).all(|(s, n)| s == n)
            });
            if all_prefixes { 1 } else { 2 }
        }
    }
}

fn auxiliary_buffer_count(query: &GroupByQuery) -> usize {
    // Nested stages and subtotal processing hold their buffers at the same
    // time, so the two shares add.
    query.nesting_depth() + subtotals_buffer_count(query)
}

/// Total merge buffers a query must reserve before its merge stage runs.
pub fn required_merge_buffers(query: &GroupByQuery) -> usize {
    runner_buffer_count(query) + auxiliary_buffer_count(query)
}

struct QueryReservation {
    handles: Vec<MergeBufferHandle>,
}

pub struct ReservationPool {
    pool: Arc<BlockingBufferPool>,
    stats: Arc<MergeStatsRegistry>,
    reservations: Mutex<HashMap<ResourceId, QueryReservation>>,
}

impl ReservationPool {
    pub fn new(pool: Arc<BlockingBufferPool>, stats: Arc<MergeStatsRegistry>) -> Self {
        Self {
            pool,
            stats,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    pub fn buffer_pool(&self) -> &Arc<BlockingBufferPool> {
        &self.pool
    }

    pub fn stats(&self) -> &Arc<MergeStatsRegistry> {
        &self.stats
    }

    /// Reserve the query's full buffer requirement under its resource id.
    /// Blocks until the pool can satisfy the batch or the deadline expires.
    pub fn reserve(&self, query: &GroupByQuery, deadline: &Deadline) -> Result<(), MergeError> {
        {
            let reservations = self.reservations.lock().expect("reservation lock");
            if reservations.contains_key(&query.resource_id) {
                return Err(MergeError::defensive(format!(
                    "merge buffers already reserved for resource id {}",
                    query.resource_id
                )));
            }
        }

        let required = required_merge_buffers(query);
        let start = Instant::now();
        let handles = self.pool.take_batch(required, deadline)?;
        self.stats
            .per_query(&query.resource_id)
            .add_acquisition_wait(start.elapsed());

        let mut reservations = self.reservations.lock().expect("reservation lock");
        // A racing reserve for the same id may have won while this one was
        // blocked on the pool.
        if reservations.contains_key(&query.resource_id) {
            return Err(MergeError::defensive(format!(
                "merge buffers already reserved for resource id {}",
                query.resource_id
            )));
        }
        reservations.insert(query.resource_id.clone(), QueryReservation { handles });
        Ok(())
    }

    /// Hand the merge stage its runner buffers out of the reservation.
    /// A missing or undersized reservation is an orchestration bug.
    pub fn take_runner_buffers(
        &self,
        resource_id: &ResourceId,
        count: usize,
    ) -> Result<Vec<MergeBufferHandle>, MergeError> {
        let mut reservations = self.reservations.lock().expect("reservation lock");
        let reservation = reservations.get_mut(resource_id).ok_or_else(|| {
            MergeError::defensive(format!(
                "no merge buffers reserved for resource id {}",
                resource_id
            ))
        })?;
        if reservation.handles.len() < count {
            return Err(MergeError::defensive(format!(
                "reservation for resource id {} holds {} merge buffers but the merge needs {}",
                resource_id,
                reservation.handles.len(),
                count
            )));
        }
        Ok(reservation.handles.drain(..count).collect())
    }

    /// Buffers still registered under the id, if any.
    pub fn reserved_count(&self, resource_id: &ResourceId) -> Option<usize> {
        self.reservations
            .lock()
            .expect("reservation lock")
            .get(resource_id)
            .map(|r| r.handles.len())
    }

    /// Drop whatever the id still holds, returning the buffers to the pool,
    /// and retire the query's stats slot. Unknown ids are a no-op.
    pub fn clean(&self, resource_id: &ResourceId) {
        let removed = {
            let mut reservations = self.reservations.lock().expect("reservation lock");
            reservations.remove(resource_id)
        };
        if removed.is_some() {
            self.stats.close_query(resource_id);
        }
    }
}

static RESERVATION_POOL: OnceLock<Arc<ReservationPool>> = OnceLock::new();

/// Global reservation pool over the global merge buffer pool.
pub fn reservation_pool() -> Arc<ReservationPool> {
    Arc::clone(RESERVATION_POOL.get_or_init(|| {
        Arc::new(ReservationPool::new(
            merge_buffer_pool(),
            merge_stats_registry(),
        ))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::QueryId;
    use crate::exec::aggregator::long_sum;
    use crate::exec::query::DimensionSpec;
    use crate::exec::row::DimType;

    fn test_pool(capacity: usize) -> ReservationPool {
        ReservationPool::new(
            Arc::new(BlockingBufferPool::new(capacity, 1024, 2)),
            Arc::new(MergeStatsRegistry::new()),
        )
    }

    fn query(name: &str) -> GroupByQuery {
        GroupByQuery::new(
            QueryId::new(7, 7),
            vec![
                DimensionSpec::new("a", DimType::String),
                DimensionSpec::new("b", DimType::Long),
            ],
            vec![long_sum("rows")],
        )
        .with_resource_id(name)
    }

    #[test]
    fn requirement_rule_observables() {
        assert_eq!(required_merge_buffers(&query("simple")), 1);
        assert_eq!(
            required_merge_buffers(&query("pc").with_parallel_combine_threads(4)),
            2
        );
        assert_eq!(
            required_merge_buffers(&query("nested").with_subquery(query("inner"))),
            2
        );
        let double = query("outer").with_subquery(query("mid").with_subquery(query("inner")));
        assert_eq!(required_merge_buffers(&double), 3);
        let triple = query("outer3")
            .with_subquery(query("a").with_subquery(query("b").with_subquery(query("c"))));
        assert_eq!(required_merge_buffers(&triple), 3);

        let prefix = query("st1").with_subtotal_specs(vec![
            vec!["a".to_string()],
            vec!["a".to_string(), "b".to_string()],
        ]);
        assert_eq!(required_merge_buffers(&prefix), 2);
        let non_prefix = query("st2").with_subtotal_specs(vec![vec!["b".to_string()]]);
        assert_eq!(required_merge_buffers(&non_prefix), 3);

        // The nested stage's buffer and the two subtotal buffers are held
        // at the same time as the runner's, so the shares add up to four.
        let nested_subtotals = query("ns")
            .with_subquery(query("inner"))
            .with_subtotal_specs(vec![vec!["a".to_string()], vec!["b".to_string()]]);
        assert_eq!(required_merge_buffers(&nested_subtotals), 4);

        // Subtotal specs on the inner query leave the outer requirement as is.
        let subtotaled_inner = query("inner")
            .with_subtotal_specs(vec![vec!["a".to_string()], vec!["b".to_string()]]);
        let nested_inner_subtotals = query("nis")
            .with_subquery(subtotaled_inner)
            .with_subtotal_specs(vec![vec!["a".to_string()], vec!["b".to_string()]]);
        assert_eq!(required_merge_buffers(&nested_inner_subtotals), 4);
    }

    #[test]
    fn reserve_then_clean_restores_pool() {
        let pool = test_pool(4);
        let q = query("rc").with_subquery(query("inner"));
        pool.reserve(&q, &Deadline::unbounded()).expect("reserve");
        assert_eq!(pool.buffer_pool().available(), 2);
        assert_eq!(pool.reserved_count(&q.resource_id), Some(2));
        pool.clean(&q.resource_id);
        assert_eq!(pool.buffer_pool().available(), 4);
        assert_eq!(pool.reserved_count(&q.resource_id), None);
        pool.clean(&q.resource_id);
        assert_eq!(pool.buffer_pool().available(), 4);
    }

    #[test]
    fn double_reserve_is_rejected() {
        let pool = test_pool(4);
        let q = query("dup");
        pool.reserve(&q, &Deadline::unbounded()).expect("reserve");
        let err = pool
            .reserve(&q, &Deadline::unbounded())
            .expect_err("expected defensive error");
        assert_eq!(err.kind, crate::common::error::MergeErrorKind::Defensive);
    }

    #[test]
    fn fetch_without_reservation_is_defensive() {
        let pool = test_pool(2);
        let err = pool
            .take_runner_buffers(&ResourceId::from("ghost"), 1)
            .expect_err("expected defensive error");
        assert_eq!(err.kind, crate::common::error::MergeErrorKind::Defensive);
    }

    #[test]
    fn undersized_reservation_is_defensive() {
        let pool = test_pool(4);
        let q = query("small");
        pool.reserve(&q, &Deadline::unbounded()).expect("reserve");
        let err = pool
            .take_runner_buffers(&q.resource_id, 2)
            .expect_err("expected defensive error");
        assert_eq!(err.kind, crate::common::error::MergeErrorKind::Defensive);
        // The failed fetch must not have consumed the reserved buffer.
        assert_eq!(pool.reserved_count(&q.resource_id), Some(1));
        pool.clean(&q.resource_id);
    }

    #[test]
    fn taken_runner_buffers_leave_auxiliary_registered() {
        let pool = test_pool(4);
        let q = query("take").with_subquery(query("inner"));
        pool.reserve(&q, &Deadline::unbounded()).expect("reserve");
        let handles = pool
            .take_runner_buffers(&q.resource_id, 1)
            .expect("take runner share");
        assert_eq!(handles.len(), 1);
        assert_eq!(pool.reserved_count(&q.resource_id), Some(1));
        drop(handles);
        // Runner buffers go straight back to the pool, not the reservation.
        assert_eq!(pool.buffer_pool().available(), 3);
        pool.clean(&q.resource_id);
        assert_eq!(pool.buffer_pool().available(), 4);
    }
}
