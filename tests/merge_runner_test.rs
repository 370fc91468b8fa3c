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
//! End-to-end tests for the group-by merge engine: combine correctness,
//! resource conservation, fail-fast, deadlines, spilling, and cancellation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rowfold::{
    AggValue, Deadline, DimType, DimValue, DimensionSpec, GroupByMergeRunner, GroupByQuery,
    MergeErrorKind, QueryId, QueryRunner, ResultRow, double_sum, long_max, long_sum,
    query_watcher, reservation_pool,
};

use crate::common::{
    TestLeaf, await_pool_restored, collect_sorted, fresh_reservations, hits_query,
    init_test_config, leaf_runners, row,
};

mod common;

fn multi_row(label: &str, hits: i64, weight: f64) -> ResultRow {
    ResultRow::new(
        vec![DimValue::String(label.to_string())],
        vec![
            AggValue::Long(hits),
            AggValue::Long(hits),
            AggValue::Double(weight),
        ],
    )
}

fn multi_query(lo: i64) -> GroupByQuery {
    GroupByQuery::new(
        QueryId::new(11, lo),
        vec![DimensionSpec::new("label", DimType::String)],
        vec![long_sum("hits"), long_max("peak"), double_sum("weight")],
    )
}

/// 240 rows over 30 keys; weights are exact quarters so double sums compare
/// exactly no matter how the partials were grouped.
fn dataset() -> Vec<ResultRow> {
    (0..240i64)
        .map(|i| multi_row(&format!("key-{:02}", i % 30), i, i as f64 / 4.0))
        .collect()
}

fn expected_totals(rows: &[ResultRow]) -> Vec<ResultRow> {
    let mut totals: BTreeMap<String, (i64, i64, f64)> = BTreeMap::new();
    for row in rows {
        let DimValue::String(label) = &row.dims[0] else {
            panic!("string dimension expected");
        };
        let AggValue::Long(hits) = row.aggs[0] else {
            panic!("long aggregate expected");
        };
        let AggValue::Long(peak) = row.aggs[1] else {
            panic!("long aggregate expected");
        };
        let AggValue::Double(weight) = row.aggs[2] else {
            panic!("double aggregate expected");
        };
        let entry = totals.entry(label.clone()).or_insert((0, i64::MIN, 0.0));
        entry.0 += hits;
        entry.1 = entry.1.max(peak);
        entry.2 += weight;
    }
    totals
        .into_iter()
        .map(|(label, (hits, peak, weight))| {
            ResultRow::new(
                vec![DimValue::String(label)],
                vec![
                    AggValue::Long(hits),
                    AggValue::Long(peak),
                    AggValue::Double(weight),
                ],
            )
        })
        .collect()
}

fn partition(rows: &[ResultRow], parts: usize) -> Vec<Arc<TestLeaf>> {
    let mut split: Vec<Vec<ResultRow>> = vec![Vec::new(); parts];
    for (i, row) in rows.iter().enumerate() {
        split[i % parts].push(row.clone());
    }
    split.into_iter().map(TestLeaf::new).collect()
}

#[test]
fn test_merge_is_invariant_under_partitioning() {
    init_test_config();
    let rows = dataset();
    let expected = expected_totals(&rows);

    for (round, parts) in [1usize, 3, 5].into_iter().enumerate() {
        let reservations = fresh_reservations(2, 65536, 4);
        let leaves = partition(&rows, parts);
        let runner =
            GroupByMergeRunner::with_reservations(leaf_runners(&leaves), Arc::clone(&reservations));
        let query = multi_query(round as i64 + 1);
        reservations
            .reserve(&query, &Deadline::unbounded())
            .expect("reserve");

        let merged = collect_sorted(runner.merge(&query));
        assert_eq!(merged, expected, "{parts}-way partition diverged");
        for leaf in &leaves {
            assert_eq!(leaf.runs(), 1);
        }
        assert_eq!(reservations.buffer_pool().available(), 2);
        assert!(reservations.reserved_count(&query.resource_id).is_none());
    }
}

#[test]
fn test_parallel_combine_matches_serial_merge() {
    init_test_config();
    let rows = dataset();
    let expected = expected_totals(&rows);

    let reservations = fresh_reservations(3, 65536, 4);
    let leaves = partition(&rows, 4);
    let runner =
        GroupByMergeRunner::with_reservations(leaf_runners(&leaves), Arc::clone(&reservations));
    let query = multi_query(10).with_parallel_combine_threads(3);
    reservations
        .reserve(&query, &Deadline::unbounded())
        .expect("reserve");

    assert_eq!(collect_sorted(runner.merge(&query)), expected);
    assert_eq!(reservations.buffer_pool().available(), 3);
}

#[test]
fn test_sorted_merge_streams_keys_in_order() {
    init_test_config();
    let geo = |country: &str, city: &str, hits: i64| {
        ResultRow::new(
            vec![
                DimValue::String(country.to_string()),
                DimValue::String(city.to_string()),
            ],
            vec![AggValue::Long(hits)],
        )
    };
    let leaves = [
        TestLeaf::new(vec![geo("no", "oslo", 1), geo("de", "berlin", 2)]),
        TestLeaf::new(vec![geo("de", "berlin", 3), geo("de", "bonn", 4)]),
        TestLeaf::new(vec![geo("fr", "paris", 5), geo("no", "oslo", 6)]),
    ];
    let reservations = fresh_reservations(2, 65536, 4);
    let runner =
        GroupByMergeRunner::with_reservations(leaf_runners(&leaves), Arc::clone(&reservations));
    let query = GroupByQuery::new(
        QueryId::new(11, 20),
        vec![
            DimensionSpec::new("country", DimType::String),
            DimensionSpec::new("city", DimType::String),
        ],
        vec![long_sum("hits")],
    )
    .with_sort_by_key(true);
    reservations
        .reserve(&query, &Deadline::unbounded())
        .expect("reserve");

    let rows: Vec<ResultRow> = runner
        .merge(&query)
        .collect::<Result<_, _>>()
        .expect("sorted merge");
    assert_eq!(rows.len(), 4);
    assert!(
        rows.windows(2).all(|pair| pair[0].dims < pair[1].dims),
        "keys are not in ascending order: {rows:?}"
    );
    assert_eq!(rows[0].dims[1], DimValue::String("berlin".to_string()));
    assert_eq!(rows[0].aggs[0], AggValue::Long(5));
    assert_eq!(rows[3].aggs[0], AggValue::Long(7));
}

/// The same input must combine to the same totals whether or not the table
/// overflowed to disk along the way.
#[test]
fn test_spill_round_trip_matches_in_memory_merge() {
    init_test_config();
    let mut rows = Vec::new();
    for i in 0..600i64 {
        rows.push(row(&format!("key-{i:03}"), 1));
        rows.push(row(&format!("key-{i:03}"), i));
    }
    let run_merge = |reservations: &Arc<rowfold::ReservationPool>, lo: i64| {
        let leaves = partition(&rows, 3);
        let runner =
            GroupByMergeRunner::with_reservations(leaf_runners(&leaves), Arc::clone(reservations));
        let query = hits_query(lo)
            .with_max_spill_bytes(16 << 20)
            .with_sort_by_key(true);
        reservations
            .reserve(&query, &Deadline::unbounded())
            .expect("reserve");
        let merged: Vec<ResultRow> = runner
            .merge(&query)
            .collect::<Result<_, _>>()
            .expect("merge");
        merged
    };

    // Regions of 2048 bytes hold well under 600 keys, forcing spill runs.
    let tight = fresh_reservations(2, 4096, 2);
    let spilled = run_merge(&tight, 30);
    assert!(tight.stats().snapshot().spilled_runs > 0, "no spill happened");

    let roomy = fresh_reservations(2, 65536, 2);
    let in_memory = run_merge(&roomy, 31);
    assert_eq!(roomy.stats().snapshot().spilled_runs, 0);

    assert_eq!(spilled.len(), 600);
    assert_eq!(spilled, in_memory);
    for (i, merged_row) in spilled.iter().enumerate() {
        assert_eq!(merged_row.aggs[0], AggValue::Long(1 + i as i64));
    }
    assert_eq!(tight.buffer_pool().available(), 2);
}

#[test]
fn test_memory_and_disk_exhaustion_fails_the_merge() {
    init_test_config();
    let rows: Vec<ResultRow> = (0..600i64).map(|i| row(&format!("key-{i:03}"), 1)).collect();
    let leaf = TestLeaf::new(rows);
    let reservations = fresh_reservations(2, 4096, 2);
    let runner = GroupByMergeRunner::with_reservations(
        vec![Arc::clone(&leaf) as Arc<dyn QueryRunner>],
        Arc::clone(&reservations),
    );
    // No disk quota: the first table overflow has nowhere to go.
    let query = hits_query(40).with_max_spill_bytes(0);
    reservations
        .reserve(&query, &Deadline::unbounded())
        .expect("reserve");

    let err = runner
        .merge(&query)
        .collect::<Result<Vec<_>, _>>()
        .unwrap_err();
    assert_eq!(err.kind, MergeErrorKind::ResourceExhausted);
    assert!(
        err.message.contains("merge resources exhausted"),
        "unexpected message: {}",
        err.message
    );
    await_pool_restored(&reservations, Duration::from_secs(2));
    assert!(reservations.reserved_count(&query.resource_id).is_none());
}

#[test]
fn test_failed_unit_cancels_siblings_before_they_finish() {
    init_test_config();
    let failing = TestLeaf::failing("leaf scan failed");
    let slow_rows: Vec<ResultRow> = (0..2000).map(|_| row("steady", 1)).collect();
    let slow = TestLeaf::slow(slow_rows, Duration::from_millis(2));
    let reservations = fresh_reservations(2, 65536, 4);
    let runner = GroupByMergeRunner::with_reservations(
        vec![
            Arc::clone(&failing) as Arc<dyn QueryRunner>,
            Arc::clone(&slow) as Arc<dyn QueryRunner>,
        ],
        Arc::clone(&reservations),
    );
    let query = hits_query(41);
    reservations
        .reserve(&query, &Deadline::unbounded())
        .expect("reserve");

    let err = runner
        .merge(&query)
        .collect::<Result<Vec<_>, _>>()
        .unwrap_err();
    assert_eq!(err.kind, MergeErrorKind::Runtime);
    assert!(err.message.contains("leaf scan failed"));

    // The slow sibling observed the cancellation long before its 2000 rows
    // were up; give its straggling unit time to let go of the grouper.
    await_pool_restored(&reservations, Duration::from_secs(5));
    assert!(
        slow.consumed() < 1000,
        "sibling was not cancelled early: consumed {}",
        slow.consumed()
    );
    assert!(reservations.reserved_count(&query.resource_id).is_none());
}

#[test]
fn test_deadline_bounds_leaf_execution() {
    init_test_config();
    let slow_rows: Vec<ResultRow> = (0..100).map(|_| row("late", 1)).collect();
    let slow = TestLeaf::slow(slow_rows, Duration::from_millis(5));
    let reservations = fresh_reservations(2, 65536, 4);
    let runner = GroupByMergeRunner::with_reservations(
        vec![Arc::clone(&slow) as Arc<dyn QueryRunner>],
        Arc::clone(&reservations),
    );
    let query = hits_query(42).with_timeout(Duration::from_millis(80));
    reservations
        .reserve(&query, &Deadline::unbounded())
        .expect("reserve");

    let err = runner
        .merge(&query)
        .collect::<Result<Vec<_>, _>>()
        .unwrap_err();
    assert_eq!(err.kind, MergeErrorKind::Timeout);
    await_pool_restored(&reservations, Duration::from_secs(5));
    assert!(slow.consumed() < 100, "unit ran to completion past the deadline");
}

#[test]
fn test_cancel_query_interrupts_a_running_merge() {
    init_test_config();
    let slow_rows: Vec<ResultRow> = (0..200).map(|_| row("victim", 1)).collect();
    let slow = TestLeaf::slow(slow_rows, Duration::from_millis(5));
    let reservations = fresh_reservations(2, 65536, 4);
    let runner = GroupByMergeRunner::with_reservations(
        vec![Arc::clone(&slow) as Arc<dyn QueryRunner>],
        Arc::clone(&reservations),
    );
    let query = hits_query(43);
    reservations
        .reserve(&query, &Deadline::unbounded())
        .expect("reserve");

    let query_id = query.id;
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        query_watcher().cancel_query(&query_id, "shutting down")
    });

    let err = runner
        .merge(&query)
        .collect::<Result<Vec<_>, _>>()
        .unwrap_err();
    assert_eq!(err.kind, MergeErrorKind::Interrupted);
    assert!(canceller.join().expect("canceller") > 0);
    await_pool_restored(&reservations, Duration::from_secs(5));
    assert!(slow.consumed() < 200, "unit ignored the cancellation");
}

#[test]
fn test_by_segment_concatenates_without_touching_buffers() {
    init_test_config();
    let leaves = [
        TestLeaf::new(vec![row("x", 1), row("y", 2)]),
        TestLeaf::new(vec![row("x", 3)]),
    ];
    let reservations = fresh_reservations(1, 65536, 4);
    let runner =
        GroupByMergeRunner::with_reservations(leaf_runners(&leaves), Arc::clone(&reservations));
    let query = hits_query(44).with_by_segment(true);

    // No reservation was made and none is required.
    let rows: Vec<ResultRow> = runner
        .merge(&query)
        .collect::<Result<_, _>>()
        .expect("by-segment merge");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0], row("x", 1));
    assert_eq!(rows[1], row("y", 2));
    assert_eq!(rows[2], row("x", 3));
    assert_eq!(reservations.buffer_pool().available(), 1);
    assert!(reservations.reserved_count(&query.resource_id).is_none());
}

/// A merge runner used as a leaf of another merge must concatenate its own
/// leaves instead of reserving more buffers, letting the outer stage do the
/// only deduplication.
#[test]
fn test_nested_merge_runs_inner_stages_chained() {
    init_test_config();
    let a = TestLeaf::new(vec![row("a", 1), row("b", 2)]);
    let b = TestLeaf::new(vec![row("b", 3)]);
    let c = TestLeaf::new(vec![row("a", 5)]);
    let reservations = fresh_reservations(2, 65536, 4);
    let inner_one = Arc::new(GroupByMergeRunner::with_reservations(
        leaf_runners(&[Arc::clone(&a), Arc::clone(&b)]),
        Arc::clone(&reservations),
    ));
    let inner_two = Arc::new(GroupByMergeRunner::with_reservations(
        leaf_runners(&[Arc::clone(&c)]),
        Arc::clone(&reservations),
    ));
    let outer = GroupByMergeRunner::with_reservations(
        vec![inner_one as Arc<dyn QueryRunner>, inner_two as Arc<dyn QueryRunner>],
        Arc::clone(&reservations),
    );
    let query = hits_query(45);
    reservations
        .reserve(&query, &Deadline::unbounded())
        .expect("reserve");

    let rows = collect_sorted(outer.merge(&query));
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], row("a", 6));
    assert_eq!(rows[1], row("b", 5));
    for leaf in [&a, &b, &c] {
        assert_eq!(leaf.runs(), 1);
    }
    assert_eq!(reservations.buffer_pool().available(), 2);
    assert!(reservations.reserved_count(&query.resource_id).is_none());
}

/// Exercises the process-wide pools the way an embedder would, config and
/// all. Kept to a single test so nothing else contends for the global pool.
#[test]
fn test_global_pools_serve_a_merge_end_to_end() {
    init_test_config();
    let leaves = [
        TestLeaf::new(vec![row("g1", 10), row("g2", 20)]),
        TestLeaf::new(vec![row("g1", 1)]),
    ];
    let runner = GroupByMergeRunner::new(leaf_runners(&leaves));
    let query = hits_query(46);
    let reservations = reservation_pool();
    reservations
        .reserve(&query, &Deadline::unbounded())
        .expect("reserve");

    let rows = collect_sorted(runner.merge(&query));
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], row("g1", 11));
    assert_eq!(rows[1], row("g2", 20));

    let pool = reservations.buffer_pool();
    assert_eq!(pool.available(), pool.capacity());
    assert!(reservations.reserved_count(&query.resource_id).is_none());
}
