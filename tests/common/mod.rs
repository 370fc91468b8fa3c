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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tempfile::TempDir;

use rowfold::{
    AggValue, BlockingBufferPool, DimType, DimValue, DimensionSpec, GroupByQuery, MergeError,
    MergeStatsRegistry, MergedRows, QueryId, QueryRunner, ReservationPool, ResultRow, RowStream,
    long_sum, rowfold_config,
};

struct TestEnv {
    _dir: TempDir,
    config_path: PathBuf,
}

static TEST_ENV: OnceLock<TestEnv> = OnceLock::new();

/// Loads a process-wide test config that points spill scratch space into a
/// temporary directory and keeps the global pools small. Every test calls
/// this before touching the engine.
pub fn init_test_config() {
    let env = TEST_ENV.get_or_init(|| {
        let dir = tempfile::tempdir().expect("create test scratch dir");
        let config_path = dir.path().join("rowfold.toml");
        let config_content = format!(
            r#"
log_level = "warn"

[merge]
exec_threads = 4
buffer_count = 4
buffer_bytes = 65536
default_timeout_ms = 30000
spill_dir = "{}"
"#,
            dir.path().join("spill").display()
        );
        std::fs::write(&config_path, config_content).expect("write test config");
        TestEnv {
            _dir: dir,
            config_path,
        }
    });
    rowfold_config::init_from_path(&env.config_path).expect("load test config");
}

/// Leaf runner yielding a fixed row set, with optional per-row latency and
/// failure injection. Counts how many rows the merge actually pulled so
/// tests can observe early cancellation.
pub struct TestLeaf {
    rows: Vec<ResultRow>,
    row_delay: Duration,
    run_error: Option<String>,
    runs: AtomicUsize,
    consumed: Arc<AtomicUsize>,
}

impl TestLeaf {
    pub fn new(rows: Vec<ResultRow>) -> Arc<Self> {
        Self::slow(rows, Duration::ZERO)
    }

    pub fn slow(rows: Vec<ResultRow>, row_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            rows,
            row_delay,
            run_error: None,
            runs: AtomicUsize::new(0),
            consumed: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            rows: Vec::new(),
            row_delay: Duration::ZERO,
            run_error: Some(message.to_string()),
            runs: AtomicUsize::new(0),
            consumed: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::Acquire)
    }

    pub fn consumed(&self) -> usize {
        self.consumed.load(Ordering::Acquire)
    }
}

impl QueryRunner for TestLeaf {
    fn run(&self, _query: &GroupByQuery) -> Result<RowStream, MergeError> {
        self.runs.fetch_add(1, Ordering::AcqRel);
        if let Some(message) = &self.run_error {
            return Err(MergeError::runtime(message.clone()));
        }
        let consumed = Arc::clone(&self.consumed);
        let delay = self.row_delay;
        Ok(Box::new(self.rows.clone().into_iter().map(move |row| {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            consumed.fetch_add(1, Ordering::AcqRel);
            Ok(row)
        })))
    }
}

pub fn leaf_runners(leaves: &[Arc<TestLeaf>]) -> Vec<Arc<dyn QueryRunner>> {
    leaves
        .iter()
        .map(|leaf| Arc::clone(leaf) as Arc<dyn QueryRunner>)
        .collect()
}

pub fn row(label: &str, hits: i64) -> ResultRow {
    ResultRow::new(
        vec![DimValue::String(label.to_string())],
        vec![AggValue::Long(hits)],
    )
}

/// One-string-dimension, long-sum query with a unique id per `lo`.
pub fn hits_query(lo: i64) -> GroupByQuery {
    GroupByQuery::new(
        QueryId::new(7, lo),
        vec![DimensionSpec::new("label", DimType::String)],
        vec![long_sum("hits")],
    )
}

/// Reservation pool over a private buffer pool so tests stay isolated from
/// the process-wide one.
pub fn fresh_reservations(
    buffer_count: usize,
    buffer_bytes: usize,
    regions_per_buffer: usize,
) -> Arc<ReservationPool> {
    Arc::new(ReservationPool::new(
        Arc::new(BlockingBufferPool::new(
            buffer_count,
            buffer_bytes,
            regions_per_buffer,
        )),
        Arc::new(MergeStatsRegistry::new()),
    ))
}

pub fn collect_sorted(merged: MergedRows) -> Vec<ResultRow> {
    let mut rows: Vec<ResultRow> = merged.collect::<Result<_, _>>().expect("merged rows");
    rows.sort_by(|a, b| a.dims.cmp(&b.dims));
    rows
}

/// Polls until the pool shows every buffer back, tolerating stragglers that
/// only notice cancellation when they next touch the grouper.
pub fn await_pool_restored(reservations: &ReservationPool, timeout: Duration) {
    let deadline = std::time::Instant::now() + timeout;
    let pool = reservations.buffer_pool();
    while pool.available() < pool.capacity() {
        assert!(
            std::time::Instant::now() < deadline,
            "merge buffers were not returned: {}/{} available",
            pool.available(),
            pool.capacity()
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}
