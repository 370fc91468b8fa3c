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
pub mod common;
pub mod exec;
pub mod runtime;

// Flat aliases so embedders reach the merge engine without the folder layout.
pub use common::config as rowfold_config;
pub use common::logging as rowfold_logging;

pub use common::error::{MergeError, MergeErrorKind};
pub use common::types::{Deadline, QueryId, ResourceId};
pub use exec::aggregator::{Aggregator, count, double_sum, long_max, long_min, long_sum};
pub use exec::chained::ChainedRunner;
pub use exec::grouper::AccumulateResult;
pub use exec::merge_runner::{GroupByMergeRunner, MergedRows};
pub use exec::query::{DimensionSpec, GroupByQuery};
pub use exec::row::{AggValue, DimType, DimValue, QueryRunner, ResultRow, RowStream};
pub use runtime::buffer_pool::{BlockingBufferPool, MergeBufferHandle};
pub use runtime::reservation::{
    ReservationPool, required_merge_buffers, reservation_pool, runner_buffer_count,
};
pub use runtime::stats::{MergeStatsRegistry, PerQueryStats, StatsSnapshot, merge_stats_registry};
pub use runtime::task_pool::{
    ProcessingPool, TaskContext, TaskFuture, TaskHandle, processing_pool,
};
pub use runtime::watcher::{QueryWatcher, query_watcher};
