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
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::common::config;
use crate::common::types::{QueryId, ResourceId};
use crate::exec::aggregator::Aggregator;
use crate::exec::row::DimType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionSpec {
    pub name: String,
    pub value_type: DimType,
}

impl DimensionSpec {
    pub fn new(name: impl Into<String>, value_type: DimType) -> Self {
        Self {
            name: name.into(),
            value_type,
        }
    }
}

/// Immutable description of one group-by. The merge engine only reads it;
/// leaf runners receive a copy with `chained_merge` forced on so a nested
/// merge stage concatenates instead of reserving buffers again.
#[derive(Clone)]
pub struct GroupByQuery {
    pub id: QueryId,
    pub resource_id: ResourceId,
    pub dimensions: Vec<DimensionSpec>,
    pub aggregators: Vec<Arc<dyn Aggregator>>,
    pub priority: i32,
    pub timeout: Option<Duration>,
    pub single_threaded: bool,
    pub parallel_combine_threads: usize,
    pub max_spill_bytes: Option<u64>,
    pub sort_by_key: bool,
    pub by_segment: bool,
    pub chained_merge: bool,
    pub subquery: Option<Box<GroupByQuery>>,
    pub subtotal_specs: Option<Vec<Vec<String>>>,
}

impl GroupByQuery {
    pub fn new(
        id: QueryId,
        dimensions: Vec<DimensionSpec>,
        aggregators: Vec<Arc<dyn Aggregator>>,
    ) -> Self {
        Self {
            resource_id: ResourceId::new(id.to_string()),
            id,
            dimensions,
            aggregators,
            priority: 0,
            timeout: None,
            single_threaded: false,
            parallel_combine_threads: 1,
            max_spill_bytes: None,
            sort_by_key: false,
            by_segment: false,
            chained_merge: false,
            subquery: None,
            subtotal_specs: None,
        }
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<ResourceId>) -> Self {
        self.resource_id = resource_id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_single_threaded(mut self, single_threaded: bool) -> Self {
        self.single_threaded = single_threaded;
        self
    }

    pub fn with_parallel_combine_threads(mut self, threads: usize) -> Self {
        self.parallel_combine_threads = threads;
        self
    }

    pub fn with_max_spill_bytes(mut self, bytes: u64) -> Self {
        self.max_spill_bytes = Some(bytes);
        self
    }

    pub fn with_sort_by_key(mut self, sort_by_key: bool) -> Self {
        self.sort_by_key = sort_by_key;
        self
    }

    pub fn with_by_segment(mut self, by_segment: bool) -> Self {
        self.by_segment = by_segment;
        self
    }

    pub fn with_subquery(mut self, subquery: GroupByQuery) -> Self {
        self.subquery = Some(Box::new(subquery));
        self
    }

    pub fn with_subtotal_specs(mut self, specs: Vec<Vec<String>>) -> Self {
        self.subtotal_specs = Some(specs);
        self
    }

    /// Copy handed to leaf runners so an inner merge stage never reserves
    /// merge buffers of its own.
    pub fn for_chained_execution(&self) -> Self {
        let mut query = self.clone();
        query.chained_merge = true;
        query
    }

    pub fn dimension_names(&self) -> Vec<&str> {
        self.dimensions.iter().map(|d| d.name.as_str()).collect()
    }

    /// Subquery nesting depth below this query, capped at two. Deeper
    /// nesting needs no more auxiliary buffers than a double nesting.
    pub fn nesting_depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.subquery.as_deref();
        while let Some(q) = current {
            depth += 1;
            if depth == 2 {
                break;
            }
            current = q.subquery.as_deref();
        }
        depth
    }

    /// Per-query timeout, falling back to the configured default.
    /// A configured default of zero means unbounded.
    pub fn effective_timeout(&self) -> Option<Duration> {
        match self.timeout {
            Some(t) => Some(t),
            None => {
                let ms = config::default_timeout_ms();
                (ms > 0).then(|| Duration::from_millis(ms))
            }
        }
    }

    /// Disk quota for spill runs; the configured quota applies when the
    /// query carries no override. Zero disables spilling.
    pub fn effective_max_spill_bytes(&self) -> u64 {
        self.max_spill_bytes
            .unwrap_or_else(config::max_spill_bytes)
    }
}

impl fmt::Debug for GroupByQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupByQuery")
            .field("id", &self.id.to_string())
            .field("resource_id", &self.resource_id)
            .field("dimensions", &self.dimensions)
            .field(
                "aggregators",
                &self
                    .aggregators
                    .iter()
                    .map(|a| a.name().to_string())
                    .collect::<Vec<_>>(),
            )
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("single_threaded", &self.single_threaded)
            .field("parallel_combine_threads", &self.parallel_combine_threads)
            .field("by_segment", &self.by_segment)
            .field("chained_merge", &self.chained_merge)
            .field("nesting_depth", &self.nesting_depth())
            .finish()
    }
}
