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
use std::sync::{Arc, Mutex, OnceLock};

use crate::common::logging::info;
use crate::common::types::QueryId;
use crate::runtime::task_pool::{TaskHandle, WeakTaskHandle};

/// Registry of in-flight merge work units by query id, so an external
/// caller can cancel a whole query without holding its futures.
pub struct QueryWatcher {
    queries: Mutex<HashMap<QueryId, Vec<WeakTaskHandle>>>,
}

impl QueryWatcher {
    pub fn new() -> Self {
        Self {
            queries: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, query_id: QueryId, handles: &[TaskHandle]) {
        let mut queries = self.queries.lock().expect("watcher lock");
        let entry = queries.entry(query_id).or_default();
        entry.retain(|weak| weak.upgrade().is_some());
        entry.extend(handles.iter().map(TaskHandle::downgrade));
    }

    pub fn unregister(&self, query_id: &QueryId) {
        let mut queries = self.queries.lock().expect("watcher lock");
        queries.remove(query_id);
    }

    /// Cancel every live unit registered under the id. Returns how many
    /// units observed the cancellation.
    pub fn cancel_query(&self, query_id: &QueryId, message: &str) -> usize {
        let upgraded: Vec<TaskHandle> = {
            let mut queries = self.queries.lock().expect("watcher lock");
            match queries.remove(query_id) {
                Some(weak_handles) => weak_handles
                    .iter()
                    .filter_map(WeakTaskHandle::upgrade)
                    .collect(),
                None => Vec::new(),
            }
        };

        // Cancellation runs outside the registry lock.
        for handle in &upgraded {
            handle.cancel(message);
        }
        if !upgraded.is_empty() {
            info!(
                "cancelled {} merge work units for query {}",
                upgraded.len(),
                query_id
            );
        }
        upgraded.len()
    }
}

impl Default for QueryWatcher {
    fn default() -> Self {
        Self::new()
    }
}

static QUERY_WATCHER: OnceLock<Arc<QueryWatcher>> = OnceLock::new();

pub fn query_watcher() -> Arc<QueryWatcher> {
    Arc::clone(QUERY_WATCHER.get_or_init(|| Arc::new(QueryWatcher::new())))
}
