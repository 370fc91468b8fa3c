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
use std::sync::Arc;

use crate::common::error::MergeError;
use crate::common::types::Deadline;
use crate::exec::query::GroupByQuery;
use crate::exec::row::{QueryRunner, ResultRow, RowStream};
use crate::runtime::task_pool::processing_pool;
use crate::runtime::watcher::query_watcher;

/// Concatenating fan-out: runs every leaf as a prioritized work unit and
/// splices their materialized rows together in submission order. No merge
/// buffers, no deduplication. Serves by-segment queries and the inner stages
/// of nested merges.
pub struct ChainedRunner {
    runners: Vec<Arc<dyn QueryRunner>>,
}

impl ChainedRunner {
    pub fn new(runners: Vec<Arc<dyn QueryRunner>>) -> Self {
        Self { runners }
    }
}

impl QueryRunner for ChainedRunner {
    fn run(&self, query: &GroupByQuery) -> Result<RowStream, MergeError> {
        Ok(Box::new(ChainedRows {
            runners: self.runners.clone(),
            query: query.clone(),
            state: ChainedState::Pending,
        }))
    }
}

enum ChainedState {
    Pending,
    Streaming(Box<dyn Iterator<Item = ResultRow> + Send>),
    Done,
}

/// Lazy output: leaves are not contacted until the first row is pulled.
struct ChainedRows {
    runners: Vec<Arc<dyn QueryRunner>>,
    query: GroupByQuery,
    state: ChainedState,
}

impl Drop for ChainedRows {
    fn drop(&mut self) {
        // A nested stage shares its query id with the outer merge, whose
        // cleanup owns the watcher entry. Only the outermost stage drops it.
        if !self.query.chained_merge {
            query_watcher().unregister(&self.query.id);
        }
    }
}

impl Iterator for ChainedRows {
    type Item = Result<ResultRow, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.state {
                ChainedState::Pending => match dispatch(&self.runners, &self.query) {
                    Ok(stream) => self.state = ChainedState::Streaming(stream),
                    Err(err) => {
                        self.state = ChainedState::Done;
                        return Some(Err(err));
                    }
                },
                ChainedState::Streaming(rows) => match rows.next() {
                    Some(row) => return Some(Ok(row)),
                    None => {
                        self.state = ChainedState::Done;
                        return None;
                    }
                },
                ChainedState::Done => return None,
            }
        }
    }
}

fn dispatch(
    runners: &[Arc<dyn QueryRunner>],
    query: &GroupByQuery,
) -> Result<Box<dyn Iterator<Item = ResultRow> + Send>, MergeError> {
    let deadline = Deadline::from_timeout(query.effective_timeout());
    if deadline.expired() {
        return Err(MergeError::timeout("query deadline passed before dispatch"));
    }
    let pool = processing_pool();
    let mut futures = Vec::with_capacity(runners.len());
    for runner in runners {
        let runner = Arc::clone(runner);
        let leaf_query = query.clone();
        futures.push(pool.submit(query.priority, move |ctx| {
            let stream = runner.run(&leaf_query)?;
            let mut rows = Vec::new();
            for row in stream {
                ctx.check_cancelled()?;
                rows.push(row?);
            }
            Ok(rows)
        }));
    }
    let handles: Vec<_> = futures.iter().map(|f| f.handle()).collect();
    let watcher = query_watcher();
    watcher.register(query.id, &handles);

    let mut chunks = Vec::with_capacity(futures.len());
    for future in &futures {
        match future.wait(&deadline) {
            Ok(rows) => chunks.push(rows),
            Err(err) => {
                for handle in &handles {
                    handle.cancel(&err.message);
                }
                return Err(err);
            }
        }
    }
    Ok(Box::new(chunks.into_iter().flatten()))
}
