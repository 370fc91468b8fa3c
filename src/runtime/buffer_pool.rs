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

//! Process-wide pool of fixed-size merge buffers.
//!
//! Every buffer is allocated at pool construction and never reallocated.
//! A buffer is physically a set of equal byte regions (one per exec thread)
//! so a sharded grouper can hand each shard its own region without copying.
//! Checkout blocks until a buffer is available or the caller's deadline
//! expires; a dropped handle returns the buffer to the pool.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use crate::common::config;
use crate::common::error::MergeError;
use crate::common::logging::error;
use crate::common::types::Deadline;

#[derive(Debug)]
struct PoolShared {
    mu: Mutex<VecDeque<Vec<Vec<u8>>>>,
    cv: Condvar,
    capacity: usize,
    region_count: usize,
    region_len: usize,
}

pub struct BlockingBufferPool {
    shared: Arc<PoolShared>,
}

impl BlockingBufferPool {
    pub fn new(buffer_count: usize, buffer_bytes: usize, regions_per_buffer: usize) -> Self {
        let region_count = regions_per_buffer.max(1);
        let region_len = buffer_bytes / region_count;
        let mut buffers = VecDeque::with_capacity(buffer_count);
        for _ in 0..buffer_count {
            let regions = (0..region_count).map(|_| vec![0u8; region_len]).collect();
            buffers.push_back(regions);
        }
        Self {
            shared: Arc::new(PoolShared {
                mu: Mutex::new(buffers),
                cv: Condvar::new(),
                capacity: buffer_count,
                region_count,
                region_len,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn region_count(&self) -> usize {
        self.shared.region_count
    }

    pub fn region_len(&self) -> usize {
        self.shared.region_len
    }

    /// Buffers currently checked in. Observable for callers that want to
    /// size a query against free capacity.
    pub fn available(&self) -> usize {
        self.shared.mu.lock().expect("pool lock").len()
    }

    pub fn take(&self, deadline: &Deadline) -> Result<MergeBufferHandle, MergeError> {
        let mut batch = self.take_batch(1, deadline)?;
        Ok(batch.pop().expect("non-empty batch"))
    }

    /// Take `count` buffers, all of them or none of them. Blocks until the
    /// pool can satisfy the whole batch or the deadline expires.
    pub fn take_batch(
        &self,
        count: usize,
        deadline: &Deadline,
    ) -> Result<Vec<MergeBufferHandle>, MergeError> {
        if count > self.shared.capacity {
            return Err(MergeError::resource_exhausted(format!(
                "query needs {} merge buffers, but only {} are configured",
                count, self.shared.capacity
            )));
        }

        let mut guard = self.shared.mu.lock().expect("pool lock");
        loop {
            if guard.len() >= count {
                let handles = (0..count)
                    .map(|_| MergeBufferHandle {
                        regions: Some(guard.pop_front().expect("buffer available")),
                        shared: Arc::clone(&self.shared),
                    })
                    .collect();
                return Ok(handles);
            }

            if deadline.expired() {
                return Err(MergeError::resource_exhausted(format!(
                    "timed out waiting for {} merge buffers ({} available)",
                    count,
                    guard.len()
                )));
            }
            // A timed-out wait falls through to the expiry check above.
            guard = match deadline.remaining() {
                Some(remaining) => {
                    self.shared
                        .cv
                        .wait_timeout(guard, remaining)
                        .expect("pool wait")
                        .0
                }
                None => self.shared.cv.wait(guard).expect("pool wait"),
            };
        }
    }
}

/// One checked-out merge buffer. The region slab can be taken out for the
/// lifetime of a grouper and must be restored before the handle drops.
#[derive(Debug)]
pub struct MergeBufferHandle {
    regions: Option<Vec<Vec<u8>>>,
    shared: Arc<PoolShared>,
}

impl MergeBufferHandle {
    pub fn region_count(&self) -> usize {
        self.shared.region_count
    }

    pub fn region_len(&self) -> usize {
        self.shared.region_len
    }

    pub fn take_regions(&mut self) -> Result<Vec<Vec<u8>>, MergeError> {
        self.regions
            .take()
            .ok_or_else(|| MergeError::defensive("merge buffer regions already taken"))
    }

    pub fn restore_regions(&mut self, regions: Vec<Vec<u8>>) {
        self.regions = Some(regions);
    }
}

impl Drop for MergeBufferHandle {
    fn drop(&mut self) {
        match self.regions.take() {
            Some(regions) => {
                let mut guard = self.shared.mu.lock().expect("pool lock");
                guard.push_back(regions);
                self.shared.cv.notify_all();
            }
            None => {
                error!(
                    "merge buffer dropped without its regions restored; pool capacity reduced"
                );
            }
        }
    }
}

static MERGE_BUFFER_POOL: OnceLock<Arc<BlockingBufferPool>> = OnceLock::new();

/// Global merge buffer pool, sized from config on first use.
pub fn merge_buffer_pool() -> Arc<BlockingBufferPool> {
    Arc::clone(MERGE_BUFFER_POOL.get_or_init(|| {
        Arc::new(BlockingBufferPool::new(
            config::merge_buffer_count(),
            config::merge_buffer_bytes(),
            config::exec_threads(),
        ))
    }))
}
