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
//! Priority worker pool for merge work units.
//!
//! Responsibilities:
//! - Runs submitted work units across a fixed set of worker threads, highest
//!   priority first and FIFO within a priority.
//! - Tracks per-unit completion with deadline-bounded waits and cooperative
//!   cancellation; worker panics surface as runtime errors.
//!
//! Key exported interfaces:
//! - Types: `ProcessingPool`, `TaskFuture`, `TaskHandle`, `TaskContext`.
//! - Functions: `processing_pool`.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread;

use crate::common::config;
use crate::common::error::MergeError;
use crate::common::types::Deadline;

/// Handed to every running work unit so it can observe cancellation at its
/// own row-batch granularity.
pub struct TaskContext {
    cancelled: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn check_cancelled(&self) -> Result<(), MergeError> {
        if self.is_cancelled() {
            Err(MergeError::interrupted("merge work unit cancelled"))
        } else {
            Ok(())
        }
    }
}

trait CompleteErased: Send + Sync {
    fn complete_error(&self, err: MergeError);
}

struct FutureShared<T> {
    mu: Mutex<Option<Result<T, MergeError>>>,
    cv: Condvar,
}

impl<T> FutureShared<T> {
    fn new() -> Self {
        Self {
            mu: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    /// First completion wins; a late result from a cancelled unit is dropped.
    fn complete_with(&self, result: Result<T, MergeError>) {
        let mut guard = self.mu.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(result);
            self.cv.notify_all();
        }
    }
}

impl<T: Send> CompleteErased for FutureShared<T> {
    fn complete_error(&self, err: MergeError) {
        self.complete_with(Err(err));
    }
}

/// Cancellation-only view of a submitted unit, registrable with a watcher.
#[derive(Clone)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
    erased: Arc<dyn CompleteErased>,
}

impl TaskHandle {
    pub fn cancel(&self, message: &str) {
        self.cancelled.store(true, Ordering::Release);
        self.erased.complete_error(MergeError::interrupted(message));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn downgrade(&self) -> WeakTaskHandle {
        WeakTaskHandle {
            cancelled: Arc::downgrade(&self.cancelled),
            erased: Arc::downgrade(&self.erased),
        }
    }
}

/// Weak form of `TaskHandle` kept in watcher registries so a finished unit
/// can be reclaimed without unregistration.
#[derive(Clone)]
pub struct WeakTaskHandle {
    cancelled: Weak<AtomicBool>,
    erased: Weak<dyn CompleteErased>,
}

impl WeakTaskHandle {
    pub fn upgrade(&self) -> Option<TaskHandle> {
        Some(TaskHandle {
            cancelled: self.cancelled.upgrade()?,
            erased: self.erased.upgrade()?,
        })
    }
}

pub struct TaskFuture<T> {
    shared: Arc<FutureShared<T>>,
    cancelled: Arc<AtomicBool>,
}

impl<T: Send + 'static> TaskFuture<T> {
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            cancelled: Arc::clone(&self.cancelled),
            erased: Arc::clone(&self.shared) as Arc<dyn CompleteErased>,
        }
    }

    pub fn cancel(&self, message: &str) {
        self.handle().cancel(message);
    }

    /// Block until the unit completes or the deadline expires. The result is
    /// taken out; a unit cancelled mid-run completes as `Interrupted` while
    /// the worker keeps draining it cooperatively in the background.
    pub fn wait(&self, deadline: &Deadline) -> Result<T, MergeError> {
        let mut guard = self.shared.mu.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            if deadline.expired() {
                return Err(MergeError::timeout(
                    "timed out waiting for merge work unit",
                ));
            }
            // A timed-out wait falls through to the expiry check above.
            guard = match deadline.remaining() {
                Some(remaining) => {
                    self.shared
                        .cv
                        .wait_timeout(guard, remaining)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
                None => self
                    .shared
                    .cv
                    .wait(guard)
                    .unwrap_or_else(|e| e.into_inner()),
            };
        }
    }
}

struct QueuedTask {
    priority: i32,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    erased: Arc<dyn CompleteErased>,
    job: Box<dyn FnOnce(&TaskContext) + Send>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: highest priority first, then submission order.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct PoolShared {
    queue: Mutex<BinaryHeap<QueuedTask>>,
    cv: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
}

pub struct ProcessingPool {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ProcessingPool {
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(BinaryHeap::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let shared_cloned = Arc::clone(&shared);
            workers.push(thread::spawn(move || worker_loop(shared_cloned)));
        }

        Self { shared, workers }
    }

    pub fn submit<T, F>(&self, priority: i32, f: F) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T, MergeError> + Send + 'static,
    {
        let shared = Arc::new(FutureShared::new());
        let cancelled = Arc::new(AtomicBool::new(false));

        let completion = Arc::clone(&shared);
        let job = Box::new(move |ctx: &TaskContext| {
            let result = f(ctx);
            completion.complete_with(result);
        });

        let task = QueuedTask {
            priority,
            seq: self.shared.seq.fetch_add(1, Ordering::AcqRel),
            cancelled: Arc::clone(&cancelled),
            erased: Arc::clone(&shared) as Arc<dyn CompleteErased>,
            job,
        };

        let mut queue = self.shared.queue.lock().expect("processing pool lock");
        queue.push(task);
        drop(queue);
        self.shared.cv.notify_one();

        TaskFuture { shared, cancelled }
    }
}

impl Drop for ProcessingPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cv.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().expect("processing pool lock");
            while queue.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                queue = shared.cv.wait(queue).expect("processing pool condvar wait");
            }
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            queue.pop()
        };

        let Some(task) = task else {
            continue;
        };

        // Units cancelled while still queued are dropped unrun; dropping the
        // job releases whatever resources it captured.
        if task.cancelled.load(Ordering::Acquire) {
            task.erased.complete_error(MergeError::interrupted(
                "merge work unit cancelled before start",
            ));
            continue;
        }

        let ctx = TaskContext {
            cancelled: Arc::clone(&task.cancelled),
        };
        let job = task.job;
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job(&ctx)));
        if let Err(payload) = outcome {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            };
            task.erased
                .complete_error(MergeError::runtime(format!("panic in merge work unit: {msg}")));
        }
    }
}

static PROCESSING_POOL: OnceLock<ProcessingPool> = OnceLock::new();

/// Process-wide merge worker pool, sized from config on first use.
pub fn processing_pool() -> &'static ProcessingPool {
    PROCESSING_POOL.get_or_init(|| ProcessingPool::new(config::exec_threads()))
}
