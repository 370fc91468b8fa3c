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
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::common::error::MergeError;

/// A resource that can be released exactly once through a shared reference.
/// Implementations must tolerate calls into the resource after close by
/// failing gracefully rather than panicking.
pub trait ResourceClose: Send + Sync {
    fn close_resource(&self);
}

impl<T: ResourceClose + ?Sized> ResourceClose for std::sync::Arc<T> {
    fn close_resource(&self) {
        (**self).close_resource();
    }
}

struct HolderInner<T: ResourceClose> {
    resource: T,
    refs: AtomicUsize,
}

impl<T: ResourceClose> HolderInner<T> {
    fn release_one(&self) {
        // Only the thread that takes the count from 1 to 0 closes.
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.resource.close_resource();
        }
    }
}

/// Reference-counted owner of a closeable resource.
///
/// The holder itself counts as one reference; `increment()` hands out
/// additional tokens. The resource closes exactly once, when the last of
/// the holder and its tokens is released. No operation blocks.
pub struct ResourceHolder<T: ResourceClose> {
    inner: Arc<HolderInner<T>>,
    released: AtomicBool,
}

impl<T: ResourceClose> ResourceHolder<T> {
    pub fn new(resource: T) -> Self {
        Self {
            inner: Arc::new(HolderInner {
                resource,
                refs: AtomicUsize::new(1),
            }),
            released: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> &T {
        &self.inner.resource
    }

    /// Take an additional reference. Fails once the count has reached zero;
    /// a released resource never comes back.
    pub fn increment(&self) -> Result<ResourceToken<T>, MergeError> {
        let mut current = self.inner.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(MergeError::defensive(
                    "increment on a fully released resource holder",
                ));
            }
            match self.inner.refs.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Ok(ResourceToken {
            inner: Arc::clone(&self.inner),
            released: AtomicBool::new(false),
        })
    }

    /// Release the holder's own reference. Idempotent.
    pub fn close(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.inner.release_one();
        }
    }
}

impl<T: ResourceClose> Drop for ResourceHolder<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// One reference handed out by `ResourceHolder::increment`. Releasing twice
/// is a no-op; dropping releases.
pub struct ResourceToken<T: ResourceClose> {
    inner: Arc<HolderInner<T>>,
    released: AtomicBool,
}

impl<T: ResourceClose> ResourceToken<T> {
    pub fn get(&self) -> &T {
        &self.inner.resource
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.inner.release_one();
        }
    }
}

impl<T: ResourceClose> Drop for ResourceToken<T> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingResource {
        closes: Arc<AtomicUsize>,
    }

    impl ResourceClose for CountingResource {
        fn close_resource(&self) {
            self.closes.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn counting_holder() -> (ResourceHolder<CountingResource>, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let holder = ResourceHolder::new(CountingResource {
            closes: Arc::clone(&closes),
        });
        (holder, closes)
    }

    #[test]
    fn closes_exactly_once_under_concurrent_tokens() {
        let (holder, closes) = counting_holder();
        let holder = Arc::new(holder);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let holder = Arc::clone(&holder);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let token = holder.increment().expect("increment");
                    token.release();
                }
            }));
        }
        for h in handles {
            h.join().expect("join");
        }

        assert_eq!(closes.load(Ordering::Acquire), 0);
        holder.close();
        assert_eq!(closes.load(Ordering::Acquire), 1);
        holder.close();
        assert_eq!(closes.load(Ordering::Acquire), 1);
    }

    #[test]
    fn token_double_release_is_noop() {
        let (holder, closes) = counting_holder();
        let token = holder.increment().expect("increment");
        token.release();
        token.release();
        assert_eq!(closes.load(Ordering::Acquire), 0);
        holder.close();
        assert_eq!(closes.load(Ordering::Acquire), 1);
    }

    #[test]
    fn increment_after_full_release_fails() {
        let (holder, closes) = counting_holder();
        holder.close();
        assert_eq!(closes.load(Ordering::Acquire), 1);
        assert!(holder.increment().is_err());
    }

    #[test]
    fn outstanding_token_defers_close_until_dropped() {
        let (holder, closes) = counting_holder();
        let token = holder.increment().expect("increment");
        holder.close();
        assert_eq!(closes.load(Ordering::Acquire), 0);
        drop(token);
        assert_eq!(closes.load(Ordering::Acquire), 1);
    }
}
