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

//! Combinable aggregate state over buffer-backed bytes.
//!
//! The merge engine never interprets aggregate values itself. Each
//! aggregator owns a fixed-width slice of a table bucket and folds partial
//! leaf values into it; `merge_value` must be associative and commutative
//! so the result is independent of row arrival order.

use std::sync::Arc;

use crate::exec::row::AggValue;

pub trait Aggregator: Send + Sync {
    fn name(&self) -> &str;
    fn state_bytes(&self) -> usize;
    fn init_state(&self, state: &mut [u8]);
    fn merge_value(&self, state: &mut [u8], value: &AggValue);
    fn read_state(&self, state: &[u8]) -> AggValue;
}

fn value_as_i64(value: &AggValue) -> i64 {
    match value {
        AggValue::Long(v) => *v,
        AggValue::Double(v) => *v as i64,
    }
}

fn value_as_f64(value: &AggValue) -> f64 {
    match value {
        AggValue::Long(v) => *v as f64,
        AggValue::Double(v) => *v,
    }
}

fn read_i64(state: &[u8]) -> i64 {
    i64::from_le_bytes(state[..8].try_into().unwrap())
}

fn write_i64(state: &mut [u8], v: i64) {
    state[..8].copy_from_slice(&v.to_le_bytes());
}

fn read_f64(state: &[u8]) -> f64 {
    f64::from_le_bytes(state[..8].try_into().unwrap())
}

fn write_f64(state: &mut [u8], v: f64) {
    state[..8].copy_from_slice(&v.to_le_bytes());
}

pub struct LongSumAggregator {
    name: String,
}

impl Aggregator for LongSumAggregator {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_bytes(&self) -> usize {
        8
    }

    fn init_state(&self, state: &mut [u8]) {
        write_i64(state, 0);
    }

    fn merge_value(&self, state: &mut [u8], value: &AggValue) {
        write_i64(state, read_i64(state).wrapping_add(value_as_i64(value)));
    }

    fn read_state(&self, state: &[u8]) -> AggValue {
        AggValue::Long(read_i64(state))
    }
}

pub struct DoubleSumAggregator {
    name: String,
}

impl Aggregator for DoubleSumAggregator {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_bytes(&self) -> usize {
        8
    }

    fn init_state(&self, state: &mut [u8]) {
        write_f64(state, 0.0);
    }

    fn merge_value(&self, state: &mut [u8], value: &AggValue) {
        write_f64(state, read_f64(state) + value_as_f64(value));
    }

    fn read_state(&self, state: &[u8]) -> AggValue {
        AggValue::Double(read_f64(state))
    }
}

pub struct LongMinAggregator {
    name: String,
}

impl Aggregator for LongMinAggregator {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_bytes(&self) -> usize {
        8
    }

    fn init_state(&self, state: &mut [u8]) {
        write_i64(state, i64::MAX);
    }

    fn merge_value(&self, state: &mut [u8], value: &AggValue) {
        write_i64(state, read_i64(state).min(value_as_i64(value)));
    }

    fn read_state(&self, state: &[u8]) -> AggValue {
        AggValue::Long(read_i64(state))
    }
}

pub struct LongMaxAggregator {
    name: String,
}

impl Aggregator for LongMaxAggregator {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_bytes(&self) -> usize {
        8
    }

    fn init_state(&self, state: &mut [u8]) {
        write_i64(state, i64::MIN);
    }

    fn merge_value(&self, state: &mut [u8], value: &AggValue) {
        write_i64(state, read_i64(state).max(value_as_i64(value)));
    }

    fn read_state(&self, state: &[u8]) -> AggValue {
        AggValue::Long(read_i64(state))
    }
}

pub fn long_sum(name: impl Into<String>) -> Arc<dyn Aggregator> {
    Arc::new(LongSumAggregator { name: name.into() })
}

pub fn double_sum(name: impl Into<String>) -> Arc<dyn Aggregator> {
    Arc::new(DoubleSumAggregator { name: name.into() })
}

/// Counts combine by summing partial counts, so the combining form of a
/// count is a long sum over the leaves' count columns.
pub fn count(name: impl Into<String>) -> Arc<dyn Aggregator> {
    long_sum(name)
}

pub fn long_min(name: impl Into<String>) -> Arc<dyn Aggregator> {
    Arc::new(LongMinAggregator { name: name.into() })
}

pub fn long_max(name: impl Into<String>) -> Arc<dyn Aggregator> {
    Arc::new(LongMaxAggregator { name: name.into() })
}

/// Byte offset of each aggregator's state within a concatenated slot, plus
/// the total slot width.
pub(crate) fn state_layout(aggregators: &[Arc<dyn Aggregator>]) -> (Vec<usize>, usize) {
    let mut offsets = Vec::with_capacity(aggregators.len());
    let mut width = 0;
    for agg in aggregators {
        offsets.push(width);
        width += agg.state_bytes();
    }
    (offsets, width)
}

/// Folds `other` into `into` column by column through fresh per-aggregator
/// scratch states.
pub(crate) fn combine_values(
    aggregators: &[Arc<dyn Aggregator>],
    into: &mut [AggValue],
    other: &[AggValue],
) {
    for (agg, (acc, value)) in aggregators.iter().zip(into.iter_mut().zip(other.iter())) {
        let mut state = vec![0u8; agg.state_bytes()];
        agg.init_state(&mut state);
        agg.merge_value(&mut state, acc);
        agg.merge_value(&mut state, value);
        *acc = agg.read_state(&state);
    }
}
