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
use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::common::error::MergeError;
use crate::common::hash::{canonical_f64_bits, combine_hash, hash_bytes_with_seed, mix_u64};
use crate::exec::query::GroupByQuery;

/// Value type of one grouping dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimType {
    String,
    Long,
    Double,
}

/// One grouping dimension value. Doubles compare and hash through their
/// canonical bit pattern so NaNs form a single group and -0.0 joins 0.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DimValue {
    Null,
    String(String),
    Long(i64),
    Double(#[serde(with = "f64_bits")] f64),
}

impl DimValue {
    fn variant_rank(&self) -> u8 {
        match self {
            DimValue::Null => 0,
            DimValue::Long(_) => 1,
            DimValue::Double(_) => 2,
            DimValue::String(_) => 3,
        }
    }

    pub fn hash_with_seed(&self, seed: u64) -> u64 {
        match self {
            DimValue::Null => hash_bytes_with_seed(b"n", seed),
            DimValue::Long(v) => {
                hash_bytes_with_seed(&v.to_le_bytes(), hash_bytes_with_seed(b"l", seed))
            }
            DimValue::Double(v) => hash_bytes_with_seed(
                &canonical_f64_bits(*v).to_le_bytes(),
                hash_bytes_with_seed(b"d", seed),
            ),
            DimValue::String(s) => {
                hash_bytes_with_seed(s.as_bytes(), hash_bytes_with_seed(b"s", seed))
            }
        }
    }
}

impl PartialEq for DimValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DimValue {}

impl Ord for DimValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (DimValue::Null, DimValue::Null) => Ordering::Equal,
            (DimValue::Long(a), DimValue::Long(b)) => a.cmp(b),
            (DimValue::Double(a), DimValue::Double(b)) => f64::from_bits(canonical_f64_bits(*a))
                .total_cmp(&f64::from_bits(canonical_f64_bits(*b))),
            (DimValue::String(a), DimValue::String(b)) => a.cmp(b),
            _ => self.variant_rank().cmp(&other.variant_rank()),
        }
    }
}

impl PartialOrd for DimValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::hash::Hash for DimValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u8(self.variant_rank());
        match self {
            DimValue::Null => {}
            DimValue::Long(v) => state.write_i64(*v),
            DimValue::Double(v) => state.write_u64(canonical_f64_bits(*v)),
            DimValue::String(s) => state.write(s.as_bytes()),
        }
    }
}

/// One aggregate value, partial or final depending on context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggValue {
    Long(i64),
    Double(#[serde(with = "f64_bits")] f64),
}

/// A grouped row: leaf rows carry partial aggregate values, merged output
/// rows carry fully combined ones. The shape is identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub dims: Vec<DimValue>,
    pub aggs: Vec<AggValue>,
}

impl ResultRow {
    pub fn new(dims: Vec<DimValue>, aggs: Vec<AggValue>) -> Self {
        Self { dims, aggs }
    }
}

/// Seeded hash over a full dimension tuple, mixed for shard selection.
pub fn hash_dims_with_seed(dims: &[DimValue], seed: u64) -> u64 {
    let mut h = seed;
    for dim in dims {
        h = combine_hash(h, dim.hash_with_seed(seed));
    }
    mix_u64(h)
}

pub type RowStream = Box<dyn Iterator<Item = Result<ResultRow, MergeError>> + Send>;

/// Produces one leaf result stream per invocation. Implementations wrap the
/// per-segment engines, the network layer, or (in tests) canned rows.
pub trait QueryRunner: Send + Sync {
    fn run(&self, query: &GroupByQuery) -> Result<RowStream, MergeError>;
}

/// Spill runs keep NaN and infinity intact by writing the raw bit pattern.
mod f64_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.to_bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(f64::from_bits(u64::deserialize(deserializer)?))
    }
}
