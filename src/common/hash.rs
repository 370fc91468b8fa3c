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

//! Hash helpers shared by the grouping tables.
//!
//! Shard selection and bucket probing must not correlate, so shard hashes go
//! through `mix_u64` with a distinct seed while bucket hashes use plain FNV
//! over the encoded key bytes.

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

pub const SHARD_SEED: u64 = 0x9e3779b97f4a7c15;

#[inline]
pub fn combine_hash(seed: u64, value: u64) -> u64 {
    seed ^ (value
        .wrapping_add(0x9e3779b97f4a7c15)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2))
}

#[inline]
pub fn hash_bytes_with_seed(bytes: &[u8], seed: u64) -> u64 {
    let mut hash = seed ^ FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[inline]
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    hash_bytes_with_seed(bytes, 0)
}

#[inline]
pub fn hash_u64_with_seed(value: u64, seed: u64) -> u64 {
    hash_bytes_with_seed(&value.to_le_bytes(), seed)
}

/// Canonical bit pattern for floating point grouping keys. All NaNs collapse
/// to one key and -0.0 groups with 0.0.
#[inline]
pub fn canonical_f64_bits(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else if value == 0.0 {
        0.0f64.to_bits()
    } else {
        value.to_bits()
    }
}

/// splitmix64 finalizer.
#[inline]
pub fn mix_u64(mut value: u64) -> u64 {
    value = (value ^ (value >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94d049bb133111eb);
    value ^ (value >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_matches_reference_vector() {
        // FNV-1a of "a" with zero seed.
        assert_eq!(hash_bytes(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn canonical_f64_collapses_nan_and_negative_zero() {
        assert_eq!(
            canonical_f64_bits(f64::NAN),
            canonical_f64_bits(-f64::NAN)
        );
        assert_eq!(canonical_f64_bits(0.0), canonical_f64_bits(-0.0));
        assert_ne!(canonical_f64_bits(1.0), canonical_f64_bits(-1.0));
    }

    #[test]
    fn seeded_hashes_diverge() {
        let key = b"region=us-east";
        assert_ne!(
            hash_bytes_with_seed(key, 0),
            hash_bytes_with_seed(key, SHARD_SEED)
        );
    }
}
