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
use hashbrown::HashMap;

use crate::common::error::MergeError;
use crate::common::hash::canonical_f64_bits;
use crate::exec::query::DimensionSpec;
use crate::exec::row::{DimType, DimValue};

/// Occupancy tag in the high bit of each bucket's hash word.
const USED_TAG: u32 = 0x8000_0000;

/// New inserts are refused once this many tenths of the buckets are live.
const MAX_LOAD_TENTHS: usize = 7;

/// Approximate heap cost of one interned string: two owned copies plus the
/// id map slot.
const DICTIONARY_ENTRY_OVERHEAD: u64 = 48;

pub(crate) struct SlotLookup {
    pub(crate) bucket: usize,
    pub(crate) is_new: bool,
}

/// Open-addressed table laid out over borrowed merge-buffer regions.
///
/// Bucket layout: 4-byte tagged hash word, fixed-width encoded key, then the
/// concatenated aggregator states. The table never allocates; when the load
/// factor is reached, `upsert` refuses new keys and the owner spills.
pub(crate) struct BufferHashTable {
    regions: Vec<Vec<u8>>,
    bucket_size: usize,
    key_width: usize,
    buckets_per_region: usize,
    num_buckets: usize,
    max_entries: usize,
    len: usize,
}

impl BufferHashTable {
    pub(crate) fn new(mut regions: Vec<Vec<u8>>, key_width: usize, state_width: usize) -> Self {
        for region in &mut regions {
            region.fill(0);
        }
        let bucket_size = 4 + key_width + state_width;
        let region_len = regions.first().map(|r| r.len()).unwrap_or(0);
        let buckets_per_region = region_len / bucket_size;
        let num_buckets = buckets_per_region * regions.len();
        Self {
            regions,
            bucket_size,
            key_width,
            buckets_per_region,
            num_buckets,
            max_entries: num_buckets * MAX_LOAD_TENTHS / 10,
            len: 0,
        }
    }

    /// Finds or inserts `key`, probing linearly from its hash. Returns `None`
    /// when the key is absent and the table cannot take another entry.
    pub(crate) fn upsert(&mut self, hash: u64, key: &[u8]) -> Option<SlotLookup> {
        debug_assert_eq!(key.len(), self.key_width);
        if self.num_buckets == 0 {
            return None;
        }
        let tagged = (hash as u32 & !USED_TAG) | USED_TAG;
        let start = (hash % self.num_buckets as u64) as usize;
        for probed in 0..self.num_buckets {
            let bucket = (start + probed) % self.num_buckets;
            let word = self.hash_word(bucket);
            if word & USED_TAG == 0 {
                if self.len >= self.max_entries {
                    return None;
                }
                self.write_hash_word(bucket, tagged);
                self.key_slot_mut(bucket).copy_from_slice(key);
                self.len += 1;
                return Some(SlotLookup {
                    bucket,
                    is_new: true,
                });
            }
            if word == tagged && self.key_slot(bucket) == key {
                return Some(SlotLookup {
                    bucket,
                    is_new: false,
                });
            }
        }
        None
    }

    pub(crate) fn state_mut(&mut self, bucket: usize) -> &mut [u8] {
        let (region, offset) = self.bucket_pos(bucket);
        let start = offset + 4 + self.key_width;
        let end = offset + self.bucket_size;
        &mut self.regions[region][start..end]
    }

    /// Live entries as (encoded key, aggregator states), in bucket order.
    pub(crate) fn entries(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        (0..self.num_buckets).filter_map(move |bucket| {
            if self.hash_word(bucket) & USED_TAG == 0 {
                return None;
            }
            let (region, offset) = self.bucket_pos(bucket);
            let key = &self.regions[region][offset + 4..offset + 4 + self.key_width];
            let state =
                &self.regions[region][offset + 4 + self.key_width..offset + self.bucket_size];
            Some((key, state))
        })
    }

    /// Marks every bucket empty without touching key or state bytes.
    pub(crate) fn clear(&mut self) {
        for bucket in 0..self.num_buckets {
            self.write_hash_word(bucket, 0);
        }
        self.len = 0;
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[allow(dead_code)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[allow(dead_code)]
    pub(crate) fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub(crate) fn into_regions(self) -> Vec<Vec<u8>> {
        self.regions
    }

    fn bucket_pos(&self, bucket: usize) -> (usize, usize) {
        (
            bucket / self.buckets_per_region,
            (bucket % self.buckets_per_region) * self.bucket_size,
        )
    }

    fn hash_word(&self, bucket: usize) -> u32 {
        let (region, offset) = self.bucket_pos(bucket);
        u32::from_le_bytes(self.regions[region][offset..offset + 4].try_into().unwrap())
    }

    fn write_hash_word(&mut self, bucket: usize, word: u32) {
        let (region, offset) = self.bucket_pos(bucket);
        self.regions[region][offset..offset + 4].copy_from_slice(&word.to_le_bytes());
    }

    fn key_slot(&self, bucket: usize) -> &[u8] {
        let (region, offset) = self.bucket_pos(bucket);
        &self.regions[region][offset + 4..offset + 4 + self.key_width]
    }

    fn key_slot_mut(&mut self, bucket: usize) -> &mut [u8] {
        let (region, offset) = self.bucket_pos(bucket);
        &mut self.regions[region][offset + 4..offset + 4 + self.key_width]
    }
}

/// Interning dictionary for string dimension values, capped at a byte budget.
pub(crate) struct KeyDictionary {
    ids: HashMap<String, u32>,
    values: Vec<String>,
    bytes_used: u64,
    max_bytes: u64,
}

impl KeyDictionary {
    pub(crate) fn new(max_bytes: u64) -> Self {
        Self {
            ids: HashMap::new(),
            values: Vec::new(),
            bytes_used: 0,
            max_bytes,
        }
    }

    /// Returns the id for `value`, interning it if unseen. `None` means the
    /// byte budget is exhausted and the owner must spill.
    pub(crate) fn intern(&mut self, value: &str) -> Option<u32> {
        if let Some(&id) = self.ids.get(value) {
            return Some(id);
        }
        let cost = 2 * value.len() as u64 + DICTIONARY_ENTRY_OVERHEAD;
        if self.bytes_used + cost > self.max_bytes {
            return None;
        }
        let id = self.values.len() as u32;
        self.ids.insert(value.to_string(), id);
        self.values.push(value.to_string());
        self.bytes_used += cost;
        Some(id)
    }

    pub(crate) fn lookup(&self, id: u32) -> Option<&str> {
        self.values.get(id as usize).map(|v| v.as_str())
    }

    pub(crate) fn bytes_used(&self) -> u64 {
        self.bytes_used
    }

    pub(crate) fn clear(&mut self) {
        self.ids.clear();
        self.values.clear();
        self.bytes_used = 0;
    }
}

/// Width of one encoded key for the given dimension list: a null flag per
/// dimension, then 4 bytes (string dictionary id) or 8 bytes (long/double).
pub(crate) fn encoded_key_width(dimensions: &[DimensionSpec]) -> usize {
    dimensions
        .iter()
        .map(|d| match d.value_type {
            DimType::String => 1 + 4,
            DimType::Long | DimType::Double => 1 + 8,
        })
        .sum()
}

#[derive(Debug)]
pub(crate) enum KeyEncode {
    Encoded,
    DictionaryFull,
}

/// Encodes one row's dimension values into `out` (cleared first). Doubles are
/// written with canonical NaN/zero bits so equal keys stay byte-equal.
pub(crate) fn encode_key(
    dims: &[DimValue],
    specs: &[DimensionSpec],
    dictionary: &mut KeyDictionary,
    out: &mut Vec<u8>,
) -> Result<KeyEncode, MergeError> {
    if dims.len() != specs.len() {
        return Err(MergeError::runtime(format!(
            "row has {} dimensions, query expects {}",
            dims.len(),
            specs.len()
        )));
    }
    out.clear();
    for (value, spec) in dims.iter().zip(specs.iter()) {
        match (spec.value_type, value) {
            (DimType::String, DimValue::Null) => {
                out.push(1);
                out.extend_from_slice(&[0u8; 4]);
            }
            (DimType::String, DimValue::String(s)) => {
                let Some(id) = dictionary.intern(s) else {
                    return Ok(KeyEncode::DictionaryFull);
                };
                out.push(0);
                out.extend_from_slice(&id.to_le_bytes());
            }
            (DimType::Long, DimValue::Null) => {
                out.push(1);
                out.extend_from_slice(&[0u8; 8]);
            }
            (DimType::Long, DimValue::Long(n)) => {
                out.push(0);
                out.extend_from_slice(&n.to_le_bytes());
            }
            (DimType::Double, DimValue::Null) => {
                out.push(1);
                out.extend_from_slice(&[0u8; 8]);
            }
            (DimType::Double, DimValue::Double(f)) => {
                out.push(0);
                out.extend_from_slice(&canonical_f64_bits(*f).to_le_bytes());
            }
            (expected, got) => {
                return Err(MergeError::runtime(format!(
                    "dimension {} expects a {:?} value, row carries {:?}",
                    spec.name, expected, got
                )));
            }
        }
    }
    Ok(KeyEncode::Encoded)
}

/// Decodes an encoded key back into dimension values.
pub(crate) fn decode_key(
    key: &[u8],
    specs: &[DimensionSpec],
    dictionary: &KeyDictionary,
) -> Result<Vec<DimValue>, MergeError> {
    let mut dims = Vec::with_capacity(specs.len());
    let mut pos = 0;
    for spec in specs {
        let null = key[pos] == 1;
        pos += 1;
        match spec.value_type {
            DimType::String => {
                let id = u32::from_le_bytes(key[pos..pos + 4].try_into().unwrap());
                pos += 4;
                if null {
                    dims.push(DimValue::Null);
                } else {
                    let value = dictionary.lookup(id).ok_or_else(|| {
                        MergeError::defensive(format!(
                            "dictionary id {id} missing for dimension {}",
                            spec.name
                        ))
                    })?;
                    dims.push(DimValue::String(value.to_string()));
                }
            }
            DimType::Long => {
                let n = i64::from_le_bytes(key[pos..pos + 8].try_into().unwrap());
                pos += 8;
                dims.push(if null { DimValue::Null } else { DimValue::Long(n) });
            }
            DimType::Double => {
                let bits = u64::from_le_bytes(key[pos..pos + 8].try_into().unwrap());
                pos += 8;
                dims.push(if null {
                    DimValue::Null
                } else {
                    DimValue::Double(f64::from_bits(bits))
                });
            }
        }
    }
    Ok(dims)
}
