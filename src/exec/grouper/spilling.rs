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
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::common::error::{MergeError, MergeErrorKind};
use crate::common::hash::hash_bytes;
use crate::exec::aggregator::{Aggregator, combine_values, state_layout};
use crate::exec::grouper::AccumulateResult;
use crate::exec::grouper::table::{
    BufferHashTable, KeyDictionary, KeyEncode, decode_key, encode_key, encoded_key_width,
};
use crate::exec::grouper::temp_storage::LimitedTemporaryStorage;
use crate::exec::query::DimensionSpec;
use crate::exec::row::{AggValue, ResultRow, RowStream};
use crate::runtime::stats::PerQueryStats;

/// Hash-based combiner over a fixed set of merge-buffer regions.
///
/// Rows upsert into a `BufferHashTable`; when the table or the string
/// dictionary runs out of room, live entries are sorted by key and written as
/// one JSON-lines run file, the table is reset, and the row is retried once.
/// Draining either walks the table directly or heap-merges the table with all
/// spilled runs, combining aggregate state for equal keys so exactly one row
/// per distinct key comes out.
pub(crate) struct SpillingGrouper {
    specs: Vec<DimensionSpec>,
    aggregators: Vec<Arc<dyn Aggregator>>,
    state_offsets: Vec<usize>,
    table: Option<BufferHashTable>,
    dictionary: KeyDictionary,
    storage: Arc<LimitedTemporaryStorage>,
    stats: Arc<PerQueryStats>,
    runs: Vec<PathBuf>,
    key_scratch: Vec<u8>,
    drained: bool,
}

impl SpillingGrouper {
    pub(crate) fn new(
        specs: Vec<DimensionSpec>,
        aggregators: Vec<Arc<dyn Aggregator>>,
        regions: Vec<Vec<u8>>,
        max_dictionary_bytes: u64,
        storage: Arc<LimitedTemporaryStorage>,
        stats: Arc<PerQueryStats>,
    ) -> Self {
        let key_width = encoded_key_width(&specs);
        let (state_offsets, state_width) = state_layout(&aggregators);
        Self {
            specs,
            aggregators,
            state_offsets,
            table: Some(BufferHashTable::new(regions, key_width, state_width)),
            dictionary: KeyDictionary::new(max_dictionary_bytes),
            storage,
            stats,
            runs: Vec::new(),
            key_scratch: Vec::new(),
            drained: false,
        }
    }

    /// Folds one partial row into the table, spilling and retrying once when
    /// space runs out. Capacity problems surface as `Failed`, not errors.
    pub(crate) fn aggregate(&mut self, row: &ResultRow) -> Result<AccumulateResult, MergeError> {
        if row.aggs.len() != self.aggregators.len() {
            return Err(MergeError::runtime(format!(
                "row has {} aggregates, query expects {}",
                row.aggs.len(),
                self.aggregators.len()
            )));
        }
        for attempt in 0..2 {
            let encoded = encode_key(
                &row.dims,
                &self.specs,
                &mut self.dictionary,
                &mut self.key_scratch,
            )?;
            if let KeyEncode::Encoded = encoded {
                let Some(table) = self.table.as_mut() else {
                    return Err(MergeError::defensive("aggregate on a closed grouper"));
                };
                let hash = hash_bytes(&self.key_scratch);
                if let Some(slot) = table.upsert(hash, &self.key_scratch) {
                    let state = table.state_mut(slot.bucket);
                    for ((agg, offset), value) in self
                        .aggregators
                        .iter()
                        .zip(&self.state_offsets)
                        .zip(&row.aggs)
                    {
                        let slice = &mut state[*offset..*offset + agg.state_bytes()];
                        if slot.is_new {
                            agg.init_state(slice);
                        }
                        agg.merge_value(slice, value);
                    }
                    return Ok(AccumulateResult::Ok);
                }
            }
            if attempt == 1 {
                break;
            }
            match self.spill() {
                Ok(()) => {}
                Err(err) if err.kind == MergeErrorKind::ResourceExhausted => {
                    return Ok(AccumulateResult::Failed(err.message));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(AccumulateResult::Failed(
            "group key does not fit in an empty merge buffer".to_string(),
        ))
    }

    /// Sorts live entries, writes them as one run file, and resets the table
    /// and dictionary.
    fn spill(&mut self) -> Result<(), MergeError> {
        self.stats
            .record_dictionary_bytes(self.dictionary.bytes_used());
        let mut rows = self.table_rows()?;
        rows.sort_by(|a, b| a.dims.cmp(&b.dims));
        if !rows.is_empty() {
            let (path, bytes) = self.write_run(&rows)?;
            self.stats.add_spill_run(bytes);
            self.runs.push(path);
        }
        if let Some(table) = self.table.as_mut() {
            table.clear();
        }
        self.dictionary.clear();
        Ok(())
    }

    fn table_rows(&self) -> Result<Vec<ResultRow>, MergeError> {
        let Some(table) = self.table.as_ref() else {
            return Err(MergeError::defensive("grouper used after close"));
        };
        let mut rows = Vec::with_capacity(table.len());
        for (key, state) in table.entries() {
            let dims = decode_key(key, &self.specs, &self.dictionary)?;
            let aggs = read_state_row(&self.aggregators, &self.state_offsets, state);
            rows.push(ResultRow::new(dims, aggs));
        }
        Ok(rows)
    }

    fn write_run(&self, rows: &[ResultRow]) -> Result<(PathBuf, u64), MergeError> {
        let mut writer = self.storage.create_file()?;
        for row in rows {
            let mut line = serde_json::to_vec(row)
                .map_err(|e| MergeError::runtime(format!("serialize spill row failed: {e}")))?;
            line.push(b'\n');
            if let Err(err) = writer.write_all(&line) {
                self.storage.delete(writer.path());
                return Err(err);
            }
        }
        writer.finish()
    }

    /// One-shot output stream. With no spilled runs this walks the table
    /// (sorted only on request); otherwise it heap-merges the sorted table
    /// with every run, combining rows that share a key.
    pub(crate) fn drain(&mut self, sorted: bool) -> Result<RowStream, MergeError> {
        if self.drained {
            return Err(MergeError::defensive("grouper output already drained"));
        }
        self.stats
            .record_dictionary_bytes(self.dictionary.bytes_used());
        let mut rows = self.table_rows()?;
        self.drained = true;
        if let Some(table) = self.table.as_mut() {
            table.clear();
        }
        self.dictionary.clear();

        if self.runs.is_empty() {
            if sorted {
                rows.sort_by(|a, b| a.dims.cmp(&b.dims));
            }
            return Ok(Box::new(rows.into_iter().map(Ok)));
        }

        let mut sources = Vec::with_capacity(self.runs.len() + 1);
        for path in &self.runs {
            sources.push(RowSource::open_run(path)?);
        }
        rows.sort_by(|a, b| a.dims.cmp(&b.dims));
        sources.push(RowSource::Mem(rows.into_iter()));
        Ok(Box::new(KWayMerge::new(sources, self.aggregators.clone())?))
    }

    #[allow(dead_code)]
    pub(crate) fn spilled_runs(&self) -> usize {
        self.runs.len()
    }

    /// Releases the table's regions back to the caller and deletes this
    /// grouper's run files. Safe to call more than once.
    pub(crate) fn close(&mut self) -> Vec<Vec<u8>> {
        let regions = self
            .table
            .take()
            .map(|table| table.into_regions())
            .unwrap_or_default();
        for path in self.runs.drain(..) {
            self.storage.delete(&path);
        }
        regions
    }
}

fn read_state_row(
    aggregators: &[Arc<dyn Aggregator>],
    offsets: &[usize],
    state: &[u8],
) -> Vec<AggValue> {
    aggregators
        .iter()
        .zip(offsets)
        .map(|(agg, offset)| agg.read_state(&state[*offset..*offset + agg.state_bytes()]))
        .collect()
}

pub(crate) enum RowSource {
    Mem(std::vec::IntoIter<ResultRow>),
    Run(std::io::Lines<BufReader<File>>),
    Stream(RowStream),
}

impl RowSource {
    fn open_run(path: &Path) -> Result<Self, MergeError> {
        let file = File::open(path).map_err(|e| {
            MergeError::runtime(format!("open spill run {} failed: {e}", path.display()))
        })?;
        Ok(RowSource::Run(BufReader::new(file).lines()))
    }

    fn next_row(&mut self) -> Option<Result<ResultRow, MergeError>> {
        match self {
            RowSource::Mem(rows) => rows.next().map(Ok),
            RowSource::Run(lines) => match lines.next()? {
                Ok(line) => Some(
                    serde_json::from_str(&line)
                        .map_err(|e| MergeError::runtime(format!("deserialize spill row failed: {e}"))),
                ),
                Err(e) => Some(Err(MergeError::runtime(format!("read spill run failed: {e}")))),
            },
            RowSource::Stream(stream) => stream.next(),
        }
    }
}

struct HeapEntry {
    row: ResultRow,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .dims
            .cmp(&other.row.dims)
            .then_with(|| self.source.cmp(&other.source))
    }
}

/// Streaming merge over key-sorted sources; equal keys across sources are
/// combined into a single output row.
pub(crate) struct KWayMerge {
    sources: Vec<RowSource>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    aggregators: Vec<Arc<dyn Aggregator>>,
    failed: bool,
}

impl KWayMerge {
    pub(crate) fn new(
        sources: Vec<RowSource>,
        aggregators: Vec<Arc<dyn Aggregator>>,
    ) -> Result<Self, MergeError> {
        let mut merge = Self {
            sources,
            heap: BinaryHeap::new(),
            aggregators,
            failed: false,
        };
        for source in 0..merge.sources.len() {
            merge.refill(source)?;
        }
        Ok(merge)
    }

    fn refill(&mut self, source: usize) -> Result<(), MergeError> {
        if let Some(row) = self.sources[source].next_row() {
            self.heap.push(Reverse(HeapEntry { row: row?, source }));
        }
        Ok(())
    }
}

impl Iterator for KWayMerge {
    type Item = Result<ResultRow, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let Reverse(mut head) = self.heap.pop()?;
        if let Err(err) = self.refill(head.source) {
            self.failed = true;
            return Some(Err(err));
        }
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(peer)| peer.row.dims == head.row.dims)
        {
            let Some(Reverse(peer)) = self.heap.pop() else {
                break;
            };
            combine_values(&self.aggregators, &mut head.row.aggs, &peer.row.aggs);
            if let Err(err) = self.refill(peer.source) {
                self.failed = true;
                return Some(Err(err));
            }
        }
        Some(Ok(head.row))
    }
}
