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
//! K-way merge over sorted runs.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::common::error::SmjResult;
use crate::exec::expr::{NormalizedKey, SortKeyContext};
use crate::exec::row::{BinaryRow, RowIterator};
use crate::exec::spill::ChannelReader;

use super::sort_buffer::SortedRun;

pub enum MergeSource {
    Channel(ChannelReader),
    Memory(SortedRun),
}

impl MergeSource {
    fn next_keyed(&mut self) -> SmjResult<Option<(NormalizedKey, BinaryRow)>> {
        match self {
            MergeSource::Channel(reader) => reader.next_keyed(),
            MergeSource::Memory(run) => run.next_keyed(),
        }
    }
}

struct HeapEntry {
    key: NormalizedKey,
    row: BinaryRow,
    source: usize,
    ctx: Arc<SortKeyContext>,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ctx
            .compare(&self.key, &self.row, &other.key, &other.row)
            .then(self.source.cmp(&other.source))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

/// Min-heap merge. A source is dropped, and its segments returned, as soon
/// as it runs dry.
pub struct MergeIterator {
    ctx: Arc<SortKeyContext>,
    sources: Vec<Option<MergeSource>>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl MergeIterator {
    pub fn new(ctx: Arc<SortKeyContext>, sources: Vec<MergeSource>) -> SmjResult<Self> {
        let mut merger = Self {
            ctx,
            heap: BinaryHeap::with_capacity(sources.len()),
            sources: sources.into_iter().map(Some).collect(),
        };
        for idx in 0..merger.sources.len() {
            merger.refill(idx)?;
        }
        Ok(merger)
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    fn refill(&mut self, idx: usize) -> SmjResult<()> {
        let Some(source) = self.sources[idx].as_mut() else {
            return Ok(());
        };
        match source.next_keyed()? {
            Some((key, row)) => self.heap.push(Reverse(HeapEntry {
                key,
                row,
                source: idx,
                ctx: Arc::clone(&self.ctx),
            })),
            None => self.sources[idx] = None,
        }
        Ok(())
    }

    pub fn next_keyed(&mut self) -> SmjResult<Option<(NormalizedKey, BinaryRow)>> {
        let Some(Reverse(entry)) = self.heap.pop() else {
            return Ok(None);
        };
        self.refill(entry.source)?;
        Ok(Some((entry.key, entry.row)))
    }
}

impl RowIterator for MergeIterator {
    fn next_row(&mut self) -> SmjResult<Option<BinaryRow>> {
        Ok(self.next_keyed()?.map(|(_, row)| row))
    }
}
