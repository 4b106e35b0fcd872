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
//! In-memory sort buffer over memory segments.
//!
//! Responsibilities:
//! - Append rows into a paged record area, `len:u32 row` per record, records
//!   may straddle segment boundaries.
//! - Keep a fixed-width index `normalized key | record offset:u64` in
//!   separate segments; entries never straddle.
//! - Sort the index in place, prefix first, comparator on prefix ties.
//!
//! The buffer never asks for memory directly: it draws from the side's
//! `SegmentPool` and reports "full" when the pool has nothing left.

use std::cmp::Ordering;

use bytes::Bytes;

use crate::common::error::{SmjError, SmjResult};
use crate::exec::expr::{MAX_NORMALIZED_KEY_BYTES, NormalizedKey, SortKeyContext};
use crate::exec::row::BinaryRow;
use crate::runtime::memory_manager::{MemorySegment, SegmentPool};

const OFFSET_LEN: usize = 8;
const RECORD_LEN_PREFIX: usize = 4;
const MAX_ENTRY_LEN: usize = MAX_NORMALIZED_KEY_BYTES + OFFSET_LEN;

pub struct SortBuffer {
    ctx: SortKeyContext,
    key_len: usize,
    entry_len: usize,
    segment_size: usize,
    entries_per_segment: usize,
    record_segments: Vec<MemorySegment>,
    record_end: u64,
    index_segments: Vec<MemorySegment>,
    num_records: usize,
}

impl SortBuffer {
    pub fn new(ctx: SortKeyContext, segment_size: usize) -> SmjResult<Self> {
        let key_len = ctx.key_bytes();
        let entry_len = key_len + OFFSET_LEN;
        let entries_per_segment = segment_size / entry_len;
        if entries_per_segment == 0 {
            return Err(SmjError::Internal(format!(
                "segment of {segment_size} bytes cannot hold a {entry_len} byte sort index entry"
            )));
        }
        Ok(Self {
            ctx,
            key_len,
            entry_len,
            segment_size,
            entries_per_segment,
            record_segments: Vec::new(),
            record_end: 0,
            index_segments: Vec::new(),
            num_records: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.num_records
    }

    pub fn is_empty(&self) -> bool {
        self.num_records == 0
    }

    pub fn key_len(&self) -> usize {
        self.key_len
    }

    pub fn occupied_segments(&self) -> usize {
        self.record_segments.len() + self.index_segments.len()
    }

    pub fn occupied_bytes(&self) -> u64 {
        self.record_end + (self.num_records * self.entry_len) as u64
    }

    /// Append one row. Returns `false`, leaving the buffer unchanged, when
    /// the pool cannot supply the segments the row needs.
    pub fn append(
        &mut self,
        key: &NormalizedKey,
        row: &BinaryRow,
        pool: &mut SegmentPool,
    ) -> SmjResult<bool> {
        if key.len() != self.key_len {
            return Err(SmjError::Internal(format!(
                "normalized key of {} bytes in a sort buffer of {} byte keys",
                key.len(),
                self.key_len
            )));
        }
        let record_len = (RECORD_LEN_PREFIX + row.len()) as u64;
        let record_capacity = (self.record_segments.len() * self.segment_size) as u64;
        let record_need = (self.record_end + record_len).saturating_sub(record_capacity);
        let new_record_segments = record_need.div_ceil(self.segment_size as u64) as usize;
        let new_index_segments =
            usize::from(self.num_records == self.index_segments.len() * self.entries_per_segment);
        let needed = new_record_segments + new_index_segments;
        if needed > pool.available() {
            return Ok(false);
        }
        if needed > 0 {
            let mut segs = pool.take(needed)?;
            let index_segs = segs.split_off(new_record_segments);
            self.record_segments.extend(segs);
            self.index_segments.extend(index_segs);
        }

        let offset = self.record_end;
        let row_len = u32::try_from(row.len()).map_err(|_| {
            SmjError::Internal(format!("row of {} bytes cannot be buffered", row.len()))
        })?;
        self.write_record_bytes(offset, &row_len.to_le_bytes());
        self.write_record_bytes(offset + RECORD_LEN_PREFIX as u64, row.as_bytes());
        self.record_end += record_len;

        let mut entry = [0u8; MAX_ENTRY_LEN];
        entry[..self.key_len].copy_from_slice(key.as_bytes());
        entry[self.key_len..self.entry_len].copy_from_slice(&offset.to_le_bytes());
        let idx = self.num_records;
        self.write_entry(idx, &entry[..self.entry_len]);
        self.num_records += 1;
        Ok(true)
    }

    fn write_record_bytes(&mut self, mut offset: u64, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let seg = (offset / self.segment_size as u64) as usize;
            let pos = (offset % self.segment_size as u64) as usize;
            let n = (self.segment_size - pos).min(bytes.len());
            self.record_segments[seg].as_mut_slice()[pos..pos + n].copy_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            offset += n as u64;
        }
    }

    fn read_record_bytes(&self, mut offset: u64, mut out: &mut [u8]) {
        while !out.is_empty() {
            let seg = (offset / self.segment_size as u64) as usize;
            let pos = (offset % self.segment_size as u64) as usize;
            let n = (self.segment_size - pos).min(out.len());
            out[..n].copy_from_slice(&self.record_segments[seg].as_slice()[pos..pos + n]);
            out = &mut out[n..];
            offset += n as u64;
        }
    }

    fn entry_location(&self, idx: usize) -> (usize, usize) {
        (
            idx / self.entries_per_segment,
            (idx % self.entries_per_segment) * self.entry_len,
        )
    }

    fn entry(&self, idx: usize) -> &[u8] {
        let (seg, pos) = self.entry_location(idx);
        &self.index_segments[seg].as_slice()[pos..pos + self.entry_len]
    }

    fn write_entry(&mut self, idx: usize, bytes: &[u8]) {
        let (seg, pos) = self.entry_location(idx);
        let len = self.entry_len;
        self.index_segments[seg].as_mut_slice()[pos..pos + len].copy_from_slice(bytes);
    }

    fn entry_key(&self, idx: usize) -> &[u8] {
        &self.entry(idx)[..self.key_len]
    }

    fn entry_offset(&self, idx: usize) -> u64 {
        let mut buf = [0u8; OFFSET_LEN];
        buf.copy_from_slice(&self.entry(idx)[self.key_len..]);
        u64::from_le_bytes(buf)
    }

    fn record_at(&self, offset: u64) -> SmjResult<BinaryRow> {
        let mut len_buf = [0u8; RECORD_LEN_PREFIX];
        self.read_record_bytes(offset, &mut len_buf);
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut data = vec![0u8; len];
        self.read_record_bytes(offset + RECORD_LEN_PREFIX as u64, &mut data);
        BinaryRow::from_bytes(Bytes::from(data))
    }

    /// Row and key at index position `idx`.
    pub fn get(&self, idx: usize) -> SmjResult<(NormalizedKey, BinaryRow)> {
        if idx >= self.num_records {
            return Err(SmjError::Internal(format!(
                "sort buffer position {idx} out of {} records",
                self.num_records
            )));
        }
        let key = NormalizedKey::from_slice(self.entry_key(idx));
        let row = self.record_at(self.entry_offset(idx))?;
        Ok((key, row))
    }

    fn compare(&self, a: usize, b: usize) -> SmjResult<Ordering> {
        match self.entry_key(a).cmp(self.entry_key(b)) {
            Ordering::Equal if !self.ctx.fully_determines() => {
                let left = self.record_at(self.entry_offset(a))?;
                let right = self.record_at(self.entry_offset(b))?;
                Ok(self.ctx.compare_rows(&left, &right))
            }
            ord => Ok(ord),
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        let mut ea = [0u8; MAX_ENTRY_LEN];
        let mut eb = [0u8; MAX_ENTRY_LEN];
        let len = self.entry_len;
        ea[..len].copy_from_slice(self.entry(a));
        eb[..len].copy_from_slice(self.entry(b));
        self.write_entry(a, &eb[..len]);
        self.write_entry(b, &ea[..len]);
    }

    /// In-place heapsort of the index. Ties broken by the comparator are
    /// ordered, ties it reports as equal are left in arbitrary order. Fails
    /// only if a record needed for a tie-break cannot be decoded.
    pub fn sort(&mut self) -> SmjResult<()> {
        let n = self.num_records;
        if n < 2 {
            return Ok(());
        }
        for start in (0..n / 2).rev() {
            self.sift_down(start, n)?;
        }
        for end in (1..n).rev() {
            self.swap(0, end);
            self.sift_down(0, end)?;
        }
        Ok(())
    }

    fn sift_down(&mut self, mut root: usize, end: usize) -> SmjResult<()> {
        loop {
            let mut child = 2 * root + 1;
            if child >= end {
                return Ok(());
            }
            if child + 1 < end && self.compare(child, child + 1)? == Ordering::Less {
                child += 1;
            }
            if self.compare(root, child)? != Ordering::Less {
                return Ok(());
            }
            self.swap(root, child);
            root = child;
        }
    }

    /// Forget the records, keep the segments for the next run.
    pub fn reset(&mut self) {
        self.record_end = 0;
        self.num_records = 0;
    }

    /// Hand every segment back to the pool.
    pub fn release_into(&mut self, pool: &mut SegmentPool) {
        self.reset();
        pool.recycle_all(self.record_segments.drain(..));
        pool.recycle_all(self.index_segments.drain(..));
    }

    /// Move the sorted contents out as a readable run, leaving this buffer
    /// empty and segment-less.
    pub fn take_run(&mut self) -> SortedRun {
        let buffer = SortBuffer {
            ctx: self.ctx.clone(),
            key_len: self.key_len,
            entry_len: self.entry_len,
            segment_size: self.segment_size,
            entries_per_segment: self.entries_per_segment,
            record_segments: std::mem::take(&mut self.record_segments),
            record_end: self.record_end,
            index_segments: std::mem::take(&mut self.index_segments),
            num_records: self.num_records,
        };
        self.reset();
        SortedRun { buffer, pos: 0 }
    }
}

/// A sorted in-memory run. Segments are released once the last row is read.
pub struct SortedRun {
    buffer: SortBuffer,
    pos: usize,
}

impl SortedRun {
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn next_keyed(&mut self) -> SmjResult<Option<(NormalizedKey, BinaryRow)>> {
        if self.pos >= self.buffer.num_records {
            self.buffer.record_segments.clear();
            self.buffer.index_segments.clear();
            return Ok(None);
        }
        let item = self.buffer.get(self.pos)?;
        self.pos += 1;
        Ok(Some(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::expr::int_key::{
        FieldKeyProjection, IntKeyComparator, IntNormalizedKeyComputer,
    };
    use crate::exec::row::BinaryRowWriter;
    use crate::runtime::memory_manager::MemoryManager;
    use std::sync::Arc;

    fn ctx(num_fields: usize) -> SortKeyContext {
        SortKeyContext::new(
            Arc::new(FieldKeyProjection::new((0..num_fields).collect())),
            Arc::new(IntNormalizedKeyComputer::new(num_fields)),
            Arc::new(IntKeyComparator::new(num_fields)),
        )
    }

    fn row(a: i64, b: i64) -> BinaryRow {
        let mut w = BinaryRowWriter::new(3);
        w.write_long(0, a).write_long(1, b).write_str(2, "padding-payload");
        w.finish()
    }

    fn drain(run: &mut SortedRun) -> Vec<BinaryRow> {
        let mut out = Vec::new();
        while let Some((_, r)) = run.next_keyed().unwrap() {
            out.push(r);
        }
        out
    }

    #[test]
    fn sorts_by_prefix() {
        let mm = MemoryManager::new(64 * 128, 128).unwrap();
        let mut pool = SegmentPool::new(mm.clone(), "t", 0, 64).unwrap();
        let c = ctx(1);
        let mut buf = SortBuffer::new(c.clone(), 128).unwrap();
        let values = [5i64, -3, 9, 0, 5, 2, -8, 7];
        for v in values {
            let r = row(v, 0);
            assert!(buf.append(&c.normalized_key(&r), &r, &mut pool).unwrap());
        }
        buf.sort().unwrap();
        let mut run = buf.take_run();
        let sorted: Vec<i64> = drain(&mut run).iter().map(|r| r.get_long(0).unwrap()).collect();
        let mut expected = values.to_vec();
        expected.sort();
        assert_eq!(sorted, expected);
        drop(run);
        pool.release_all().unwrap();
        assert!(mm.verify_empty());
    }

    #[test]
    fn falls_back_to_comparator_on_prefix_ties() {
        let mm = MemoryManager::new(64 * 256, 256).unwrap();
        let mut pool = SegmentPool::new(mm.clone(), "t", 0, 64).unwrap();
        let c = ctx(2);
        assert!(!c.fully_determines());
        let mut buf = SortBuffer::new(c.clone(), 256).unwrap();
        // The second field is cut off the 16-byte prefix at its low bytes.
        for b in [3i64, 1, 2, 0] {
            let r = row(1, b);
            assert!(buf.append(&c.normalized_key(&r), &r, &mut pool).unwrap());
        }
        buf.sort().unwrap();
        let mut run = buf.take_run();
        let seconds: Vec<i64> = drain(&mut run).iter().map(|r| r.get_long(1).unwrap()).collect();
        assert_eq!(seconds, vec![0, 1, 2, 3]);
    }

    #[test]
    fn reports_full_without_partial_writes() {
        let mm = MemoryManager::new(4 * 64, 64).unwrap();
        let mut pool = SegmentPool::new(mm.clone(), "t", 0, 2).unwrap();
        let c = ctx(1);
        let mut buf = SortBuffer::new(c.clone(), 64).unwrap();
        let mut accepted = 0;
        loop {
            let r = row(accepted, 0);
            if !buf.append(&c.normalized_key(&r), &r, &mut pool).unwrap() {
                break;
            }
            accepted += 1;
        }
        assert!(accepted >= 1);
        assert_eq!(buf.len() as i64, accepted);
        assert_eq!(buf.occupied_segments(), 2);
        buf.release_into(&mut pool);
        pool.release_all().unwrap();
        assert!(mm.verify_empty());
    }

    #[test]
    fn undecodable_tie_break_record_fails_the_sort() {
        let mm = MemoryManager::new(64 * 256, 256).unwrap();
        let mut pool = SegmentPool::new(mm.clone(), "t", 0, 64).unwrap();
        let c = ctx(2);
        let mut buf = SortBuffer::new(c.clone(), 256).unwrap();
        for b in [2i64, 1] {
            let r = row(1, b);
            assert!(buf.append(&c.normalized_key(&r), &r, &mut pool).unwrap());
        }
        // Shrink the first record's length prefix below a row header.
        buf.record_segments[0].as_mut_slice()[..RECORD_LEN_PREFIX]
            .copy_from_slice(&1u32.to_le_bytes());
        let err = buf.sort().unwrap_err();
        assert!(matches!(err, SmjError::CorruptChannel(_)));
        buf.release_into(&mut pool);
        pool.release_all().unwrap();
        assert!(mm.verify_empty());
    }
}
