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
//! Binary row format shared by the sorter, the spill layer and the join.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! +-------+-------------+----------------+------------------+----------+
//! | arity | null bitmap | var-len bitmap | arity * 8B slots | var tail |
//! |  u16  | ceil(n / 8) |  ceil(n / 8)   |                  |          |
//! +-------+-------------+----------------+------------------+----------+
//! ```
//!
//! Fixed-width values live in their slot. A variable-length value stores
//! `offset | (len << 32)` in its slot, with `offset` counted from the start
//! of the row. Rows are immutable once built and cheap to clone.

use std::fmt;

use bytes::Bytes;

use crate::common::error::{SmjError, SmjResult};

const ARITY_LEN: usize = 2;
const SLOT_LEN: usize = 8;

fn bitmap_len(arity: usize) -> usize {
    arity.div_ceil(8)
}

fn var_bitmap_start(arity: usize) -> usize {
    ARITY_LEN + bitmap_len(arity)
}

fn slots_start(arity: usize) -> usize {
    ARITY_LEN + 2 * bitmap_len(arity)
}

fn fixed_len(arity: usize) -> usize {
    slots_start(arity) + arity * SLOT_LEN
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BinaryRow {
    data: Bytes,
}

impl BinaryRow {
    /// Wrap serialized bytes, checking the fixed part is present.
    pub fn from_bytes(data: Bytes) -> SmjResult<Self> {
        if data.len() < ARITY_LEN {
            return Err(SmjError::CorruptChannel(format!(
                "binary row of {} bytes has no arity",
                data.len()
            )));
        }
        let arity = u16::from_le_bytes([data[0], data[1]]) as usize;
        if data.len() < fixed_len(arity) {
            return Err(SmjError::CorruptChannel(format!(
                "binary row with arity {arity} needs {} bytes, got {}",
                fixed_len(arity),
                data.len()
            )));
        }
        Ok(Self { data })
    }

    pub fn arity(&self) -> usize {
        u16::from_le_bytes([self.data[0], self.data[1]]) as usize
    }

    /// Serialized size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arity() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn is_null_at(&self, pos: usize) -> bool {
        debug_assert!(pos < self.arity());
        let byte = self.data[ARITY_LEN + pos / 8];
        byte & (1 << (pos % 8)) != 0
    }

    fn is_var_len_at(&self, pos: usize) -> bool {
        let byte = self.data[var_bitmap_start(self.arity()) + pos / 8];
        byte & (1 << (pos % 8)) != 0
    }

    fn slot(&self, pos: usize) -> u64 {
        let start = slots_start(self.arity()) + pos * SLOT_LEN;
        let mut buf = [0u8; SLOT_LEN];
        buf.copy_from_slice(&self.data[start..start + SLOT_LEN]);
        u64::from_le_bytes(buf)
    }

    pub fn get_long(&self, pos: usize) -> Option<i64> {
        if self.is_null_at(pos) {
            return None;
        }
        Some(self.slot(pos) as i64)
    }

    pub fn get_int(&self, pos: usize) -> Option<i32> {
        self.get_long(pos).map(|v| v as i32)
    }

    pub fn get_double(&self, pos: usize) -> Option<f64> {
        if self.is_null_at(pos) {
            return None;
        }
        Some(f64::from_bits(self.slot(pos)))
    }

    /// Variable-length value, or `None` when null, fixed-width or out of
    /// bounds.
    pub fn get_bytes(&self, pos: usize) -> Option<&[u8]> {
        if self.is_null_at(pos) || !self.is_var_len_at(pos) {
            return None;
        }
        let slot = self.slot(pos);
        let offset = (slot & 0xffff_ffff) as usize;
        let len = (slot >> 32) as usize;
        self.data.get(offset..offset.checked_add(len)?)
    }

    pub fn get_str(&self, pos: usize) -> Option<&str> {
        self.get_bytes(pos)
            .and_then(|b| std::str::from_utf8(b).ok())
    }
}

impl fmt::Debug for BinaryRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for i in 0..self.arity() {
            if self.is_null_at(i) {
                list.entry(&"NULL");
            } else {
                list.entry(&self.slot(i));
            }
        }
        list.finish()
    }
}

/// Builds one `BinaryRow`. Every field starts as null.
pub struct BinaryRowWriter {
    arity: usize,
    fixed: Vec<u8>,
    tail: Vec<u8>,
}

impl BinaryRowWriter {
    pub fn new(arity: usize) -> Self {
        assert!(arity <= u16::MAX as usize, "row arity {arity} too large");
        let mut fixed = vec![0u8; fixed_len(arity)];
        fixed[..ARITY_LEN].copy_from_slice(&(arity as u16).to_le_bytes());
        for pos in 0..arity {
            fixed[ARITY_LEN + pos / 8] |= 1 << (pos % 8);
        }
        Self {
            arity,
            fixed,
            tail: Vec::new(),
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    fn mark_not_null(&mut self, pos: usize) {
        self.fixed[ARITY_LEN + pos / 8] &= !(1 << (pos % 8));
    }

    fn set_var_len(&mut self, pos: usize, var_len: bool) {
        let idx = var_bitmap_start(self.arity) + pos / 8;
        if var_len {
            self.fixed[idx] |= 1 << (pos % 8);
        } else {
            self.fixed[idx] &= !(1 << (pos % 8));
        }
    }

    fn write_slot(&mut self, pos: usize, value: u64) {
        assert!(pos < self.arity, "field {pos} out of arity {}", self.arity);
        self.mark_not_null(pos);
        self.set_var_len(pos, false);
        let start = slots_start(self.arity) + pos * SLOT_LEN;
        self.fixed[start..start + SLOT_LEN].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_null(&mut self, pos: usize) -> &mut Self {
        assert!(pos < self.arity, "field {pos} out of arity {}", self.arity);
        self.fixed[ARITY_LEN + pos / 8] |= 1 << (pos % 8);
        self.set_var_len(pos, false);
        let start = slots_start(self.arity) + pos * SLOT_LEN;
        self.fixed[start..start + SLOT_LEN].fill(0);
        self
    }

    pub fn write_long(&mut self, pos: usize, value: i64) -> &mut Self {
        self.write_slot(pos, value as u64);
        self
    }

    pub fn write_int(&mut self, pos: usize, value: i32) -> &mut Self {
        self.write_slot(pos, value as i64 as u64);
        self
    }

    pub fn write_double(&mut self, pos: usize, value: f64) -> &mut Self {
        self.write_slot(pos, value.to_bits());
        self
    }

    pub fn write_bytes(&mut self, pos: usize, value: &[u8]) -> &mut Self {
        let offset = self.fixed.len() + self.tail.len();
        assert!(
            offset + value.len() <= u32::MAX as usize,
            "binary row exceeds 4 GiB"
        );
        self.tail.extend_from_slice(value);
        let slot = (offset as u64) | ((value.len() as u64) << 32);
        self.write_slot(pos, slot);
        self.set_var_len(pos, true);
        self
    }

    pub fn write_str(&mut self, pos: usize, value: &str) -> &mut Self {
        self.write_bytes(pos, value.as_bytes())
    }

    /// Copy field `from` of `row` into field `to`, nulls included.
    pub fn copy_field(&mut self, to: usize, row: &BinaryRow, from: usize) -> &mut Self {
        if row.is_null_at(from) {
            return self.set_null(to);
        }
        if row.is_var_len_at(from) {
            let bytes = row.get_bytes(from).unwrap_or_default().to_vec();
            self.write_bytes(to, &bytes)
        } else {
            self.write_slot(to, row.slot(from));
            self
        }
    }

    pub fn finish(self) -> BinaryRow {
        let mut data = self.fixed;
        data.extend_from_slice(&self.tail);
        BinaryRow {
            data: Bytes::from(data),
        }
    }
}

/// Pull-based row source.
pub trait RowIterator: Send {
    fn next_row(&mut self) -> SmjResult<Option<BinaryRow>>;
}

impl<I: RowIterator + ?Sized> RowIterator for Box<I> {
    fn next_row(&mut self) -> SmjResult<Option<BinaryRow>> {
        (**self).next_row()
    }
}

pub type BoxedRowIterator = Box<dyn RowIterator>;

/// Rows from an in-memory vector, in order.
pub struct VecRowIterator {
    rows: std::vec::IntoIter<BinaryRow>,
}

impl VecRowIterator {
    pub fn new(rows: Vec<BinaryRow>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl RowIterator for VecRowIterator {
    fn next_row(&mut self) -> SmjResult<Option<BinaryRow>> {
        Ok(self.rows.next())
    }
}

/// An iterator that never yields.
pub struct EmptyRowIterator;

impl RowIterator for EmptyRowIterator {
    fn next_row(&mut self) -> SmjResult<Option<BinaryRow>> {
        Ok(None)
    }
}

pub fn collect_rows<I: RowIterator + ?Sized>(iter: &mut I) -> SmjResult<Vec<BinaryRow>> {
    let mut out = Vec::new();
    while let Some(row) = iter.next_row()? {
        out.push(row);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_and_variable_fields() {
        let mut w = BinaryRowWriter::new(4);
        w.write_long(0, -42)
            .write_str(1, "payload")
            .write_int(3, 7);
        let row = w.finish();
        assert_eq!(row.arity(), 4);
        assert_eq!(row.get_long(0), Some(-42));
        assert_eq!(row.get_str(1), Some("payload"));
        assert!(row.is_null_at(2));
        assert_eq!(row.get_long(2), None);
        assert_eq!(row.get_int(3), Some(7));

        let copy = BinaryRow::from_bytes(row.clone().into_bytes()).unwrap();
        assert_eq!(copy, row);
    }

    #[test]
    fn truncated_bytes_are_rejected() {
        let mut w = BinaryRowWriter::new(3);
        w.write_long(0, 1);
        let row = w.finish();
        let short = row.into_bytes().slice(0..5);
        assert!(matches!(
            BinaryRow::from_bytes(short),
            Err(SmjError::CorruptChannel(_))
        ));
    }

    #[test]
    fn copy_field_keeps_var_len_data() {
        let mut w = BinaryRowWriter::new(2);
        w.write_long(0, 11).write_str(1, "payload");
        let src = w.finish();

        let mut out = BinaryRowWriter::new(3);
        out.copy_field(0, &src, 1)
            .copy_field(1, &src, 0)
            .set_null(2);
        let row = out.finish();
        assert_eq!(row.get_str(0), Some("payload"));
        assert_eq!(row.get_long(1), Some(11));
        assert!(row.is_null_at(2));
    }

    #[test]
    fn vec_iterator_drains_in_order() {
        let rows = (0..3)
            .map(|i| {
                let mut w = BinaryRowWriter::new(1);
                w.write_long(0, i);
                w.finish()
            })
            .collect::<Vec<_>>();
        let mut it = VecRowIterator::new(rows.clone());
        assert_eq!(collect_rows(&mut it).unwrap(), rows);
        assert!(it.next_row().unwrap().is_none());
    }
}
