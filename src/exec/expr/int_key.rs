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
//! Reference capabilities for integer equi-join keys.

use std::cmp::Ordering;

use crate::exec::expr::{
    JoinCondition, KeyComparator, KeyProjection, MAX_NORMALIZED_KEY_BYTES,
    NormalizedKeyComputer, Projection,
};
use crate::exec::row::{BinaryRow, BinaryRowWriter};

// One null-flag byte plus eight big-endian value bytes.
const FIELD_KEY_BYTES: usize = 9;

/// Normalized keys over integer key fields, nulls first.
///
/// Each field becomes a flag byte (0 for null, 1 otherwise) followed by the
/// value with its sign bit flipped, big-endian, so unsigned byte order equals
/// signed numeric order. Fields that do not fit the prefix are left to the
/// comparator.
#[derive(Clone, Debug)]
pub struct IntNormalizedKeyComputer {
    num_fields: usize,
}

impl IntNormalizedKeyComputer {
    pub fn new(num_fields: usize) -> Self {
        Self { num_fields }
    }
}

impl NormalizedKeyComputer for IntNormalizedKeyComputer {
    fn num_key_bytes(&self) -> usize {
        (self.num_fields * FIELD_KEY_BYTES).min(MAX_NORMALIZED_KEY_BYTES)
    }

    fn put_key(&self, key: &BinaryRow, target: &mut [u8]) {
        let mut encoded = [0u8; FIELD_KEY_BYTES];
        let mut written = 0;
        for field in 0..self.num_fields {
            if written >= target.len() {
                break;
            }
            match key.get_long(field) {
                None => encoded = [0u8; FIELD_KEY_BYTES],
                Some(v) => {
                    encoded[0] = 1;
                    let flipped = (v as u64) ^ (1u64 << 63);
                    encoded[1..].copy_from_slice(&flipped.to_be_bytes());
                }
            }
            let n = FIELD_KEY_BYTES.min(target.len() - written);
            target[written..written + n].copy_from_slice(&encoded[..n]);
            written += n;
        }
    }

    fn is_key_fully_determines(&self) -> bool {
        self.num_fields * FIELD_KEY_BYTES <= MAX_NORMALIZED_KEY_BYTES
    }
}

/// Field-by-field integer comparison, nulls first.
#[derive(Clone, Debug)]
pub struct IntKeyComparator {
    num_fields: usize,
}

impl IntKeyComparator {
    pub fn new(num_fields: usize) -> Self {
        Self { num_fields }
    }
}

impl KeyComparator for IntKeyComparator {
    fn compare(&self, left: &BinaryRow, right: &BinaryRow) -> Ordering {
        for field in 0..self.num_fields {
            // Option orders None before Some.
            let ord = left.get_long(field).cmp(&right.get_long(field));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Picks the listed fields, in order, as the key row.
#[derive(Clone, Debug)]
pub struct FieldKeyProjection {
    fields: Vec<usize>,
}

impl FieldKeyProjection {
    pub fn new(fields: Vec<usize>) -> Self {
        Self { fields }
    }
}

impl KeyProjection for FieldKeyProjection {
    fn project(&self, row: &BinaryRow) -> BinaryRow {
        let mut writer = BinaryRowWriter::new(self.fields.len());
        for (to, &from) in self.fields.iter().enumerate() {
            writer.copy_field(to, row, from);
        }
        writer.finish()
    }
}

/// No residual predicate.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrueCondition;

impl JoinCondition for TrueCondition {
    fn apply(&self, _left: &BinaryRow, _right: &BinaryRow) -> Result<bool, String> {
        Ok(true)
    }
}

/// Concatenates left fields and right fields; a missing side is all nulls.
#[derive(Clone, Debug)]
pub struct JoinedRowProjection {
    left_arity: usize,
    right_arity: usize,
}

impl JoinedRowProjection {
    pub fn new(left_arity: usize, right_arity: usize) -> Self {
        Self {
            left_arity,
            right_arity,
        }
    }

    /// Output for semi and anti joins, which carry only the left row.
    pub fn left_only(left_arity: usize) -> Self {
        Self::new(left_arity, 0)
    }
}

impl Projection for JoinedRowProjection {
    fn apply(&self, left: Option<&BinaryRow>, right: Option<&BinaryRow>) -> BinaryRow {
        let mut writer = BinaryRowWriter::new(self.left_arity + self.right_arity);
        if let Some(left) = left {
            for i in 0..self.left_arity.min(left.arity()) {
                writer.copy_field(i, left, i);
            }
        }
        if let Some(right) = right {
            for i in 0..self.right_arity.min(right.arity()) {
                writer.copy_field(self.left_arity + i, right, i);
            }
        }
        writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::expr::NormalizedKey;

    fn key(v: Option<i64>) -> BinaryRow {
        let mut w = BinaryRowWriter::new(1);
        if let Some(v) = v {
            w.write_long(0, v);
        }
        w.finish()
    }

    #[test]
    fn prefix_order_matches_comparator() {
        let computer = IntNormalizedKeyComputer::new(1);
        let comparator = IntKeyComparator::new(1);
        assert!(computer.is_key_fully_determines());
        let values = [None, Some(i64::MIN), Some(-5), Some(-1), Some(0), Some(3), Some(i64::MAX)];
        for a in values {
            for b in values {
                let ka = NormalizedKey::compute(&computer, &key(a));
                let kb = NormalizedKey::compute(&computer, &key(b));
                assert_eq!(ka.cmp(&kb), comparator.compare(&key(a), &key(b)), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn wide_keys_are_truncated() {
        let computer = IntNormalizedKeyComputer::new(2);
        assert_eq!(computer.num_key_bytes(), 16);
        assert!(!computer.is_key_fully_determines());
    }

    #[test]
    fn joined_projection_null_fills_missing_side() {
        let mut lw = BinaryRowWriter::new(2);
        lw.write_long(0, 1).write_long(1, 10);
        let left = lw.finish();
        let projection = JoinedRowProjection::new(2, 2);
        let row = projection.apply(Some(&left), None);
        assert_eq!(row.arity(), 4);
        assert_eq!(row.get_long(1), Some(10));
        assert!(row.is_null_at(2));
        assert!(row.is_null_at(3));
    }

    #[test]
    fn field_projection_reorders() {
        let mut w = BinaryRowWriter::new(3);
        w.write_long(0, 1).write_long(1, 2).write_long(2, 3);
        let row = w.finish();
        let key = FieldKeyProjection::new(vec![2, 0]).project(&row);
        assert_eq!(key.get_long(0), Some(3));
        assert_eq!(key.get_long(1), Some(1));
    }
}
