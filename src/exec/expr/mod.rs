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
//! Capabilities the sorter and the join driver are built from.
//!
//! A planner picks concrete implementations and hands them over at
//! construction. All of them must be pure: the same inputs always produce
//! the same answer and nothing outside the call is touched.

pub mod int_key;

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::exec::row::BinaryRow;

/// Upper bound on the normalized key prefix width.
pub const MAX_NORMALIZED_KEY_BYTES: usize = 16;

/// Total order over key rows.
///
/// Must agree with the `NormalizedKeyComputer` used alongside it: when two
/// prefixes differ their byte order is the key order.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, left: &BinaryRow, right: &BinaryRow) -> Ordering;
}

/// Produces a fixed-width prefix whose unsigned byte order is consistent
/// with the `KeyComparator`.
pub trait NormalizedKeyComputer: Send + Sync {
    /// Width of every prefix, at most `MAX_NORMALIZED_KEY_BYTES`.
    fn num_key_bytes(&self) -> usize;

    /// Write the prefix of `key` into `target`, which is exactly
    /// `num_key_bytes()` long.
    fn put_key(&self, key: &BinaryRow, target: &mut [u8]);

    /// True when equal prefixes imply equal keys, so the comparator is never
    /// consulted.
    fn is_key_fully_determines(&self) -> bool;
}

/// Extracts the join key of one side's row.
pub trait KeyProjection: Send + Sync {
    fn project(&self, row: &BinaryRow) -> BinaryRow;
}

/// Residual predicate over a matched pair.
pub trait JoinCondition: Send + Sync {
    fn apply(&self, left: &BinaryRow, right: &BinaryRow) -> Result<bool, String>;
}

/// Builds an output row. `None` stands for the null-filled side of an outer
/// match.
pub trait Projection: Send + Sync {
    fn apply(&self, left: Option<&BinaryRow>, right: Option<&BinaryRow>) -> BinaryRow;
}

/// A join condition backed by a closure.
pub struct FnJoinCondition<F> {
    f: F,
}

impl<F> FnJoinCondition<F>
where
    F: Fn(&BinaryRow, &BinaryRow) -> Result<bool, String> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> JoinCondition for FnJoinCondition<F>
where
    F: Fn(&BinaryRow, &BinaryRow) -> Result<bool, String> + Send + Sync,
{
    fn apply(&self, left: &BinaryRow, right: &BinaryRow) -> Result<bool, String> {
        (self.f)(left, right)
    }
}

/// Inline normalized key prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NormalizedKey {
    buf: [u8; MAX_NORMALIZED_KEY_BYTES],
    len: u8,
}

impl NormalizedKey {
    pub fn empty() -> Self {
        Self {
            buf: [0u8; MAX_NORMALIZED_KEY_BYTES],
            len: 0,
        }
    }

    pub fn compute(computer: &dyn NormalizedKeyComputer, key: &BinaryRow) -> Self {
        let len = computer.num_key_bytes().min(MAX_NORMALIZED_KEY_BYTES);
        let mut out = Self {
            buf: [0u8; MAX_NORMALIZED_KEY_BYTES],
            len: len as u8,
        };
        computer.put_key(key, &mut out.buf[..len]);
        out
    }

    /// Copy a prefix read back from a sort buffer or a spill channel.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let len = bytes.len().min(MAX_NORMALIZED_KEY_BYTES);
        let mut buf = [0u8; MAX_NORMALIZED_KEY_BYTES];
        buf[..len].copy_from_slice(&bytes[..len]);
        Self {
            buf,
            len: len as u8,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Ord for NormalizedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl PartialOrd for NormalizedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for NormalizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NormalizedKey(")?;
        for b in self.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// The key capabilities of one sorted side, bundled so row comparisons read
/// the same everywhere.
#[derive(Clone)]
pub struct SortKeyContext {
    pub key_projection: Arc<dyn KeyProjection>,
    pub normalized_key_computer: Arc<dyn NormalizedKeyComputer>,
    pub comparator: Arc<dyn KeyComparator>,
}

impl SortKeyContext {
    pub fn new(
        key_projection: Arc<dyn KeyProjection>,
        normalized_key_computer: Arc<dyn NormalizedKeyComputer>,
        comparator: Arc<dyn KeyComparator>,
    ) -> Self {
        Self {
            key_projection,
            normalized_key_computer,
            comparator,
        }
    }

    pub fn key_bytes(&self) -> usize {
        self.normalized_key_computer
            .num_key_bytes()
            .min(MAX_NORMALIZED_KEY_BYTES)
    }

    pub fn normalized_key(&self, row: &BinaryRow) -> NormalizedKey {
        let key = self.key_projection.project(row);
        NormalizedKey::compute(self.normalized_key_computer.as_ref(), &key)
    }

    pub fn fully_determines(&self) -> bool {
        self.normalized_key_computer.is_key_fully_determines()
    }

    /// Prefix first, then the comparator on a prefix tie.
    pub fn compare(
        &self,
        left_key: &NormalizedKey,
        left: &BinaryRow,
        right_key: &NormalizedKey,
        right: &BinaryRow,
    ) -> Ordering {
        match left_key.cmp(right_key) {
            Ordering::Equal if !self.fully_determines() => self.compare_rows(left, right),
            ord => ord,
        }
    }

    pub fn compare_rows(&self, left: &BinaryRow, right: &BinaryRow) -> Ordering {
        let lk = self.key_projection.project(left);
        let rk = self.key_projection.project(right);
        self.comparator.compare(&lk, &rk)
    }
}

impl fmt::Debug for SortKeyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortKeyContext")
            .field("key_bytes", &self.key_bytes())
            .field("fully_determines", &self.fully_determines())
            .finish()
    }
}
