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
//! Merge-join state machine over two key-ordered inputs.
//!
//! The driver pulls one output row at a time. Equal-key runs on both sides
//! (join groups) are buffered in full, then their cross product is walked
//! lazily so a large group does not materialize its output.
//!
//! Current limitations:
//! - A join group must fit in memory. `max_join_group_bytes` bounds it and
//!   turns an oversized group into `MemoryExhausted`; there is no side spill.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::common::error::{SmjError, SmjResult};
use crate::exec::expr::{JoinCondition, KeyComparator, KeyProjection, Projection};
use crate::exec::node::join::JoinType;
use crate::exec::row::{BinaryRow, BoxedRowIterator, RowIterator};
use crate::runtime::mem_tracker::{MemTracker, TrackedBytes};

use super::sort_merge_join_operator::SortMergeJoinFunctions;

struct KeyedRow {
    row: BinaryRow,
    key: BinaryRow,
    null_key: bool,
}

/// One side's input with a single row of look-ahead.
struct Cursor {
    input: BoxedRowIterator,
    key_projection: Arc<dyn KeyProjection>,
    filter_nulls: Arc<[bool]>,
    peeked: Option<KeyedRow>,
    exhausted: bool,
}

impl Cursor {
    fn new(
        input: BoxedRowIterator,
        key_projection: Arc<dyn KeyProjection>,
        filter_nulls: Arc<[bool]>,
    ) -> Self {
        Self {
            input,
            key_projection,
            filter_nulls,
            peeked: None,
            exhausted: false,
        }
    }

    /// Load the next row into the look-ahead slot. Returns whether one is
    /// available.
    fn fill(&mut self) -> SmjResult<bool> {
        if self.peeked.is_some() {
            return Ok(true);
        }
        if self.exhausted {
            return Ok(false);
        }
        match self.input.next_row()? {
            Some(row) => {
                let key = self.key_projection.project(&row);
                let null_key = self
                    .filter_nulls
                    .iter()
                    .enumerate()
                    .any(|(i, reject)| *reject && i < key.arity() && key.is_null_at(i));
                self.peeked = Some(KeyedRow { row, key, null_key });
                Ok(true)
            }
            None => {
                self.exhausted = true;
                Ok(false)
            }
        }
    }

    fn take(&mut self) -> SmjResult<Option<KeyedRow>> {
        self.fill()?;
        Ok(self.peeked.take())
    }
}

/// Rows of one side sharing a key, with their bytes charged to the group
/// tracker until the group is dropped.
struct JoinGroup {
    rows: Vec<BinaryRow>,
    _reservations: Vec<TrackedBytes>,
}

impl JoinGroup {
    fn len(&self) -> usize {
        self.rows.len()
    }
}

enum GroupPhase {
    Pairs,
    UnmatchedRight(usize),
}

struct GroupState {
    left: JoinGroup,
    right: JoinGroup,
    li: usize,
    rj: usize,
    left_matched: bool,
    right_matched: Vec<bool>,
    phase: GroupPhase,
}

enum DriverState {
    Init,
    Compare,
    EmitGroup(Box<GroupState>),
    DrainLeft,
    DrainRight,
    Done,
}

impl DriverState {
    fn name(&self) -> &'static str {
        match self {
            DriverState::Init => "INIT",
            DriverState::Compare => "COMPARE",
            DriverState::EmitGroup(_) => "EMIT_GROUP",
            DriverState::DrainLeft => "DRAIN_LEFT",
            DriverState::DrainRight => "DRAIN_RIGHT",
            DriverState::Done => "DONE",
        }
    }
}

enum Step {
    EmitLeft,
    EmitRight,
    SkipLeft,
    SkipRight,
    Group,
}

pub struct MergeJoinDriver {
    join_type: JoinType,
    left: Cursor,
    right: Cursor,
    comparator: Arc<dyn KeyComparator>,
    condition: Arc<dyn JoinCondition>,
    projection: Arc<dyn Projection>,
    group_tracker: Arc<MemTracker>,
    state: DriverState,
    output_rows: u64,
    peak_group_bytes: i64,
}

impl MergeJoinDriver {
    /// `max_group_bytes` of 0 leaves join groups bounded only by memory.
    pub fn new(
        join_type: JoinType,
        functions: &SortMergeJoinFunctions,
        left: BoxedRowIterator,
        right: BoxedRowIterator,
        max_group_bytes: u64,
    ) -> Self {
        let limit = if max_group_bytes == 0 {
            -1
        } else {
            i64::try_from(max_group_bytes).unwrap_or(i64::MAX)
        };
        let filter_nulls: Arc<[bool]> = Arc::from(functions.filter_nulls.as_slice());
        Self {
            join_type,
            left: Cursor::new(
                left,
                Arc::clone(&functions.left_key_projection),
                Arc::clone(&filter_nulls),
            ),
            right: Cursor::new(
                right,
                Arc::clone(&functions.right_key_projection),
                filter_nulls,
            ),
            comparator: Arc::clone(&functions.comparator),
            condition: Arc::clone(&functions.condition),
            projection: Arc::clone(&functions.projection),
            group_tracker: MemTracker::new_root_with_limit("JoinGroups", limit),
            state: DriverState::Init,
            output_rows: 0,
            peak_group_bytes: 0,
        }
    }

    pub fn output_rows(&self) -> u64 {
        self.output_rows
    }

    pub fn peak_group_bytes(&self) -> i64 {
        self.peak_group_bytes
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, DriverState::Done)
    }

    fn project(&mut self, left: Option<&BinaryRow>, right: Option<&BinaryRow>) -> BinaryRow {
        self.output_rows += 1;
        self.projection.apply(left, right)
    }

    fn passes(&self, left: &BinaryRow, right: &BinaryRow) -> SmjResult<bool> {
        self.condition
            .apply(left, right)
            .map_err(SmjError::ConditionEvaluation)
    }

    fn next_step(&mut self) -> SmjResult<Option<Step>> {
        let has_left = self.left.fill()?;
        let has_right = self.right.fill()?;
        let (Some(l), Some(r)) = (self.left.peeked.as_ref(), self.right.peeked.as_ref()) else {
            self.state = match (has_left, has_right) {
                (true, false) => DriverState::DrainLeft,
                (false, true) => DriverState::DrainRight,
                _ => DriverState::Done,
            };
            return Ok(None);
        };
        let left_step = if self.join_type.emits_unmatched_left() {
            Step::EmitLeft
        } else {
            Step::SkipLeft
        };
        let right_step = if self.join_type.emits_unmatched_right() {
            Step::EmitRight
        } else {
            Step::SkipRight
        };
        if l.null_key {
            return Ok(Some(left_step));
        }
        if r.null_key {
            return Ok(Some(right_step));
        }
        Ok(Some(match self.comparator.compare(&l.key, &r.key) {
            Ordering::Less => left_step,
            Ordering::Greater => right_step,
            Ordering::Equal => Step::Group,
        }))
    }

    fn collect_group(
        cursor: &mut Cursor,
        comparator: &dyn KeyComparator,
        tracker: &Arc<MemTracker>,
    ) -> SmjResult<JoinGroup> {
        let mut group = JoinGroup {
            rows: Vec::new(),
            _reservations: Vec::new(),
        };
        let Some(first) = cursor.take()? else {
            return Ok(group);
        };
        let key = first.key;
        let mut next = Some(first.row);
        while let Some(row) = next.take() {
            let reservation = TrackedBytes::try_new(row.len(), Arc::clone(tracker))
                .ok_or_else(|| {
                    SmjError::MemoryExhausted(format!(
                        "join group exceeds max_join_group_bytes={} after {} rows",
                        tracker.limit(),
                        group.rows.len()
                    ))
                })?;
            group._reservations.push(reservation);
            group.rows.push(row);
            if !cursor.fill()? {
                break;
            }
            let same_key = cursor
                .peeked
                .as_ref()
                .is_some_and(|p| !p.null_key && comparator.compare(&key, &p.key).is_eq());
            if same_key {
                next = cursor.take()?.map(|p| p.row);
            }
        }
        Ok(group)
    }

    fn start_group(&mut self) -> SmjResult<()> {
        let left = Self::collect_group(&mut self.left, self.comparator.as_ref(), &self.group_tracker)?;
        let right =
            Self::collect_group(&mut self.right, self.comparator.as_ref(), &self.group_tracker)?;
        self.peak_group_bytes = self.peak_group_bytes.max(self.group_tracker.current());
        let right_matched = vec![false; right.len()];
        self.state = DriverState::EmitGroup(Box::new(GroupState {
            left,
            right,
            li: 0,
            rj: 0,
            left_matched: false,
            right_matched,
            phase: GroupPhase::Pairs,
        }));
        Ok(())
    }

    /// Advance the current join group. `None` means the group is finished.
    fn step_group(&mut self, group: &mut GroupState) -> SmjResult<Option<BinaryRow>> {
        loop {
            match group.phase {
                GroupPhase::Pairs => {
                    let Some(left) = group.left.rows.get(group.li) else {
                        group.phase = GroupPhase::UnmatchedRight(0);
                        continue;
                    };
                    if self.join_type.is_semi_or_anti() {
                        let mut matched = false;
                        for right in &group.right.rows {
                            if self.passes(left, right)? {
                                matched = true;
                                break;
                            }
                        }
                        group.li += 1;
                        if matched == (self.join_type == JoinType::LeftSemi) {
                            return Ok(Some(self.project(Some(left), None)));
                        }
                        continue;
                    }
                    let Some(right) = group.right.rows.get(group.rj) else {
                        let emit = !group.left_matched && self.join_type.emits_unmatched_left();
                        group.li += 1;
                        group.rj = 0;
                        group.left_matched = false;
                        if emit {
                            return Ok(Some(self.project(Some(left), None)));
                        }
                        continue;
                    };
                    let idx = group.rj;
                    group.rj += 1;
                    if self.passes(left, right)? {
                        group.left_matched = true;
                        group.right_matched[idx] = true;
                        return Ok(Some(self.project(Some(left), Some(right))));
                    }
                }
                GroupPhase::UnmatchedRight(idx) => {
                    if !self.join_type.emits_unmatched_right() {
                        return Ok(None);
                    }
                    let Some(pos) = (idx..group.right.len()).find(|&i| !group.right_matched[i])
                    else {
                        return Ok(None);
                    };
                    group.phase = GroupPhase::UnmatchedRight(pos + 1);
                    return Ok(Some(self.project(None, Some(&group.right.rows[pos]))));
                }
            }
        }
    }
}

impl RowIterator for MergeJoinDriver {
    fn next_row(&mut self) -> SmjResult<Option<BinaryRow>> {
        loop {
            match std::mem::replace(&mut self.state, DriverState::Compare) {
                DriverState::Init | DriverState::Compare => {
                    let Some(step) = self.next_step()? else {
                        continue;
                    };
                    match step {
                        Step::EmitLeft => {
                            if let Some(l) = self.left.take()? {
                                return Ok(Some(self.project(Some(&l.row), None)));
                            }
                        }
                        Step::EmitRight => {
                            if let Some(r) = self.right.take()? {
                                return Ok(Some(self.project(None, Some(&r.row))));
                            }
                        }
                        Step::SkipLeft => {
                            self.left.take()?;
                        }
                        Step::SkipRight => {
                            self.right.take()?;
                        }
                        Step::Group => self.start_group()?,
                    }
                }
                DriverState::EmitGroup(mut group) => {
                    if let Some(row) = self.step_group(&mut group)? {
                        self.state = DriverState::EmitGroup(group);
                        return Ok(Some(row));
                    }
                }
                DriverState::DrainLeft => {
                    let Some(l) = self.left.take()? else {
                        self.state = DriverState::Done;
                        continue;
                    };
                    self.state = DriverState::DrainLeft;
                    if self.join_type.emits_unmatched_left() {
                        return Ok(Some(self.project(Some(&l.row), None)));
                    }
                }
                DriverState::DrainRight => {
                    let Some(r) = self.right.take()? else {
                        self.state = DriverState::Done;
                        continue;
                    };
                    self.state = DriverState::DrainRight;
                    if self.join_type.emits_unmatched_right() {
                        return Ok(Some(self.project(None, Some(&r.row))));
                    }
                }
                DriverState::Done => {
                    self.state = DriverState::Done;
                    return Ok(None);
                }
            }
        }
    }
}
