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
//! Sort-merge join operator.
//!
//! Responsibilities:
//! - Split the memory budget into one segment pool per side.
//! - Feed each side into its external sorter until `end_input`.
//! - Drive the merge join over both sorted streams on demand.
//! - On close or cancel, return every segment and prove nothing leaked.

use std::fmt;
use std::sync::Arc;

use crate::common::config;
use crate::common::error::{SmjError, SmjResult};
use crate::exec::expr::{
    JoinCondition, KeyComparator, KeyProjection, NormalizedKeyComputer, Projection,
    SortKeyContext,
};
use crate::exec::node::join::JoinType;
use crate::exec::operators::sort::{ExternalSorter, SorterSettings};
use crate::exec::row::{BinaryRow, RowIterator};
use crate::exec::spill::{ChannelManager, SpillProfile, SpillSettings};
use crate::novarocks_logging::{error, info};
use crate::runtime::memory_manager::{MemoryManager, SegmentPool};
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile};
use crate::runtime::state::ListState;

use super::merge_join_core::MergeJoinDriver;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Left => "Left",
            Side::Right => "Right",
        }
    }
}

/// Capabilities injected by whoever planned the join.
#[derive(Clone)]
pub struct SortMergeJoinFunctions {
    pub left_key_projection: Arc<dyn KeyProjection>,
    pub right_key_projection: Arc<dyn KeyProjection>,
    /// Shared by both sides; works on projected key rows.
    pub normalized_key_computer: Arc<dyn NormalizedKeyComputer>,
    pub comparator: Arc<dyn KeyComparator>,
    pub condition: Arc<dyn JoinCondition>,
    pub projection: Arc<dyn Projection>,
    /// `filter_nulls[i]`: a null in key field `i` never matches.
    pub filter_nulls: Vec<bool>,
}

impl SortMergeJoinFunctions {
    fn sort_key_context(&self, side: Side) -> SortKeyContext {
        let projection = match side {
            Side::Left => Arc::clone(&self.left_key_projection),
            Side::Right => Arc::clone(&self.right_key_projection),
        };
        SortKeyContext::new(
            projection,
            Arc::clone(&self.normalized_key_computer),
            Arc::clone(&self.comparator),
        )
    }
}

impl fmt::Debug for SortMergeJoinFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortMergeJoinFunctions")
            .field("key_bytes", &self.normalized_key_computer.num_key_bytes())
            .field("filter_nulls", &self.filter_nulls)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct SortMergeJoinConfig {
    pub memory_total_bytes: u64,
    pub segment_size_bytes: usize,
    /// Segments each side reserves at open.
    pub min_segments_per_side: usize,
    /// 0 leaves join groups bounded only by memory.
    pub max_join_group_bytes: u64,
    pub sorter: SorterSettings,
    pub spill: SpillSettings,
}

impl SortMergeJoinConfig {
    pub fn from_app_config() -> Self {
        Self {
            memory_total_bytes: config::memory_total_bytes(),
            segment_size_bytes: config::memory_segment_size_bytes(),
            min_segments_per_side: config::sort_min_segments_per_side(),
            max_join_group_bytes: config::join_max_group_bytes(),
            sorter: SorterSettings::from_app_config(),
            spill: SpillSettings::from_app_config(),
        }
    }

    pub fn validate(&self) -> SmjResult<()> {
        if self.segment_size_bytes == 0 {
            return Err(SmjError::Internal(
                "memory.segment_size_bytes must be positive".to_string(),
            ));
        }
        if self.min_segments_per_side < 2 {
            return Err(SmjError::Internal(format!(
                "sort.min_segments_per_side must be at least 2, got {}",
                self.min_segments_per_side
            )));
        }
        self.sorter.validate()?;
        self.spill.validate()
    }
}

/// Progress a wrapper may checkpoint through `ListState`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JoinProgress {
    pub left_input_rows: u64,
    pub right_input_rows: u64,
    pub output_rows: u64,
    pub phase: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    Created,
    Consuming,
    Producing,
    Finished,
    Closed,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Created => "CREATED",
            Phase::Consuming => "CONSUMING",
            Phase::Producing => "PRODUCING",
            Phase::Finished => "FINISHED",
            Phase::Closed => "CLOSED",
        }
    }
}

#[derive(Clone, Debug)]
struct OperatorCounters {
    left_input_rows: CounterRef,
    right_input_rows: CounterRef,
    output_rows: CounterRef,
    peak_join_group_bytes: CounterRef,
    peak_segments: CounterRef,
}

impl OperatorCounters {
    fn new(profile: &RuntimeProfile) -> Self {
        Self {
            left_input_rows: profile.add_counter("LeftInputRows", CounterUnit::Unit),
            right_input_rows: profile.add_counter("RightInputRows", CounterUnit::Unit),
            output_rows: profile.add_counter("OutputRows", CounterUnit::Unit),
            peak_join_group_bytes: profile.add_counter("PeakJoinGroupBytes", CounterUnit::Bytes),
            peak_segments: profile.add_counter("PeakSegments", CounterUnit::Unit),
        }
    }
}

pub struct SortMergeJoinOperator {
    join_type: JoinType,
    functions: SortMergeJoinFunctions,
    config: SortMergeJoinConfig,
    memory: Option<MemoryManager>,
    owns_memory: bool,
    profile: RuntimeProfile,
    counters: OperatorCounters,
    channel_manager: Option<Arc<ChannelManager>>,
    left_sorter: Option<ExternalSorter>,
    right_sorter: Option<ExternalSorter>,
    left_done: bool,
    right_done: bool,
    driver: Option<MergeJoinDriver>,
    phase: Phase,
}

impl SortMergeJoinOperator {
    pub fn new(
        join_type: JoinType,
        functions: SortMergeJoinFunctions,
        config: SortMergeJoinConfig,
    ) -> Self {
        let profile = RuntimeProfile::new("SORT_MERGE_JOIN");
        profile.add_info_string("JoinType", join_type.as_str());
        Self {
            join_type,
            functions,
            config,
            memory: None,
            owns_memory: true,
            counters: OperatorCounters::new(&profile),
            profile,
            channel_manager: None,
            left_sorter: None,
            right_sorter: None,
            left_done: false,
            right_done: false,
            driver: None,
            phase: Phase::Created,
        }
    }

    /// Draw segments from a manager shared with other operators. Close then
    /// checks only this operator's pools.
    pub fn with_memory_manager(mut self, memory: MemoryManager) -> Self {
        self.memory = Some(memory);
        self.owns_memory = false;
        self
    }

    pub fn join_type(&self) -> JoinType {
        self.join_type
    }

    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    pub fn memory_manager(&self) -> Option<&MemoryManager> {
        self.memory.as_ref()
    }

    pub fn open(&mut self) -> SmjResult<()> {
        if self.phase != Phase::Created {
            return Err(SmjError::Internal(format!(
                "open called in phase {}",
                self.phase.as_str()
            )));
        }
        self.config.validate()?;
        let memory = match &self.memory {
            Some(memory) => memory.clone(),
            None => {
                let memory = MemoryManager::new(
                    self.config.memory_total_bytes,
                    self.config.segment_size_bytes,
                )?;
                self.memory = Some(memory.clone());
                memory
            }
        };
        let share = memory.total_segments() / 2;
        let min = self.config.min_segments_per_side;
        if share < min {
            return Err(SmjError::MemoryExhausted(format!(
                "budget of {} segments leaves {share} per side, below the guaranteed {min}",
                memory.total_segments()
            )));
        }

        let channel_manager = Arc::new(ChannelManager::new(
            &self.config.spill,
            SpillProfile::new(&self.profile),
        )?);
        let left_pool = SegmentPool::new(memory.clone(), Side::Left.as_str(), min, share)?;
        let right_pool = SegmentPool::new(memory.clone(), Side::Right.as_str(), min, share)?;
        self.left_sorter = Some(ExternalSorter::new(
            Side::Left.as_str(),
            self.functions.sort_key_context(Side::Left),
            left_pool,
            Arc::clone(&channel_manager),
            self.config.sorter.clone(),
            &self.profile,
        )?);
        self.right_sorter = Some(ExternalSorter::new(
            Side::Right.as_str(),
            self.functions.sort_key_context(Side::Right),
            right_pool,
            Arc::clone(&channel_manager),
            self.config.sorter.clone(),
            &self.profile,
        )?);
        self.channel_manager = Some(channel_manager);
        self.phase = Phase::Consuming;
        info!(
            "SortMergeJoin open: join_type={} segments={} segment_size={} per_side=[{}, {}]",
            self.join_type,
            memory.total_segments(),
            memory.segment_size(),
            min,
            share
        );
        Ok(())
    }

    fn sorter_mut(&mut self, side: Side) -> SmjResult<&mut ExternalSorter> {
        let sorter = match side {
            Side::Left => self.left_sorter.as_mut(),
            Side::Right => self.right_sorter.as_mut(),
        };
        sorter.ok_or_else(|| SmjError::Internal(format!("{} sorter is not open", side.as_str())))
    }

    fn side_done(&self, side: Side) -> bool {
        match side {
            Side::Left => self.left_done,
            Side::Right => self.right_done,
        }
    }

    pub fn process_element(&mut self, side: Side, row: BinaryRow) -> SmjResult<()> {
        if self.phase != Phase::Consuming || self.side_done(side) {
            return Err(SmjError::Internal(format!(
                "{} row received in phase {}",
                side.as_str(),
                self.phase.as_str()
            )));
        }
        self.sorter_mut(side)?.add(row)?;
        match side {
            Side::Left => self.counters.left_input_rows.add(1),
            Side::Right => self.counters.right_input_rows.add(1),
        }
        self.track_peak_segments();
        Ok(())
    }

    /// Mark one side's input complete. Once both are, the sorted streams are
    /// produced and the join becomes readable through `next_output`.
    pub fn end_input(&mut self, side: Side) -> SmjResult<()> {
        if self.phase != Phase::Consuming {
            return Err(SmjError::Internal(format!(
                "end_input({}) in phase {}",
                side.as_str(),
                self.phase.as_str()
            )));
        }
        match side {
            Side::Left => self.left_done = true,
            Side::Right => self.right_done = true,
        }
        if !(self.left_done && self.right_done) {
            return Ok(());
        }
        let left = self.sorter_mut(Side::Left)?.finish()?;
        let right = self.sorter_mut(Side::Right)?.finish()?;
        self.track_peak_segments();
        self.driver = Some(MergeJoinDriver::new(
            self.join_type,
            &self.functions,
            Box::new(left),
            Box::new(right),
            self.config.max_join_group_bytes,
        ));
        self.phase = Phase::Producing;
        Ok(())
    }

    /// Next joined row, `None` once the join is complete.
    pub fn next_output(&mut self) -> SmjResult<Option<BinaryRow>> {
        match self.phase {
            Phase::Producing => {}
            Phase::Finished => return Ok(None),
            phase => {
                return Err(SmjError::Internal(format!(
                    "output requested in phase {}",
                    phase.as_str()
                )));
            }
        }
        let driver = self
            .driver
            .as_mut()
            .ok_or_else(|| SmjError::Internal("join driver missing".to_string()))?;
        let next = driver.next_row()?;
        self.counters
            .peak_join_group_bytes
            .set_max(driver.peak_group_bytes());
        match next {
            Some(row) => {
                self.counters.output_rows.add(1);
                Ok(Some(row))
            }
            None => {
                self.phase = Phase::Finished;
                // Drained inputs hold nothing worth keeping until close.
                self.driver = None;
                Ok(None)
            }
        }
    }

    pub fn progress(&self) -> JoinProgress {
        JoinProgress {
            left_input_rows: self.counters.left_input_rows.value() as u64,
            right_input_rows: self.counters.right_input_rows.value() as u64,
            output_rows: self.counters.output_rows.value() as u64,
            phase: self.phase.as_str().to_string(),
        }
    }

    /// Replace the wrapper's checkpointed progress with the current one.
    pub fn snapshot_progress(&self, state: &dyn ListState<JoinProgress>) -> SmjResult<()> {
        state.update(vec![self.progress()])
    }

    fn track_peak_segments(&self) {
        if let Some(memory) = &self.memory {
            self.counters.peak_segments.set_max(memory.peak() as i64);
        }
    }

    /// Stop prefetching and spill writes, then close.
    pub fn cancel(&mut self) -> SmjResult<()> {
        if let Some(channel_manager) = &self.channel_manager {
            channel_manager.cancel();
        }
        info!("SortMergeJoin cancel: phase={}", self.phase.as_str());
        self.close()
    }

    /// Release every segment and verify the pools. Safe to call more than
    /// once; only the first call does work.
    pub fn close(&mut self) -> SmjResult<()> {
        if self.phase == Phase::Closed {
            return Ok(());
        }
        let phase = self.phase;
        self.phase = Phase::Closed;
        // Streams first: dropping readers joins their prefetches and hands
        // segments back before the pools are checked.
        self.driver = None;

        let mut first_err: Option<SmjError> = None;
        for mut sorter in [self.left_sorter.take(), self.right_sorter.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = sorter.close() {
                error!("SortMergeJoin close: {} sorter: {}", sorter.label(), e);
                first_err.get_or_insert(e);
            }
        }
        self.channel_manager = None;

        if self.owns_memory
            && let Some(memory) = &self.memory
            && !memory.verify_empty()
        {
            let leaked = memory.outstanding();
            error!("SortMergeJoin close: {} memory segments leaked", leaked);
            first_err.get_or_insert(SmjError::Internal(format!(
                "{leaked} memory segments outstanding after close"
            )));
        }

        info!(
            "SortMergeJoin close: phase={} left_rows={} right_rows={} output_rows={}",
            phase.as_str(),
            self.counters.left_input_rows.value(),
            self.counters.right_input_rows.value(),
            self.counters.output_rows.value()
        );
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::expr::int_key::{
        FieldKeyProjection, IntKeyComparator, IntNormalizedKeyComputer, JoinedRowProjection,
        TrueCondition,
    };
    use crate::exec::row::BinaryRowWriter;
    use crate::runtime::state::InMemoryListState;

    fn functions() -> SortMergeJoinFunctions {
        SortMergeJoinFunctions {
            left_key_projection: Arc::new(FieldKeyProjection::new(vec![0])),
            right_key_projection: Arc::new(FieldKeyProjection::new(vec![0])),
            normalized_key_computer: Arc::new(IntNormalizedKeyComputer::new(1)),
            comparator: Arc::new(IntKeyComparator::new(1)),
            condition: Arc::new(TrueCondition),
            projection: Arc::new(JoinedRowProjection::new(1, 1)),
            filter_nulls: vec![true],
        }
    }

    fn config(dir: &std::path::Path, total_bytes: u64) -> SortMergeJoinConfig {
        SortMergeJoinConfig {
            memory_total_bytes: total_bytes,
            segment_size_bytes: 1024,
            min_segments_per_side: 4,
            max_join_group_bytes: 0,
            sorter: SorterSettings::default(),
            spill: SpillSettings {
                local_dirs: vec![dir.to_path_buf()],
                compression_enabled: true,
                compression_block_size_bytes: 64 * 1024,
            },
        }
    }

    fn key_row(k: i64) -> BinaryRow {
        let mut w = BinaryRowWriter::new(1);
        w.write_long(0, k);
        w.finish()
    }

    #[test]
    fn lifecycle_misuse_is_internal() {
        let dir = tempfile::tempdir().unwrap();
        let mut op =
            SortMergeJoinOperator::new(JoinType::Inner, functions(), config(dir.path(), 64 * 1024));
        assert!(matches!(
            op.process_element(Side::Left, key_row(1)),
            Err(SmjError::Internal(_))
        ));
        op.open().unwrap();
        assert!(matches!(op.next_output(), Err(SmjError::Internal(_))));
        op.end_input(Side::Left).unwrap();
        assert!(op.process_element(Side::Left, key_row(1)).is_err());
        op.close().unwrap();
        op.close().unwrap();
        assert!(op.memory_manager().unwrap().verify_empty());
    }

    #[test]
    fn budget_below_guaranteed_minimum_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut op =
            SortMergeJoinOperator::new(JoinType::Inner, functions(), config(dir.path(), 4 * 1024));
        assert!(matches!(op.open(), Err(SmjError::MemoryExhausted(_))));
        op.close().unwrap();
    }

    #[test]
    fn progress_snapshot_goes_through_list_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut op =
            SortMergeJoinOperator::new(JoinType::Inner, functions(), config(dir.path(), 64 * 1024));
        op.open().unwrap();
        for k in 0..5 {
            op.process_element(Side::Left, key_row(k)).unwrap();
            op.process_element(Side::Right, key_row(k)).unwrap();
        }
        op.end_input(Side::Right).unwrap();
        op.end_input(Side::Left).unwrap();
        let mut rows = 0;
        while op.next_output().unwrap().is_some() {
            rows += 1;
        }
        assert_eq!(rows, 5);

        let state = InMemoryListState::new();
        op.snapshot_progress(&state).unwrap();
        let progress = state.get().unwrap();
        assert_eq!(
            progress,
            vec![JoinProgress {
                left_input_rows: 5,
                right_input_rows: 5,
                output_rows: 5,
                phase: "FINISHED".to_string(),
            }]
        );
        op.close().unwrap();
        assert_eq!(op.profile().counter_value("OutputRows"), Some(5));
        assert!(op.memory_manager().unwrap().verify_empty());
    }
}
