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
use std::collections::VecDeque;
use std::sync::Arc;

use crate::common::config;
use crate::common::error::{SmjError, SmjResult};
use crate::exec::expr::{NormalizedKey, SortKeyContext};
use crate::exec::row::{BinaryRow, RowIterator};
use crate::exec::spill::{ChannelHandle, ChannelManager};
use crate::novarocks_logging::{debug, info};
use crate::runtime::memory_manager::{MemorySegment, SegmentPool};
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile, ScopedTimer};

use super::merge_iterator::{MergeIterator, MergeSource};
use super::sort_buffer::{SortBuffer, SortedRun};

#[derive(Clone, Debug)]
pub struct SorterSettings {
    /// Upper bound on channels merged at once.
    pub max_num_file_handles: usize,
    /// Give readers a second segment for prefetching when memory allows.
    pub async_merge: bool,
}

impl SorterSettings {
    pub fn from_app_config() -> Self {
        Self {
            max_num_file_handles: config::sort_max_num_file_handles(),
            async_merge: config::sort_async_merge_enabled(),
        }
    }

    pub fn validate(&self) -> SmjResult<()> {
        if self.max_num_file_handles < 2 {
            return Err(SmjError::Internal(format!(
                "sort.max_num_file_handles must be at least 2, got {}",
                self.max_num_file_handles
            )));
        }
        Ok(())
    }
}

impl Default for SorterSettings {
    fn default() -> Self {
        Self {
            max_num_file_handles: 128,
            async_merge: true,
        }
    }
}

#[derive(Clone, Debug)]
struct SorterProfile {
    input_rows: CounterRef,
    sort_time: CounterRef,
    spilled_runs: CounterRef,
    merge_rounds: CounterRef,
    peak_buffer_segments: CounterRef,
}

impl SorterProfile {
    fn new(profile: &RuntimeProfile) -> Self {
        Self {
            input_rows: profile.add_counter("InputRows", CounterUnit::Unit),
            sort_time: profile.add_timer("SortTime"),
            spilled_runs: profile.add_counter("SpilledRuns", CounterUnit::Unit),
            merge_rounds: profile.add_counter("MergeRounds", CounterUnit::Unit),
            peak_buffer_segments: profile.add_counter("PeakBufferSegments", CounterUnit::Unit),
        }
    }
}

/// Sorted output of one side.
pub enum SortedStream {
    Empty,
    Memory(SortedRun),
    Merge(MergeIterator),
}

impl SortedStream {
    pub fn next_keyed(&mut self) -> SmjResult<Option<(NormalizedKey, BinaryRow)>> {
        match self {
            SortedStream::Empty => Ok(None),
            SortedStream::Memory(run) => run.next_keyed(),
            SortedStream::Merge(merger) => merger.next_keyed(),
        }
    }
}

impl RowIterator for SortedStream {
    fn next_row(&mut self) -> SmjResult<Option<BinaryRow>> {
        Ok(self.next_keyed()?.map(|(_, row)| row))
    }
}

/// Memory-bounded sorter for one join input.
///
/// Rows accumulate in a `SortBuffer`; a full buffer is sorted and written to
/// a spill channel. `finish` merges the channels, in several rounds when
/// there are more than the file-handle limit or reader memory allows.
pub struct ExternalSorter {
    label: String,
    ctx: Arc<SortKeyContext>,
    pool: SegmentPool,
    buffer: SortBuffer,
    channels: VecDeque<ChannelHandle>,
    channel_manager: Arc<ChannelManager>,
    // Staging segment for channel writers, held for the sorter's lifetime.
    write_segment: Option<MemorySegment>,
    settings: SorterSettings,
    profile: SorterProfile,
    finished: bool,
}

impl ExternalSorter {
    pub fn new(
        label: impl Into<String>,
        ctx: SortKeyContext,
        mut pool: SegmentPool,
        channel_manager: Arc<ChannelManager>,
        settings: SorterSettings,
        profile: &RuntimeProfile,
    ) -> SmjResult<Self> {
        let label = label.into();
        settings.validate()?;
        let buffer = SortBuffer::new(ctx.clone(), pool.segment_size())?;
        let write_segment = pool.next_segment().ok_or_else(|| {
            SmjError::MemoryExhausted(format!("{label}: no segment left for the spill writer"))
        })?;
        Ok(Self {
            profile: SorterProfile::new(&profile.child(format!("{label}Sorter"))),
            label,
            ctx: Arc::new(ctx),
            pool,
            buffer,
            channels: VecDeque::new(),
            channel_manager,
            write_segment: Some(write_segment),
            settings,
            finished: false,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn buffered_rows(&self) -> usize {
        self.buffer.len()
    }

    pub fn held_segments(&self) -> usize {
        self.pool.held()
    }

    pub fn merge_rounds(&self) -> i64 {
        self.profile.merge_rounds.value()
    }

    pub fn add(&mut self, row: BinaryRow) -> SmjResult<()> {
        if self.finished {
            return Err(SmjError::Internal(format!(
                "{}: row added after end of input",
                self.label
            )));
        }
        let key = self.ctx.normalized_key(&row);
        if !self.buffer.append(&key, &row, &mut self.pool)? {
            if self.buffer.is_empty() {
                return Err(self.row_too_large(&row));
            }
            self.spill_buffer()?;
            if !self.buffer.append(&key, &row, &mut self.pool)? {
                return Err(self.row_too_large(&row));
            }
        }
        self.profile.input_rows.add(1);
        self.profile
            .peak_buffer_segments
            .set_max(self.buffer.occupied_segments() as i64);
        Ok(())
    }

    fn row_too_large(&self, row: &BinaryRow) -> SmjError {
        SmjError::MemoryExhausted(format!(
            "{}: row of {} bytes does not fit in {} available segments of {} bytes",
            self.label,
            row.len(),
            self.pool.available() + self.buffer.occupied_segments(),
            self.pool.segment_size()
        ))
    }

    fn sort_buffer(&mut self) -> SmjResult<()> {
        let _timer = ScopedTimer::new(Arc::clone(&self.profile.sort_time));
        self.buffer.sort()
    }

    fn take_write_segment(&mut self) -> SmjResult<MemorySegment> {
        self.write_segment.take().ok_or_else(|| {
            SmjError::Internal(format!("{}: spill writer segment already in use", self.label))
        })
    }

    /// Sort the buffer and write it out as one channel. The buffer keeps its
    /// segments for the next run.
    fn spill_buffer(&mut self) -> SmjResult<()> {
        self.sort_buffer()?;
        let staging = self.take_write_segment()?;
        let mut writer = self
            .channel_manager
            .create_channel(self.buffer.key_len(), staging)?;
        let buffer = &self.buffer;
        let written = (0..buffer.len()).try_for_each(|idx| {
            let (key, row) = buffer.get(idx)?;
            writer.append(&key, &row)
        });
        if let Err(err) = written {
            self.write_segment = writer.abort();
            return Err(err);
        }
        let rows = writer.record_count();
        let (handle, staging) = writer.close()?;
        info!(
            "ExternalSorter[{}] spilled run: rows={} bytes={} path={}",
            self.label,
            rows,
            handle.footer().data_length,
            handle.path().display()
        );
        self.write_segment = Some(staging);
        self.buffer.reset();
        self.channels.push_back(handle);
        self.profile.spilled_runs.add(1);
        Ok(())
    }

    /// Whether every channel can be opened at once for the last merge. Each
    /// channel reader needs a segment, and the writer segment is recycled
    /// before the readers open. An in-memory run needs neither.
    fn fits_final_merge(&self) -> bool {
        let reader_budget = self.pool.available() + usize::from(self.write_segment.is_some());
        self.channels.len() <= self.settings.max_num_file_handles.min(reader_budget)
    }

    fn reader_segments(&self, num_readers: usize) -> usize {
        if self.settings.async_merge && self.pool.available() >= 2 * num_readers {
            2
        } else {
            1
        }
    }

    fn open_readers(&mut self, handles: Vec<ChannelHandle>) -> SmjResult<Vec<MergeSource>> {
        let per_reader = self.reader_segments(handles.len());
        let mut sources = Vec::with_capacity(handles.len() + 1);
        for handle in handles {
            let segments = self.pool.take(per_reader)?;
            let reader = self
                .channel_manager
                .open_channel(handle, segments, per_reader > 1)?;
            sources.push(MergeSource::Channel(reader));
        }
        Ok(sources)
    }

    /// Merge the oldest `fan_in` channels into one new channel.
    fn merge_round(&mut self, fan_in: usize) -> SmjResult<()> {
        let inputs: Vec<ChannelHandle> = self.channels.drain(..fan_in).collect();
        let sources = self.open_readers(inputs)?;
        let mut merger = MergeIterator::new(Arc::clone(&self.ctx), sources)?;
        let staging = self.take_write_segment()?;
        let mut writer = self
            .channel_manager
            .create_channel(self.buffer.key_len(), staging)?;
        let written: SmjResult<()> = (|| {
            while let Some((key, row)) = merger.next_keyed()? {
                writer.append(&key, &row)?;
            }
            Ok(())
        })();
        if let Err(err) = written {
            self.write_segment = writer.abort();
            return Err(err);
        }
        drop(merger);
        let (handle, staging) = writer.close()?;
        self.write_segment = Some(staging);
        self.profile.merge_rounds.add(1);
        debug!(
            "ExternalSorter[{}] merge round: fan_in={} rows={} remaining_channels={}",
            self.label,
            fan_in,
            handle.record_count(),
            self.channels.len() + 1
        );
        self.channels.push_back(handle);
        Ok(())
    }

    /// End of input. Returns the side's rows in key order.
    pub fn finish(&mut self) -> SmjResult<SortedStream> {
        if self.finished {
            return Err(SmjError::Internal(format!(
                "{}: sorter finished twice",
                self.label
            )));
        }
        self.finished = true;

        if self.channels.is_empty() {
            if let Some(seg) = self.write_segment.take() {
                self.pool.recycle(seg);
            }
            if self.buffer.is_empty() {
                self.buffer.release_into(&mut self.pool);
                return Ok(SortedStream::Empty);
            }
            self.sort_buffer()?;
            return Ok(SortedStream::Memory(self.buffer.take_run()));
        }

        let max_fan_in = self.settings.max_num_file_handles;
        // The tail stays in memory only if the channels already fit a single
        // final merge next to it; otherwise it becomes one more channel.
        let keep_tail = !self.buffer.is_empty() && self.fits_final_merge();
        if keep_tail {
            self.sort_buffer()?;
        } else {
            if !self.buffer.is_empty() {
                self.spill_buffer()?;
            }
            self.buffer.release_into(&mut self.pool);
        }

        while !self.fits_final_merge() {
            let fan_in = max_fan_in.min(self.pool.available());
            if fan_in < 2 {
                return Err(SmjError::MemoryExhausted(format!(
                    "{}: {} channels to merge but only {} reader segments",
                    self.label,
                    self.channels.len(),
                    self.pool.available()
                )));
            }
            self.merge_round(fan_in.min(self.channels.len()))?;
        }

        if let Some(seg) = self.write_segment.take() {
            self.pool.recycle(seg);
        }
        let handles: Vec<ChannelHandle> = self.channels.drain(..).collect();
        let mut sources = self.open_readers(handles)?;
        if keep_tail {
            sources.push(MergeSource::Memory(self.buffer.take_run()));
        }
        Ok(SortedStream::Merge(MergeIterator::new(
            Arc::clone(&self.ctx),
            sources,
        )?))
    }

    /// Return every segment this side still keeps and check none is on loan.
    /// Streams handed out by `finish` must be dropped first.
    pub fn close(&mut self) -> SmjResult<()> {
        self.channels.clear();
        if let Some(seg) = self.write_segment.take() {
            self.pool.recycle(seg);
        }
        self.buffer.release_into(&mut self.pool);
        self.pool.release_all()?;
        self.pool.verify_returned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::expr::int_key::{
        FieldKeyProjection, IntKeyComparator, IntNormalizedKeyComputer,
    };
    use crate::exec::row::BinaryRowWriter;
    use crate::exec::spill::{SpillProfile, SpillSettings};
    use crate::runtime::memory_manager::MemoryManager;
    use rand::SeedableRng;
    use rand::seq::SliceRandom;

    struct Fixture {
        _dir: tempfile::TempDir,
        mm: MemoryManager,
        profile: RuntimeProfile,
        channels: Arc<ChannelManager>,
    }

    fn fixture(total_segments: usize, segment_size: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let profile = RuntimeProfile::new("test");
        let settings = SpillSettings {
            local_dirs: vec![dir.path().to_path_buf()],
            compression_enabled: true,
            compression_block_size_bytes: 64 * 1024,
        };
        let channels =
            Arc::new(ChannelManager::new(&settings, SpillProfile::new(&profile)).unwrap());
        Fixture {
            _dir: dir,
            mm: MemoryManager::new((total_segments * segment_size) as u64, segment_size)
                .unwrap(),
            profile,
            channels,
        }
    }

    fn sorter(f: &Fixture, max_segments: usize, settings: SorterSettings) -> ExternalSorter {
        let ctx = SortKeyContext::new(
            Arc::new(FieldKeyProjection::new(vec![0])),
            Arc::new(IntNormalizedKeyComputer::new(1)),
            Arc::new(IntKeyComparator::new(1)),
        );
        let pool = SegmentPool::new(f.mm.clone(), "Left", 2, max_segments).unwrap();
        ExternalSorter::new(
            "Left",
            ctx,
            pool,
            Arc::clone(&f.channels),
            settings,
            &f.profile,
        )
        .unwrap()
    }

    fn shuffled(n: i64) -> Vec<BinaryRow> {
        let mut keys: Vec<i64> = (0..n).collect();
        keys.shuffle(&mut rand::rngs::StdRng::seed_from_u64(7));
        keys.into_iter()
            .map(|k| {
                let mut w = BinaryRowWriter::new(2);
                w.write_long(0, k).write_str(1, "sorted-run-payload");
                w.finish()
            })
            .collect()
    }

    fn drain_keys(stream: &mut SortedStream) -> Vec<i64> {
        let mut keys = Vec::new();
        while let Some(row) = stream.next_row().unwrap() {
            keys.push(row.get_long(0).unwrap());
        }
        keys
    }

    #[test]
    fn sorts_in_memory_without_spilling() {
        let f = fixture(64, 4096);
        let mut s = sorter(&f, 64, SorterSettings::default());
        for row in shuffled(500) {
            s.add(row).unwrap();
        }
        let mut out = s.finish().unwrap();
        assert!(matches!(out, SortedStream::Memory(_)));
        assert_eq!(drain_keys(&mut out), (0..500).collect::<Vec<_>>());
        drop(out);
        s.close().unwrap();
        assert_eq!(f.channels.profile().channels_created.value(), 0);
        assert!(f.mm.verify_empty());
    }

    #[test]
    fn spills_and_merges_in_rounds() {
        let f = fixture(16, 256);
        let settings = SorterSettings {
            max_num_file_handles: 3,
            async_merge: true,
        };
        let mut s = sorter(&f, 8, settings);
        for row in shuffled(2000) {
            s.add(row).unwrap();
        }
        assert!(s.num_channels() > 3);
        let mut out = s.finish().unwrap();
        assert_eq!(drain_keys(&mut out), (0..2000).collect::<Vec<_>>());
        drop(out);
        assert!(s.merge_rounds() >= 1);
        s.close().unwrap();
        let spill = f.channels.profile();
        assert!(spill.channels_created.value() >= 1);
        assert_eq!(spill.channels_created.value(), spill.channels_consumed.value());
        assert!(f.mm.verify_empty());
        assert_eq!(std::fs::read_dir(f._dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn empty_input_yields_empty_stream() {
        let f = fixture(8, 1024);
        let mut s = sorter(&f, 8, SorterSettings::default());
        let mut out = s.finish().unwrap();
        assert!(out.next_row().unwrap().is_none());
        assert!(s.add(shuffled(1).remove(0)).is_err());
        s.close().unwrap();
        assert!(f.mm.verify_empty());
    }

    #[test]
    fn oversized_row_is_memory_exhausted() {
        let f = fixture(4, 128);
        let mut s = sorter(&f, 3, SorterSettings::default());
        let mut w = BinaryRowWriter::new(2);
        w.write_long(0, 1).write_bytes(1, &[7u8; 1024]);
        let err = s.add(w.finish()).unwrap_err();
        assert!(matches!(err, SmjError::MemoryExhausted(_)));
        s.close().unwrap();
        assert!(f.mm.verify_empty());
    }

    #[test]
    fn finishes_across_the_single_spill_boundary() {
        let f = fixture(16, 256);
        for n in 1..400 {
            let mut s = sorter(&f, 8, SorterSettings::default());
            for k in (0..n).rev() {
                let mut w = BinaryRowWriter::new(2);
                w.write_long(0, k).write_str(1, "sorted-run-payload");
                s.add(w.finish()).unwrap();
            }
            let spilled = s.num_channels();
            let mut out = s
                .finish()
                .unwrap_or_else(|e| panic!("n={n} channels={spilled}: {e}"));
            assert_eq!(drain_keys(&mut out), (0..n).collect::<Vec<_>>(), "n={n}");
            drop(out);
            s.close().unwrap();
            assert!(f.mm.verify_empty(), "n={n}");
        }
        assert!(f.channels.profile().channels_created.value() > 0);
        assert_eq!(std::fs::read_dir(f._dir.path()).unwrap().count(), 0);
    }
}
