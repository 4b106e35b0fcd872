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
//! Fixed pool of equal-size memory segments.
//!
//! The manager is the only state shared between the two sides of a join.
//! Every grant and return goes through one mutex. Segments are exclusive:
//! a `MemorySegment` is not `Clone`, and dropping it hands the buffer back
//! to the pool, so failure paths release without extra bookkeeping.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::error::{SmjError, SmjResult};
use crate::novarocks_logging::error;

#[derive(Debug, Default)]
struct PoolState {
    // Buffers are allocated lazily and kept around after their first use.
    buffers: Vec<Option<Box<[u8]>>>,
    free_ids: Vec<u32>,
    in_use: Vec<bool>,
    outstanding: usize,
    peak: usize,
}

#[derive(Debug)]
struct MemoryManagerInner {
    segment_size: usize,
    total_segments: usize,
    state: Mutex<PoolState>,
}

impl MemoryManagerInner {
    fn take(&self, count: usize) -> Option<Vec<(u32, Box<[u8]>)>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.free_ids.len() < count {
            return None;
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(id) = state.free_ids.pop() else {
                break;
            };
            let buf = state.buffers[id as usize]
                .take()
                .unwrap_or_else(|| vec![0u8; self.segment_size].into_boxed_slice());
            state.in_use[id as usize] = true;
            out.push((id, buf));
        }
        state.outstanding += out.len();
        state.peak = state.peak.max(state.outstanding);
        Some(out)
    }

    fn give_back(&self, id: u32, buf: Box<[u8]>) -> SmjResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let idx = id as usize;
        if idx >= state.in_use.len() || buf.len() != self.segment_size {
            return Err(SmjError::Internal(format!(
                "segment {id} does not belong to this memory manager"
            )));
        }
        if !state.in_use[idx] {
            return Err(SmjError::Internal(format!("segment {id} released twice")));
        }
        state.in_use[idx] = false;
        state.buffers[idx] = Some(buf);
        state.free_ids.push(id);
        state.outstanding -= 1;
        Ok(())
    }

    fn available(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .free_ids
            .len()
    }
}

/// Clonable handle to the segment pool.
#[derive(Clone)]
pub struct MemoryManager {
    inner: Arc<MemoryManagerInner>,
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("segment_size", &self.inner.segment_size)
            .field("total_segments", &self.inner.total_segments)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl MemoryManager {
    /// Carve `total_bytes` into `total_bytes / segment_size` segments.
    pub fn new(total_bytes: u64, segment_size: usize) -> SmjResult<Self> {
        if segment_size == 0 {
            return Err(SmjError::Internal(
                "memory segment size must be positive".to_string(),
            ));
        }
        let total_segments = usize::try_from(total_bytes / segment_size as u64)
            .map_err(|_| SmjError::Internal("memory budget too large".to_string()))?;
        if total_segments > u32::MAX as usize {
            return Err(SmjError::Internal(format!(
                "memory budget of {total_segments} segments exceeds the addressable pool"
            )));
        }
        let state = PoolState {
            buffers: (0..total_segments).map(|_| None).collect(),
            // Popped from the back, so segment 0 is handed out first.
            free_ids: (0..total_segments as u32).rev().collect(),
            in_use: vec![false; total_segments],
            outstanding: 0,
            peak: 0,
        };
        Ok(Self {
            inner: Arc::new(MemoryManagerInner {
                segment_size,
                total_segments,
                state: Mutex::new(state),
            }),
        })
    }

    pub fn segment_size(&self) -> usize {
        self.inner.segment_size
    }

    pub fn total_segments(&self) -> usize {
        self.inner.total_segments
    }

    /// Grant exactly `count` segments or nothing.
    pub fn acquire(&self, count: usize) -> SmjResult<Vec<MemorySegment>> {
        self.try_acquire(count).ok_or_else(|| {
            SmjError::MemoryExhausted(format!(
                "requested {count} segments of {} bytes, {} of {} available",
                self.inner.segment_size,
                self.available(),
                self.inner.total_segments
            ))
        })
    }

    pub fn try_acquire(&self, count: usize) -> Option<Vec<MemorySegment>> {
        self.try_acquire_for(count, None)
    }

    pub(crate) fn try_acquire_for(
        &self,
        count: usize,
        owner: Option<&Arc<AtomicUsize>>,
    ) -> Option<Vec<MemorySegment>> {
        let granted = self.inner.take(count)?;
        Some(
            granted
                .into_iter()
                .map(|(id, buf)| {
                    if let Some(owner) = owner {
                        owner.fetch_add(1, Ordering::AcqRel);
                    }
                    MemorySegment {
                        id,
                        buf: Some(buf),
                        manager: Arc::clone(&self.inner),
                        owner: owner.cloned(),
                    }
                })
                .collect(),
        )
    }

    /// Return a segment explicitly. Fails if the segment belongs to another
    /// manager or was already returned.
    pub fn release(&self, segment: MemorySegment) -> SmjResult<()> {
        if !Arc::ptr_eq(&self.inner, &segment.manager) {
            return Err(SmjError::Internal(format!(
                "segment {} released to a foreign memory manager",
                segment.id
            )));
        }
        segment.release()
    }

    pub fn available(&self) -> usize {
        self.inner.available()
    }

    pub fn outstanding(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .outstanding
    }

    pub fn peak(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peak
    }

    /// True iff no segment is outstanding.
    pub fn verify_empty(&self) -> bool {
        self.outstanding() == 0
    }
}

/// A fixed-size buffer on loan from a `MemoryManager`.
pub struct MemorySegment {
    id: u32,
    buf: Option<Box<[u8]>>,
    manager: Arc<MemoryManagerInner>,
    owner: Option<Arc<AtomicUsize>>,
}

impl fmt::Debug for MemorySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySegment")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}

impl MemorySegment {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.buf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }

    pub fn release(mut self) -> SmjResult<()> {
        self.return_to_pool()
    }

    fn return_to_pool(&mut self) -> SmjResult<()> {
        let Some(buf) = self.buf.take() else {
            return Ok(());
        };
        if let Some(owner) = self.owner.take() {
            owner.fetch_sub(1, Ordering::AcqRel);
        }
        self.manager.give_back(self.id, buf)
    }
}

impl Drop for MemorySegment {
    fn drop(&mut self) {
        if let Err(e) = self.return_to_pool() {
            error!("return memory segment on drop failed: {e}");
        }
    }
}

/// One side's view of the manager: a guaranteed minimum acquired up front
/// and a ceiling on what the side may hold.
///
/// Segments handed out keep a reference to the pool's counter, so the count
/// stays exact even after the segments move into readers or are dropped on
/// an error path.
#[derive(Debug)]
pub struct SegmentPool {
    manager: MemoryManager,
    label: String,
    max_segments: usize,
    reserve: Vec<MemorySegment>,
    held: Arc<AtomicUsize>,
}

impl SegmentPool {
    pub fn new(
        manager: MemoryManager,
        label: impl Into<String>,
        min_segments: usize,
        max_segments: usize,
    ) -> SmjResult<Self> {
        let label = label.into();
        if min_segments > max_segments {
            return Err(SmjError::MemoryExhausted(format!(
                "{label}: guaranteed {min_segments} segments exceed the share of {max_segments}"
            )));
        }
        let held = Arc::new(AtomicUsize::new(0));
        let reserve = manager
            .try_acquire_for(min_segments, Some(&held))
            .ok_or_else(|| {
                SmjError::MemoryExhausted(format!(
                    "{label}: cannot reserve the guaranteed {min_segments} segments, {} available",
                    manager.available()
                ))
            })?;
        Ok(Self {
            manager,
            label,
            max_segments,
            reserve,
            held,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn segment_size(&self) -> usize {
        self.manager.segment_size()
    }

    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    /// Segments currently on loan to this side, wherever they live.
    pub fn held(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }

    /// How many more segments `next_segment` could hand out right now.
    pub fn available(&self) -> usize {
        let headroom = self.max_segments.saturating_sub(self.held());
        self.reserve.len() + headroom.min(self.manager.available())
    }

    pub fn next_segment(&mut self) -> Option<MemorySegment> {
        if let Some(seg) = self.reserve.pop() {
            return Some(seg);
        }
        if self.held() >= self.max_segments {
            return None;
        }
        self.manager
            .try_acquire_for(1, Some(&self.held))
            .and_then(|mut segs| segs.pop())
    }

    pub fn take(&mut self, count: usize) -> SmjResult<Vec<MemorySegment>> {
        if self.available() < count {
            return Err(SmjError::MemoryExhausted(format!(
                "{}: requested {count} segments, {} available",
                self.label,
                self.available()
            )));
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            match self.next_segment() {
                Some(seg) => out.push(seg),
                None => {
                    self.recycle_all(out);
                    return Err(SmjError::MemoryExhausted(format!(
                        "{}: segment pool drained while taking {count} segments",
                        self.label
                    )));
                }
            }
        }
        Ok(out)
    }

    /// Keep a segment for reuse by this side instead of returning it.
    pub fn recycle(&mut self, segment: MemorySegment) {
        self.reserve.push(segment);
    }

    pub fn recycle_all(&mut self, segments: impl IntoIterator<Item = MemorySegment>) {
        self.reserve.extend(segments);
    }

    /// Return every reserved segment to the manager.
    pub fn release_all(&mut self) -> SmjResult<()> {
        let mut first_err = None;
        for seg in self.reserve.drain(..) {
            if let Err(e) = seg.release() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Fails if any segment of this side is still on loan after
    /// `release_all`.
    pub fn verify_returned(&self) -> SmjResult<()> {
        let held = self.held();
        let reserved = self.reserve.len();
        if held > reserved {
            return Err(SmjError::Internal(format!(
                "{}: {} segments leaked",
                self.label,
                held - reserved
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_all_or_nothing() {
        let mm = MemoryManager::new(4 * 1024, 1024).unwrap();
        assert_eq!(mm.total_segments(), 4);
        let segs = mm.acquire(3).unwrap();
        let err = mm.acquire(2).unwrap_err();
        assert!(matches!(err, SmjError::MemoryExhausted(_)));
        assert_eq!(mm.outstanding(), 3);
        for seg in segs {
            mm.release(seg).unwrap();
        }
        assert!(mm.verify_empty());
        assert_eq!(mm.peak(), 3);
    }

    #[test]
    fn dropped_segment_returns_to_pool() {
        let mm = MemoryManager::new(2 * 64, 64).unwrap();
        {
            let mut segs = mm.acquire(2).unwrap();
            segs[0].as_mut_slice()[0] = 7;
            assert_eq!(mm.available(), 0);
        }
        assert!(mm.verify_empty());
        assert_eq!(mm.available(), 2);
    }

    #[test]
    fn double_release_is_detected() {
        let mm = MemoryManager::new(2 * 64, 64).unwrap();
        let seg = mm.acquire(1).unwrap().pop().unwrap();
        let id = seg.id();
        seg.release().unwrap();
        let err = mm
            .inner
            .give_back(id, vec![0u8; 64].into_boxed_slice())
            .unwrap_err();
        assert!(err.to_string().contains("released twice"));
    }

    #[test]
    fn foreign_release_is_rejected() {
        let a = MemoryManager::new(2 * 64, 64).unwrap();
        let b = MemoryManager::new(2 * 64, 64).unwrap();
        let seg = a.acquire(1).unwrap().pop().unwrap();
        assert!(matches!(b.release(seg), Err(SmjError::Internal(_))));
        // The rejected segment was dropped and went home.
        assert!(a.verify_empty());
    }

    #[test]
    fn segment_pool_honours_min_and_max() {
        let mm = MemoryManager::new(10 * 64, 64).unwrap();
        let mut pool = SegmentPool::new(mm.clone(), "left", 2, 4).unwrap();
        assert_eq!(pool.held(), 2);
        assert_eq!(pool.available(), 4);
        let segs: Vec<_> = (0..4).filter_map(|_| pool.next_segment()).collect();
        assert_eq!(segs.len(), 4);
        assert!(pool.next_segment().is_none());
        drop(segs);
        assert_eq!(pool.held(), 0);
        pool.release_all().unwrap();
        pool.verify_returned().unwrap();
        assert!(mm.verify_empty());
    }

    #[test]
    fn segment_pool_minimum_unsatisfiable() {
        let mm = MemoryManager::new(3 * 64, 64).unwrap();
        let _other = mm.acquire(2).unwrap();
        let err = SegmentPool::new(mm.clone(), "right", 2, 3).unwrap_err();
        assert!(matches!(err, SmjError::MemoryExhausted(_)));
    }

    #[test]
    fn segment_pool_reports_leak() {
        let mm = MemoryManager::new(4 * 64, 64).unwrap();
        let mut pool = SegmentPool::new(mm, "left", 1, 4).unwrap();
        let kept = pool.next_segment().unwrap();
        pool.release_all().unwrap();
        assert!(pool.verify_returned().is_err());
        drop(kept);
        pool.verify_returned().unwrap();
    }
}
