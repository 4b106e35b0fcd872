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
//! Forward-only channel reader.
//!
//! With two read segments the reader keeps one block loading on the spill
//! IO executor while the other is consumed. There is never more than one
//! load in flight per reader, and the loader only ever touches the file, its
//! own segment and a scratch buffer that travel with the task.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, sync_channel};

use bytes::Bytes;

use crate::common::error::{SmjError, SmjResult};
use crate::exec::expr::NormalizedKey;
use crate::exec::row::{BinaryRow, RowIterator};
use crate::exec::spill::SpillProfile;
use crate::exec::spill::block_manager::{ChannelFooter, TRAILER_LEN, read_block};
use crate::exec::spill::spiller::{ChannelHandle, SpillFile};
use crate::novarocks_logging::debug;
use crate::runtime::io::{IoTaskHandle, spill_io_executor};
use crate::runtime::memory_manager::MemorySegment;
use crate::runtime::profile::ScopedTimer;

type BlockFile = BufReader<File>;

struct LoadedBlock {
    file: BlockFile,
    scratch: Vec<u8>,
    segment: MemorySegment,
    result: SmjResult<(usize, usize)>,
}

enum BlockIo {
    Idle { file: BlockFile, scratch: Vec<u8> },
    InFlight {
        rx: Receiver<LoadedBlock>,
        handle: IoTaskHandle,
    },
    /// The file went away with a failed load, or the channel is finished.
    Closed,
}

pub struct ChannelReader {
    path: PathBuf,
    footer: ChannelFooter,
    io: BlockIo,
    current: Option<MemorySegment>,
    spare: Option<MemorySegment>,
    cur_len: usize,
    cur_pos: usize,
    blocks_read: u64,
    bytes_read: u64,
    records_read: u64,
    prefetch: bool,
    profile: SpillProfile,
    cancelled: Arc<AtomicBool>,
    // Dropped last, after any in-flight load has been joined.
    file_guard: Option<SpillFile>,
}

impl ChannelReader {
    pub fn open(
        handle: ChannelHandle,
        segments: Vec<MemorySegment>,
        prefetch: bool,
        profile: SpillProfile,
        cancelled: Arc<AtomicBool>,
    ) -> SmjResult<Self> {
        let (guard, footer) = handle.into_parts();
        let path = guard.path().to_path_buf();
        let mut segments = segments.into_iter();
        let current = segments.next().ok_or_else(|| {
            SmjError::Internal(format!(
                "channel {} opened without a read segment",
                path.display()
            ))
        })?;
        let spare = if prefetch { segments.next() } else { None };
        // Extra segments are not needed; dropping them returns them.
        drop(segments);

        let file = File::open(&path).map_err(|e| SmjError::spill_io("open spill file", &path, e))?;
        let mut file = BufReader::new(file);
        validate_layout(&mut file, &footer, &path)?;

        let mut reader = Self {
            prefetch: spare.is_some(),
            path,
            footer,
            io: BlockIo::Idle {
                file,
                scratch: Vec::new(),
            },
            current: Some(current),
            spare,
            cur_len: 0,
            cur_pos: 0,
            blocks_read: 0,
            bytes_read: 0,
            records_read: 0,
            profile,
            cancelled,
            file_guard: Some(guard),
        };
        reader.maybe_prefetch();
        Ok(reader)
    }

    pub fn footer(&self) -> &ChannelFooter {
        &self.footer
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_prefetching(&self) -> bool {
        self.prefetch
    }

    /// Next record with its normalized key, or `None` once the channel is
    /// drained. Draining deletes the file and returns the read segments.
    pub fn next_keyed(&mut self) -> SmjResult<Option<(NormalizedKey, BinaryRow)>> {
        if self.records_read >= self.footer.record_count {
            self.finish()?;
            return Ok(None);
        }
        let _timer = ScopedTimer::new(Arc::clone(&self.profile.restore_time));
        let mut key_buf = [0u8; crate::exec::expr::MAX_NORMALIZED_KEY_BYTES];
        let key_len = self.footer.key_len as usize;
        if key_len > key_buf.len() {
            return Err(SmjError::corrupt(
                &self.path,
                format!("normalized key length {key_len} exceeds the maximum"),
            ));
        }
        self.read_exact(&mut key_buf[..key_len])?;
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf)?;
        let row_len = u32::from_le_bytes(len_buf) as usize;
        let mut row = vec![0u8; row_len];
        self.read_exact(&mut row)?;
        let row = BinaryRow::from_bytes(Bytes::from(row))
            .map_err(|e| SmjError::corrupt(&self.path, e.to_string()))?;
        self.records_read += 1;
        self.profile.restore_rows.add(1);
        Ok(Some((NormalizedKey::from_slice(&key_buf[..key_len]), row)))
    }

    fn read_exact(&mut self, mut out: &mut [u8]) -> SmjResult<()> {
        while !out.is_empty() {
            if self.cur_pos == self.cur_len && !self.advance_block()? {
                return Err(SmjError::corrupt(
                    &self.path,
                    format!(
                        "channel ended inside record {} of {}",
                        self.records_read + 1,
                        self.footer.record_count
                    ),
                ));
            }
            let current = self.current.as_ref().ok_or_else(|| {
                SmjError::Internal("channel reader lost its read segment".to_string())
            })?;
            let n = (self.cur_len - self.cur_pos).min(out.len());
            out[..n].copy_from_slice(&current.as_slice()[self.cur_pos..self.cur_pos + n]);
            self.cur_pos += n;
            out = &mut out[n..];
        }
        Ok(())
    }

    fn advance_block(&mut self) -> SmjResult<bool> {
        if self.blocks_read >= self.footer.block_count {
            return Ok(false);
        }
        if self.cancelled.load(Ordering::Acquire) {
            return Err(SmjError::Internal(format!(
                "spill read of {} cancelled",
                self.path.display()
            )));
        }
        let (file, scratch, filled, decoded, consumed) =
            match std::mem::replace(&mut self.io, BlockIo::Closed) {
                BlockIo::InFlight { rx, handle } => {
                    let loaded = rx.recv().map_err(|_| {
                        SmjError::Internal(format!(
                            "prefetch of {} ended without a result",
                            self.path.display()
                        ))
                    })?;
                    handle.wait();
                    let (decoded, consumed) = loaded.result?;
                    (loaded.file, loaded.scratch, loaded.segment, decoded, consumed)
                }
                BlockIo::Idle {
                    mut file,
                    mut scratch,
                } => {
                    let mut segment = match self.spare.take() {
                        Some(seg) => seg,
                        None => self.current.take().ok_or_else(|| {
                            SmjError::Internal("channel reader lost its read segment".to_string())
                        })?,
                    };
                    let (decoded, consumed) =
                        read_block(&mut file, &mut segment, &mut scratch, &self.path)?;
                    self.profile.spill_read_io_count.add(1);
                    (file, scratch, segment, decoded, consumed)
                }
                BlockIo::Closed => {
                    return Err(SmjError::Internal(format!(
                        "channel {} read after a failed block load",
                        self.path.display()
                    )));
                }
            };
        if let Some(previous) = self.current.replace(filled) {
            self.spare = Some(previous);
        }
        self.blocks_read += 1;
        self.bytes_read += consumed as u64;
        self.profile.restore_bytes.add(consumed as i64);
        self.cur_len = decoded;
        self.cur_pos = 0;
        self.io = BlockIo::Idle { file, scratch };
        self.maybe_prefetch();
        Ok(true)
    }

    /// Start loading the next block into the spare segment, if there is one
    /// and the executor has room. Otherwise the next block loads inline.
    fn maybe_prefetch(&mut self) {
        if !self.prefetch
            || self.blocks_read >= self.footer.block_count
            || self.spare.is_none()
            || self.cancelled.load(Ordering::Acquire)
        {
            return;
        }
        let executor = spill_io_executor();
        if !executor.has_capacity() {
            return;
        }
        let BlockIo::Idle { file, scratch } = std::mem::replace(&mut self.io, BlockIo::Closed)
        else {
            return;
        };
        let Some(segment) = self.spare.take() else {
            self.io = BlockIo::Idle { file, scratch };
            return;
        };
        let (tx, rx) = sync_channel(1);
        let path = self.path.clone();
        let io_count = Arc::clone(&self.profile.spill_read_io_count);
        let handle = executor.submit(move |ctx| {
            let mut file = file;
            let mut scratch = scratch;
            let mut segment = segment;
            let result = if ctx.is_cancelled() {
                Err(SmjError::Internal(format!(
                    "prefetch of {} cancelled",
                    path.display()
                )))
            } else {
                io_count.add(1);
                read_block(&mut file, &mut segment, &mut scratch, &path)
            };
            // The receiver may be gone after a cancel; the block then drops
            // here and its segment goes back to the pool.
            let _ = tx.send(LoadedBlock {
                file,
                scratch,
                segment,
                result,
            });
        });
        self.io = BlockIo::InFlight { rx, handle };
    }

    fn join_prefetch(&mut self) {
        if let BlockIo::InFlight { rx, handle } = std::mem::replace(&mut self.io, BlockIo::Closed)
        {
            handle.cancel();
            handle.wait();
            // Take the block so its segment is returned before we report done.
            drop(rx.try_recv());
        }
    }

    /// Verify the channel was consumed exactly, then release everything.
    fn finish(&mut self) -> SmjResult<()> {
        let Some(guard) = self.file_guard.take() else {
            return Ok(());
        };
        self.join_prefetch();
        self.io = BlockIo::Closed;
        self.current = None;
        self.spare = None;
        if self.blocks_read != self.footer.block_count || self.cur_pos != self.cur_len {
            return Err(SmjError::corrupt(
                &self.path,
                format!(
                    "{} records consumed but {} of {} blocks read with {} trailing bytes",
                    self.records_read,
                    self.blocks_read,
                    self.footer.block_count,
                    self.cur_len - self.cur_pos
                ),
            ));
        }
        if self.bytes_read != self.footer.data_length {
            return Err(SmjError::corrupt(
                &self.path,
                format!(
                    "read {} block bytes, footer declares {}",
                    self.bytes_read, self.footer.data_length
                ),
            ));
        }
        drop(guard);
        self.profile.channels_consumed.add(1);
        debug!(
            "spill channel consumed: path={}, records={}",
            self.path.display(),
            self.records_read
        );
        Ok(())
    }
}

impl RowIterator for ChannelReader {
    fn next_row(&mut self) -> SmjResult<Option<BinaryRow>> {
        Ok(self.next_keyed()?.map(|(_, row)| row))
    }
}

impl Drop for ChannelReader {
    fn drop(&mut self) {
        self.join_prefetch();
    }
}

/// Check the trailer, footer and total size agree, then rewind.
fn validate_layout(file: &mut BlockFile, footer: &ChannelFooter, path: &Path) -> SmjResult<()> {
    let file_len = file
        .get_ref()
        .metadata()
        .map_err(|e| SmjError::spill_io("stat spill file", path, e))?
        .len();
    if file_len < TRAILER_LEN as u64 {
        return Err(SmjError::corrupt(path, "file shorter than its trailer"));
    }
    file.seek(SeekFrom::Start(file_len - TRAILER_LEN as u64))
        .map_err(|e| SmjError::spill_io("seek spill trailer", path, e))?;
    let mut trailer = [0u8; TRAILER_LEN];
    file.read_exact(&mut trailer)
        .map_err(|e| SmjError::spill_io("read spill trailer", path, e))?;
    let footer_len = ChannelFooter::parse_trailer(&trailer).map_err(|e| SmjError::corrupt(path, e))?;
    let footer_start = file_len
        .checked_sub((TRAILER_LEN + footer_len) as u64)
        .ok_or_else(|| SmjError::corrupt(path, "footer length exceeds file size"))?;
    file.seek(SeekFrom::Start(footer_start))
        .map_err(|e| SmjError::spill_io("seek spill footer", path, e))?;
    let mut body = vec![0u8; footer_len];
    file.read_exact(&mut body)
        .map_err(|e| SmjError::spill_io("read spill footer", path, e))?;
    let on_disk = ChannelFooter::from_bytes(&body).map_err(|e| SmjError::corrupt(path, e))?;
    if &on_disk != footer {
        return Err(SmjError::corrupt(
            path,
            "footer on disk differs from the one recorded at close",
        ));
    }
    if footer_start != footer.data_length {
        return Err(SmjError::corrupt(
            path,
            format!(
                "block region is {footer_start} bytes, footer declares {}",
                footer.data_length
            ),
        ));
    }
    file.seek(SeekFrom::Start(0))
        .map_err(|e| SmjError::spill_io("rewind spill file", path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::row::BinaryRowWriter;
    use crate::exec::spill::{ChannelManager, SpillSettings};
    use crate::runtime::memory_manager::MemoryManager;
    use crate::runtime::profile::RuntimeProfile;
    use std::io::Write;

    fn setup(dir: &Path) -> (MemoryManager, ChannelManager) {
        let settings = SpillSettings {
            local_dirs: vec![dir.to_path_buf()],
            compression_enabled: true,
            compression_block_size_bytes: 128,
        };
        (
            MemoryManager::new(8 * 512, 512).unwrap(),
            ChannelManager::new(&settings, SpillProfile::new(&RuntimeProfile::new("t"))).unwrap(),
        )
    }

    fn write_channel(mm: &MemoryManager, cm: &ChannelManager, rows: i64) -> ChannelHandle {
        let mut writer = cm
            .create_channel(8, mm.acquire(1).unwrap().pop().unwrap())
            .unwrap();
        for i in 0..rows {
            let mut w = BinaryRowWriter::new(1);
            w.write_long(0, i);
            writer
                .append(&NormalizedKey::from_slice(&i.to_be_bytes()), &w.finish())
                .unwrap();
        }
        writer.close().unwrap().0
    }

    #[test]
    fn sync_reader_uses_one_segment() {
        let dir = tempfile::tempdir().unwrap();
        let (mm, cm) = setup(dir.path());
        let handle = write_channel(&mm, &cm, 100);
        let mut reader = cm.open_channel(handle, mm.acquire(1).unwrap(), false).unwrap();
        assert!(!reader.is_prefetching());
        assert_eq!(mm.outstanding(), 1);
        let mut n = 0;
        while let Some((key, row)) = reader.next_keyed().unwrap() {
            assert_eq!(key.as_bytes(), &(n as i64).to_be_bytes());
            assert_eq!(row.get_long(0), Some(n));
            n += 1;
        }
        assert_eq!(n, 100);
        assert!(mm.verify_empty());
        assert_eq!(cm.profile().channels_consumed.value(), 1);
    }

    #[test]
    fn empty_channel_drains_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (mm, cm) = setup(dir.path());
        let handle = write_channel(&mm, &cm, 0);
        assert_eq!(handle.footer().block_count, 0);
        let mut reader = cm.open_channel(handle, mm.acquire(2).unwrap(), true).unwrap();
        assert!(reader.next_keyed().unwrap().is_none());
        assert!(mm.verify_empty());
    }

    #[test]
    fn dropping_mid_prefetch_returns_segments() {
        let dir = tempfile::tempdir().unwrap();
        let (mm, cm) = setup(dir.path());
        let handle = write_channel(&mm, &cm, 500);
        let path = handle.path().to_path_buf();
        let mut reader = cm.open_channel(handle, mm.acquire(2).unwrap(), true).unwrap();
        assert!(reader.next_keyed().unwrap().is_some());
        drop(reader);
        assert!(mm.verify_empty());
        assert!(!path.exists());
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let (mm, cm) = setup(dir.path());
        let handle = write_channel(&mm, &cm, 50);
        let path = handle.path().to_path_buf();
        let bytes = std::fs::read(&path).unwrap();
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&bytes[..bytes.len() - 3]).unwrap();
        drop(f);
        let err = cm
            .open_channel(handle, mm.acquire(1).unwrap(), false)
            .err()
            .unwrap();
        assert!(matches!(err, SmjError::CorruptChannel(_)));
        assert!(mm.verify_empty());
        assert!(!path.exists());
    }
}
