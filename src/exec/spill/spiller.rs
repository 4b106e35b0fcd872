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
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::common::error::{SmjError, SmjResult};
use crate::exec::expr::NormalizedKey;
use crate::exec::row::BinaryRow;
use crate::exec::spill::block_manager::{ChannelFooter, SpillCodec, write_block};
use crate::exec::spill::dir_manager::DirManager;
use crate::exec::spill::spill_stream::ChannelReader;
use crate::exec::spill::{SpillProfile, SpillSettings};
use crate::novarocks_logging::{debug, warn};
use crate::runtime::memory_manager::MemorySegment;
use crate::runtime::profile::ScopedTimer;

/// Removes the spill file when dropped.
#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
}

impl SpillFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                "Spill channel remove file failed: path={}, error={}",
                self.path.display(),
                e
            );
        }
    }
}

/// A finished channel, readable once.
#[derive(Debug)]
pub struct ChannelHandle {
    file: SpillFile,
    footer: ChannelFooter,
}

impl ChannelHandle {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn footer(&self) -> &ChannelFooter {
        &self.footer
    }

    pub fn record_count(&self) -> u64 {
        self.footer.record_count
    }

    pub(crate) fn into_parts(self) -> (SpillFile, ChannelFooter) {
        (self.file, self.footer)
    }
}

/// Creates channel files for one operator and opens them for reading.
#[derive(Debug)]
pub struct ChannelManager {
    dir_manager: DirManager,
    next_id: AtomicU64,
    pid: u32,
    compression_enabled: bool,
    compression_block_size: usize,
    profile: SpillProfile,
    cancelled: Arc<AtomicBool>,
}

impl ChannelManager {
    pub fn new(settings: &SpillSettings, profile: SpillProfile) -> SmjResult<Self> {
        settings.validate()?;
        Ok(Self {
            dir_manager: DirManager::new(settings.local_dirs.clone())?,
            next_id: AtomicU64::new(0),
            pid: std::process::id(),
            compression_enabled: settings.compression_enabled,
            compression_block_size: settings.compression_block_size_bytes,
            profile,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn profile(&self) -> &SpillProfile {
        &self.profile
    }

    /// Stop reads: queued prefetch tasks give up and readers fail on their
    /// next block. Writers are not affected; their owner aborts them.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn create_file(&self) -> SmjResult<(SpillFile, File)> {
        let mut attempts = 0;
        loop {
            let dir = self.dir_manager.next_dir();
            let id = self.next_id.fetch_add(1, Ordering::AcqRel);
            let path = dir.join(format!("smj_{}_{}.spill", self.pid, id));
            let file = OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path);
            match file {
                Ok(file) => return Ok((SpillFile { path }, file)),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && attempts < 3 => {
                    attempts += 1;
                    continue;
                }
                Err(err) => return Err(SmjError::spill_io("create spill file", &path, err)),
            }
        }
    }

    /// Open a writer that stages blocks in `staging`. The segment comes back
    /// from `close` or `abort`.
    pub fn create_channel(
        &self,
        key_len: usize,
        staging: MemorySegment,
    ) -> SmjResult<ChannelWriter> {
        let block_size = staging.len().min(self.compression_block_size);
        if block_size == 0 {
            return Err(SmjError::Internal(
                "spill block size resolved to 0".to_string(),
            ));
        }
        let (file, out) = self.create_file()?;
        debug!("create spill channel: path={}", file.path().display());
        Ok(ChannelWriter {
            out,
            file,
            staging: Some(staging),
            fill: 0,
            block_size,
            compress: self.compression_enabled,
            key_len,
            record_count: 0,
            block_count: 0,
            data_length: 0,
            first_key: None,
            last_key: None,
            profile: self.profile.clone(),
        })
    }

    /// One segment reads synchronously, two or more enable prefetching.
    pub fn open_channel(
        &self,
        handle: ChannelHandle,
        segments: Vec<MemorySegment>,
        prefetch: bool,
    ) -> SmjResult<ChannelReader> {
        ChannelReader::open(
            handle,
            segments,
            prefetch,
            self.profile.clone(),
            Arc::clone(&self.cancelled),
        )
    }
}

/// Appends key-prefixed rows to a channel file.
pub struct ChannelWriter {
    // Closed before the guard below removes the file.
    out: File,
    file: SpillFile,
    staging: Option<MemorySegment>,
    fill: usize,
    block_size: usize,
    compress: bool,
    key_len: usize,
    record_count: u64,
    block_count: u64,
    data_length: u64,
    first_key: Option<NormalizedKey>,
    last_key: Option<NormalizedKey>,
    profile: SpillProfile,
}

impl ChannelWriter {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn append(&mut self, key: &NormalizedKey, row: &BinaryRow) -> SmjResult<()> {
        if key.len() != self.key_len {
            return Err(SmjError::Internal(format!(
                "normalized key of {} bytes written to a channel of {} byte keys",
                key.len(),
                self.key_len
            )));
        }
        let row_len = u32::try_from(row.len()).map_err(|_| {
            SmjError::Internal(format!("row of {} bytes cannot be spilled", row.len()))
        })?;
        self.put(key.as_bytes())?;
        self.put(&row_len.to_le_bytes())?;
        self.put(row.as_bytes())?;
        if self.first_key.is_none() {
            self.first_key = Some(*key);
        }
        self.last_key = Some(*key);
        self.record_count += 1;
        self.profile.spill_rows.add(1);
        Ok(())
    }

    fn put(&mut self, mut bytes: &[u8]) -> SmjResult<()> {
        while !bytes.is_empty() {
            let staging = self
                .staging
                .as_mut()
                .ok_or_else(|| SmjError::Internal("channel writer has no staging segment".to_string()))?;
            let n = (self.block_size - self.fill).min(bytes.len());
            staging.as_mut_slice()[self.fill..self.fill + n].copy_from_slice(&bytes[..n]);
            self.fill += n;
            bytes = &bytes[n..];
            if self.fill == self.block_size {
                self.flush_block()?;
            }
        }
        Ok(())
    }

    fn flush_block(&mut self) -> SmjResult<()> {
        if self.fill == 0 {
            return Ok(());
        }
        let _timer = ScopedTimer::new(Arc::clone(&self.profile.spill_time));
        let staging = self
            .staging
            .as_ref()
            .ok_or_else(|| SmjError::Internal("channel writer has no staging segment".to_string()))?;
        let (header, written) = write_block(
            &mut self.out,
            &staging.as_slice()[..self.fill],
            self.compress,
            &self.file.path,
        )?;
        if header.codec == SpillCodec::None {
            self.profile.raw_block_count.add(1);
        }
        self.profile.spill_block_count.add(1);
        self.profile.spill_bytes.add(written as i64);
        self.block_count += 1;
        self.data_length += written as u64;
        self.fill = 0;
        Ok(())
    }

    /// Flush the last block and the footer. The file is readable afterwards.
    pub fn close(mut self) -> SmjResult<(ChannelHandle, MemorySegment)> {
        self.flush_block()?;
        let footer = ChannelFooter {
            key_len: self.key_len as u16,
            record_count: self.record_count,
            block_count: self.block_count,
            data_length: self.data_length,
            first_key: self.first_key,
            last_key: self.last_key,
        };
        let path = self.file.path.clone();
        self.out
            .write_all(&footer.to_bytes())
            .map_err(|e| SmjError::spill_io("write spill footer", &path, e))?;
        self.out
            .flush()
            .map_err(|e| SmjError::spill_io("flush spill file", &path, e))?;
        self.profile.channels_created.add(1);
        let staging = self
            .staging
            .take()
            .ok_or_else(|| SmjError::Internal("channel writer has no staging segment".to_string()))?;
        debug!(
            "close spill channel: path={}, records={}, blocks={}, bytes={}",
            path.display(),
            footer.record_count,
            footer.block_count,
            footer.data_length
        );
        Ok((
            ChannelHandle {
                file: self.file,
                footer,
            },
            staging,
        ))
    }

    /// Drop the partial file and hand back the staging segment.
    pub fn abort(mut self) -> Option<MemorySegment> {
        self.staging.take()
    }
}
