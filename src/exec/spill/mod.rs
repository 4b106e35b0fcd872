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
//! Spill channels: sequential block files holding sorted runs.

pub mod block_manager;
pub mod dir_manager;
pub mod spill_stream;
pub mod spiller;

use std::path::PathBuf;

use crate::common::config;
use crate::common::error::{SmjError, SmjResult};
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile};

pub use spill_stream::ChannelReader;
pub use spiller::{ChannelHandle, ChannelManager, ChannelWriter};

#[derive(Clone, Debug)]
pub struct SpillSettings {
    pub local_dirs: Vec<PathBuf>,
    pub compression_enabled: bool,
    pub compression_block_size_bytes: usize,
}

impl SpillSettings {
    pub fn from_app_config() -> Self {
        Self {
            local_dirs: config::spill_local_dirs()
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            compression_enabled: config::spill_compression_enabled(),
            compression_block_size_bytes: config::spill_compression_block_size_bytes(),
        }
    }

    pub fn validate(&self) -> SmjResult<()> {
        if self.local_dirs.is_empty() {
            return Err(SmjError::Internal(
                "spill settings need at least one local dir".to_string(),
            ));
        }
        if self.compression_block_size_bytes == 0 {
            return Err(SmjError::Internal(
                "spill compression block size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SpillProfile {
    pub spill_rows: CounterRef,
    pub spill_bytes: CounterRef,
    pub spill_time: CounterRef,
    pub spill_block_count: CounterRef,
    pub raw_block_count: CounterRef,
    pub restore_rows: CounterRef,
    pub restore_bytes: CounterRef,
    pub restore_time: CounterRef,
    pub spill_read_io_count: CounterRef,
    pub channels_created: CounterRef,
    pub channels_consumed: CounterRef,
}

impl SpillProfile {
    pub fn new(profile: &RuntimeProfile) -> Self {
        let profile = profile.child("Spill");
        Self {
            spill_rows: profile.add_counter("SpillRows", CounterUnit::Unit),
            spill_bytes: profile.add_counter("SpillBytes", CounterUnit::Bytes),
            spill_time: profile.add_timer("SpillTime"),
            spill_block_count: profile.add_counter("SpillBlockCount", CounterUnit::Unit),
            raw_block_count: profile.add_counter("SpillRawBlockCount", CounterUnit::Unit),
            restore_rows: profile.add_counter("RestoreRows", CounterUnit::Unit),
            restore_bytes: profile.add_counter("RestoreBytes", CounterUnit::Bytes),
            restore_time: profile.add_timer("RestoreTime"),
            spill_read_io_count: profile.add_counter("SpillReadIoCount", CounterUnit::Unit),
            channels_created: profile.add_counter("ChannelsCreated", CounterUnit::Unit),
            channels_consumed: profile.add_counter("ChannelsConsumed", CounterUnit::Unit),
        }
    }
}
