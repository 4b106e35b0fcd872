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
use crate::novarocks_config::config as app_config;

pub(crate) fn memory_total_bytes() -> u64 {
    app_config()
        .ok()
        .map(|c| c.memory.total_bytes)
        .unwrap_or(32 * 1024 * 1024)
}

pub(crate) fn memory_segment_size_bytes() -> usize {
    app_config()
        .ok()
        .map(|c| c.memory.segment_size_bytes)
        .unwrap_or(32 * 1024)
}

pub(crate) fn spill_local_dirs() -> Vec<String> {
    let configured = app_config()
        .ok()
        .map(|c| c.spill.local_dirs.clone())
        .unwrap_or_default();
    if configured.is_empty() {
        let mut default_dir = std::env::temp_dir();
        default_dir.push("novarocks-smj-spill");
        vec![default_dir.to_string_lossy().into_owned()]
    } else {
        configured
    }
}

pub(crate) fn spill_compression_enabled() -> bool {
    app_config()
        .ok()
        .map(|c| c.spill.compression_enabled)
        .unwrap_or(true)
}

pub(crate) fn spill_compression_block_size_bytes() -> usize {
    app_config()
        .ok()
        .map(|c| c.spill.compression_block_size_bytes)
        .unwrap_or(64 * 1024)
}

pub(crate) fn sort_max_num_file_handles() -> usize {
    app_config()
        .ok()
        .map(|c| c.sort.max_num_file_handles)
        .unwrap_or(128)
}

pub(crate) fn sort_async_merge_enabled() -> bool {
    app_config()
        .ok()
        .map(|c| c.sort.async_merge_enabled)
        .unwrap_or(true)
}

pub(crate) fn sort_min_segments_per_side() -> usize {
    app_config()
        .ok()
        .map(|c| c.sort.min_segments_per_side)
        .unwrap_or(8)
}

pub(crate) fn join_max_group_bytes() -> u64 {
    app_config()
        .ok()
        .map(|c| c.join.max_join_group_bytes)
        .unwrap_or(0)
}

pub(crate) fn spill_io_threads() -> usize {
    app_config()
        .ok()
        .map(|c| c.runtime.actual_spill_io_threads())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

pub(crate) fn spill_io_queue_size() -> usize {
    app_config()
        .ok()
        .map(|c| {
            if c.runtime.spill_io_queue_size == 0 {
                1024
            } else {
                c.runtime.spill_io_queue_size
            }
        })
        .unwrap_or(1024)
}
