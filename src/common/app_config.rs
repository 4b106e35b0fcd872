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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static AppConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = AppConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG.get().ok_or_else(|| anyhow!("config was not installed"))
}

pub fn init_from_env_or_default() -> Result<&'static AppConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = AppConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG.get().ok_or_else(|| anyhow!("config was not installed"))
}

pub fn config() -> Result<&'static AppConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("NOVAROCKS_SMJ_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidate = PathBuf::from("novarocks_smj.toml");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(anyhow!(
        "missing config file: set $NOVAROCKS_SMJ_CONFIG or create ./novarocks_smj.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub spill: SpillStorageConfig,

    #[serde(default)]
    pub sort: SortConfig,

    #[serde(default)]
    pub join: JoinConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        Self::parse(&s).with_context(|| format!("parse toml: {}", path.display()))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let cfg: AppConfig = toml::from_str(s)?;
        Ok(cfg)
    }

    pub fn effective_log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(&self.log_level)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            memory: MemoryConfig::default(),
            spill: SpillStorageConfig::default(),
            sort: SortConfig::default(),
            join: JoinConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_total_bytes")]
    pub total_bytes: u64,
    #[serde(default = "default_segment_size_bytes")]
    pub segment_size_bytes: usize,
}

fn default_memory_total_bytes() -> u64 {
    32 * 1024 * 1024
}

fn default_segment_size_bytes() -> usize {
    32 * 1024
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            total_bytes: default_memory_total_bytes(),
            segment_size_bytes: default_segment_size_bytes(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SpillStorageConfig {
    #[serde(default)]
    pub local_dirs: Vec<String>,
    #[serde(default = "default_spill_compression_enabled")]
    pub compression_enabled: bool,
    #[serde(default = "default_spill_compression_block_size_bytes")]
    pub compression_block_size_bytes: usize,
}

fn default_spill_compression_enabled() -> bool {
    true
}

fn default_spill_compression_block_size_bytes() -> usize {
    64 * 1024
}

impl Default for SpillStorageConfig {
    fn default() -> Self {
        Self {
            local_dirs: Vec::new(),
            compression_enabled: default_spill_compression_enabled(),
            compression_block_size_bytes: default_spill_compression_block_size_bytes(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SortConfig {
    #[serde(default = "default_sort_max_num_file_handles")]
    pub max_num_file_handles: usize,
    #[serde(default = "default_sort_async_merge_enabled")]
    pub async_merge_enabled: bool,
    #[serde(default = "default_sort_min_segments_per_side")]
    pub min_segments_per_side: usize,
}

fn default_sort_max_num_file_handles() -> usize {
    128
}

fn default_sort_async_merge_enabled() -> bool {
    true
}

fn default_sort_min_segments_per_side() -> usize {
    8
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            max_num_file_handles: default_sort_max_num_file_handles(),
            async_merge_enabled: default_sort_async_merge_enabled(),
            min_segments_per_side: default_sort_min_segments_per_side(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct JoinConfig {
    /// 0 means a join group is bounded only by available memory.
    #[serde(default)]
    pub max_join_group_bytes: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_spill_io_threads")]
    pub spill_io_threads: usize,
    #[serde(default = "default_spill_io_queue_size")]
    pub spill_io_queue_size: usize,
}

fn default_spill_io_threads() -> usize {
    0 // 0 means use available parallelism
}

fn default_spill_io_queue_size() -> usize {
    1024
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            spill_io_threads: default_spill_io_threads(),
            spill_io_queue_size: default_spill_io_queue_size(),
        }
    }
}

impl RuntimeConfig {
    /// Returns CPU cores if configured as 0.
    pub fn actual_spill_io_threads(&self) -> usize {
        if self.spill_io_threads > 0 {
            self.spill_io_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let cfg = AppConfig::parse("").unwrap();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.memory.segment_size_bytes, 32 * 1024);
        assert!(cfg.spill.compression_enabled);
        assert_eq!(cfg.spill.compression_block_size_bytes, 64 * 1024);
        assert_eq!(cfg.sort.max_num_file_handles, 128);
        assert!(cfg.sort.async_merge_enabled);
        assert_eq!(cfg.join.max_join_group_bytes, 0);
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = AppConfig::parse(
            r#"
log_level = "debug"
log_filter = "novarocks_smj=trace"

[memory]
total_bytes = 1048576
segment_size_bytes = 4096

[spill]
local_dirs = ["/data/spill0", "/data/spill1"]
compression_enabled = false

[sort]
max_num_file_handles = 16
async_merge_enabled = false
min_segments_per_side = 4

[join]
max_join_group_bytes = 65536
"#,
        )
        .unwrap();
        assert_eq!(cfg.effective_log_filter(), "novarocks_smj=trace");
        assert_eq!(cfg.memory.total_bytes, 1_048_576);
        assert_eq!(cfg.memory.segment_size_bytes, 4096);
        assert_eq!(cfg.spill.local_dirs.len(), 2);
        assert!(!cfg.spill.compression_enabled);
        assert_eq!(cfg.sort.max_num_file_handles, 16);
        assert!(!cfg.sort.async_merge_enabled);
        assert_eq!(cfg.sort.min_segments_per_side, 4);
        assert_eq!(cfg.join.max_join_group_bytes, 65536);
    }

    #[test]
    fn malformed_toml_is_rejected() {
        assert!(AppConfig::parse("[memory]\ntotal_bytes = \"lots\"").is_err());
    }
}
