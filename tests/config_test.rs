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
//! Integration tests for configuration loading and operator settings.

use crate::common::{TestConfig, int_functions, run_join, uniform_rows};
use novarocks_smj::novarocks_config::AppConfig;
use novarocks_smj::{JoinType, SmjError, SortMergeJoinOperator};

mod common;

#[test]
fn test_config_file_loading() {
    let test_config = TestConfig::new().expect("Failed to create test config");
    let config = test_config.load_config().expect("Failed to load config");
    assert_eq!(config.effective_log_filter(), "debug");
    assert_eq!(config.memory.total_bytes, 4 * 1024 * 1024);
    assert_eq!(config.memory.segment_size_bytes, 32 * 1024);
    assert_eq!(
        config.spill.local_dirs,
        vec![test_config.spill_dir().display().to_string()]
    );
    assert_eq!(config.sort.min_segments_per_side, 4);
    assert_eq!(config.join.max_join_group_bytes, 0);
    assert_eq!(config.runtime.spill_io_queue_size, 1024);
}

#[test]
fn test_log_filter_overrides_level() {
    let config = AppConfig::parse(
        r#"
log_level = "warn"
log_filter = "novarocks_smj=trace"
"#,
    )
    .expect("Failed to parse config");
    assert_eq!(config.effective_log_filter(), "novarocks_smj=trace");
}

#[test]
fn test_malformed_config_is_rejected() {
    let err = AppConfig::parse("[memory]\ntotal_bytes = \"lots\"\n");
    assert!(err.is_err());
}

#[test]
fn test_invalid_operator_settings_fail_open() {
    let test_config = TestConfig::new().expect("Failed to create test config");

    let mut zero_segment = test_config.in_memory_config();
    zero_segment.segment_size_bytes = 0;
    let mut no_dirs = test_config.in_memory_config();
    no_dirs.spill.local_dirs.clear();
    let mut fan_in_one = test_config.in_memory_config();
    fan_in_one.sorter.max_num_file_handles = 1;
    let mut zero_block = test_config.in_memory_config();
    zero_block.spill.compression_block_size_bytes = 0;

    for config in [zero_segment, no_dirs, fan_in_one, zero_block] {
        let mut op =
            SortMergeJoinOperator::new(JoinType::Inner, int_functions(JoinType::Inner), config);
        let err = assert_err!(op.open());
        assert!(matches!(err, SmjError::Internal(_)), "{err}");
        assert_ok!(op.close());
    }
}

#[test]
fn test_join_runs_with_logging_enabled() {
    let test_config = TestConfig::new().expect("Failed to create test config");
    test_config.init_logging();
    // Initialisation is idempotent.
    test_config.init_logging();
    let (out, _op) = assert_ok!(run_join(
        JoinType::Inner,
        int_functions(JoinType::Inner),
        test_config.spilling_config(),
        uniform_rows(0..50, 3, 0, 1),
        uniform_rows(0..50, 5, 1_000, 2),
    ));
    assert_eq!(out.len(), 750);
}
