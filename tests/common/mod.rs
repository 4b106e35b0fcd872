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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tempfile::TempDir;

use novarocks_smj::exec::expr::int_key::{
    FieldKeyProjection, IntKeyComparator, IntNormalizedKeyComputer, JoinedRowProjection,
    TrueCondition,
};
use novarocks_smj::exec::operators::sort::SorterSettings;
use novarocks_smj::exec::spill::SpillSettings;
use novarocks_smj::novarocks_config::AppConfig;
use novarocks_smj::novarocks_logging;
use novarocks_smj::{
    BinaryRow, BinaryRowWriter, JoinCondition, JoinType, Side, SmjResult, SortMergeJoinConfig,
    SortMergeJoinFunctions, SortMergeJoinOperator,
};

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with a private spill directory.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_novarocks_smj.toml");
        let spill_dir = temp_dir.path().join("spill");

        let config_content = format!(
            r#"
log_level = "debug"

[memory]
total_bytes = 4194304
segment_size_bytes = 32768

[spill]
local_dirs = ["{}"]
compression_enabled = true
compression_block_size_bytes = 65536

[sort]
max_num_file_handles = 128
async_merge_enabled = true
min_segments_per_side = 4

[join]
max_join_group_bytes = 0
"#,
            spill_dir.display()
        );
        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    pub fn spill_dir(&self) -> PathBuf {
        self.temp_dir.path().join("spill")
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        novarocks_logging::init_with_level("debug");
    }

    /// Parse the test configuration without installing it process-wide.
    pub fn load_config(&self) -> anyhow::Result<AppConfig> {
        AppConfig::load_from_file(&self.config_path)
    }

    /// Operator config with the given budget, spilling into this test's dir.
    pub fn join_config(&self, total_bytes: u64, segment_size: usize) -> SortMergeJoinConfig {
        SortMergeJoinConfig {
            memory_total_bytes: total_bytes,
            segment_size_bytes: segment_size,
            min_segments_per_side: 4,
            max_join_group_bytes: 0,
            sorter: SorterSettings::default(),
            spill: SpillSettings {
                local_dirs: vec![self.spill_dir()],
                compression_enabled: true,
                compression_block_size_bytes: 64 * 1024,
            },
        }
    }

    /// Budget large enough that nothing spills.
    pub fn in_memory_config(&self) -> SortMergeJoinConfig {
        self.join_config(4 * 1024 * 1024, 32 * 1024)
    }

    /// Budget small enough that both sides of the larger scenarios spill.
    pub fn spilling_config(&self) -> SortMergeJoinConfig {
        self.join_config(24 * 1024, 1024)
    }

    pub fn spill_files(&self) -> usize {
        std::fs::read_dir(self.spill_dir())
            .map(|dir| dir.count())
            .unwrap_or(0)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

pub fn int_row(key: Option<i64>, value: i64) -> BinaryRow {
    let mut w = BinaryRowWriter::new(2);
    if let Some(k) = key {
        w.write_long(0, k);
    }
    w.write_long(1, value);
    w.finish()
}

/// `rows_per_key` rows for each key in `keys`, shuffled. Values are unique
/// sequence numbers starting at `first_value`.
pub fn uniform_rows(
    keys: std::ops::Range<i64>,
    rows_per_key: usize,
    first_value: i64,
    seed: u64,
) -> Vec<BinaryRow> {
    let mut rows = Vec::new();
    let mut value = first_value;
    for key in keys {
        for _ in 0..rows_per_key {
            rows.push(int_row(Some(key), value));
            value += 1;
        }
    }
    rows.shuffle(&mut StdRng::seed_from_u64(seed));
    rows
}

/// Key in field 0, payload in field 1, null keys never match.
pub fn int_functions(join_type: JoinType) -> SortMergeJoinFunctions {
    let projection = if matches!(join_type, JoinType::LeftSemi | JoinType::LeftAnti) {
        JoinedRowProjection::left_only(2)
    } else {
        JoinedRowProjection::new(2, 2)
    };
    SortMergeJoinFunctions {
        left_key_projection: Arc::new(FieldKeyProjection::new(vec![0])),
        right_key_projection: Arc::new(FieldKeyProjection::new(vec![0])),
        normalized_key_computer: Arc::new(IntNormalizedKeyComputer::new(1)),
        comparator: Arc::new(IntKeyComparator::new(1)),
        condition: Arc::new(TrueCondition),
        projection: Arc::new(projection),
        filter_nulls: vec![true],
    }
}

pub fn with_condition(
    mut functions: SortMergeJoinFunctions,
    condition: Arc<dyn JoinCondition>,
) -> SortMergeJoinFunctions {
    functions.condition = condition;
    functions
}

/// Feed both inputs, interleaved, and end them.
pub fn feed(
    op: &mut SortMergeJoinOperator,
    left: Vec<BinaryRow>,
    right: Vec<BinaryRow>,
) -> SmjResult<()> {
    let mut left = left.into_iter();
    let mut right = right.into_iter();
    loop {
        let l = left.next();
        let r = right.next();
        if l.is_none() && r.is_none() {
            break;
        }
        if let Some(row) = l {
            op.process_element(Side::Left, row)?;
        }
        if let Some(row) = r {
            op.process_element(Side::Right, row)?;
        }
    }
    op.end_input(Side::Left)?;
    op.end_input(Side::Right)
}

pub fn drain(op: &mut SortMergeJoinOperator) -> SmjResult<Vec<BinaryRow>> {
    let mut out = Vec::new();
    while let Some(row) = op.next_output()? {
        out.push(row);
    }
    Ok(out)
}

/// Open, feed, drain and close an operator. Returns the output and the
/// closed operator so callers can inspect its profile and memory.
pub fn run_join(
    join_type: JoinType,
    functions: SortMergeJoinFunctions,
    config: SortMergeJoinConfig,
    left: Vec<BinaryRow>,
    right: Vec<BinaryRow>,
) -> SmjResult<(Vec<BinaryRow>, SortMergeJoinOperator)> {
    let mut op = SortMergeJoinOperator::new(join_type, functions, config);
    let result = op
        .open()
        .and_then(|_| feed(&mut op, left, right))
        .and_then(|_| drain(&mut op));
    let closed = op.close();
    let rows = result?;
    closed?;
    Ok((rows, op))
}

pub fn values(row: &BinaryRow) -> Vec<Option<i64>> {
    (0..row.arity()).map(|i| row.get_long(i)).collect()
}

/// Output as a sorted multiset of field values.
pub fn multiset(rows: &[BinaryRow]) -> Vec<Vec<Option<i64>>> {
    let mut out: Vec<Vec<Option<i64>>> = rows.iter().map(values).collect();
    out.sort();
    out
}

pub fn distinct_keys(rows: &[BinaryRow], field: usize) -> usize {
    let mut keys: Vec<Option<i64>> = rows.iter().map(|r| r.get_long(field)).collect();
    keys.sort();
    keys.dedup();
    keys.len()
}

/// Nested-loop reference with the same output shape as `int_functions`.
pub fn reference_join(
    join_type: JoinType,
    left: &[BinaryRow],
    right: &[BinaryRow],
    condition: &dyn Fn(&BinaryRow, &BinaryRow) -> bool,
) -> Vec<Vec<Option<i64>>> {
    let matches = |l: &BinaryRow, r: &BinaryRow| {
        l.get_long(0).is_some() && l.get_long(0) == r.get_long(0) && condition(l, r)
    };
    let mut out = Vec::new();
    let mut right_matched = vec![false; right.len()];
    for l in left {
        let mut matched = false;
        for (j, r) in right.iter().enumerate() {
            if matches(l, r) {
                matched = true;
                right_matched[j] = true;
                if !matches!(join_type, JoinType::LeftSemi | JoinType::LeftAnti) {
                    out.push([values(l), values(r)].concat());
                }
            }
        }
        match join_type {
            JoinType::LeftSemi if matched => out.push(values(l)),
            JoinType::LeftAnti if !matched => out.push(values(l)),
            JoinType::LeftOuter | JoinType::FullOuter if !matched => {
                out.push([values(l), vec![None, None]].concat())
            }
            _ => {}
        }
    }
    if matches!(join_type, JoinType::RightOuter | JoinType::FullOuter) {
        for (j, r) in right.iter().enumerate() {
            if !right_matched[j] {
                out.push([vec![None, None], values(r)].concat());
            }
        }
    }
    out.sort();
    out
}

/// Assert that a result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}

/// Assert that a result is Err.
#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        match $result {
            Ok(_) => panic!("Expected Err, got Ok"),
            Err(e) => e,
        }
    };
}
