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
//! Error taxonomy for the sort-merge join core.
//!
//! Every kind is fatal at this layer: callers surface it to the operator
//! wrapper, which fails the task. Nothing here is retried locally.

use std::io;
use std::path::Path;

use thiserror::Error;

pub type SmjResult<T> = Result<T, SmjError>;

#[derive(Debug, Error)]
pub enum SmjError {
    /// The memory budget cannot satisfy a request, including a side's
    /// guaranteed minimum.
    #[error("memory exhausted: {0}")]
    MemoryExhausted(String),

    /// Write or read fault on a spill channel.
    #[error("spill io error: {0}")]
    SpillIo(String),

    /// A spill channel failed validation while being read back.
    #[error("corrupt spill channel: {0}")]
    CorruptChannel(String),

    /// The injected join condition reported a failure. The message is the
    /// condition's own.
    #[error("join condition evaluation failed: {0}")]
    ConditionEvaluation(String),

    /// Programming errors: double release, leaked segments, lifecycle misuse.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SmjError {
    pub fn spill_io(action: &str, path: &Path, err: io::Error) -> Self {
        SmjError::SpillIo(format!("{action} {} failed: {err}", path.display()))
    }

    pub fn corrupt(path: &Path, detail: impl AsRef<str>) -> Self {
        SmjError::CorruptChannel(format!("{}: {}", path.display(), detail.as_ref()))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            SmjError::MemoryExhausted(_) => "MemoryExhausted",
            SmjError::SpillIo(_) => "SpillIOError",
            SmjError::CorruptChannel(_) => "CorruptChannel",
            SmjError::ConditionEvaluation(_) => "ConditionEvaluationError",
            SmjError::Internal(_) => "Internal",
        }
    }
}
