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
//! External sorter used by each side of the sort-merge join.
//!
//! Responsibilities:
//! - Buffer rows in memory segments and sort them by normalized key.
//! - Spill full buffers as sorted channels and merge them back in key order.
//! - Keep every segment inside the side's `SegmentPool` share.

pub mod external_sorter;
pub mod merge_iterator;
pub mod sort_buffer;

pub use external_sorter::{ExternalSorter, SortedStream, SorterSettings};
