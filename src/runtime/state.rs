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
//! Partitioned list state offered to the operator wrapper.
//!
//! The join core never touches this; a wrapper that wants to checkpoint
//! progress writes through it.

use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture, FutureExt};

use crate::common::error::SmjResult;

pub type StateFuture<T> = BoxFuture<'static, SmjResult<T>>;

pub trait ListState<T>: Send + Sync
where
    T: Clone + Send + 'static,
{
    fn get(&self) -> SmjResult<Vec<T>>;

    fn add(&self, value: T) -> SmjResult<()>;

    /// Replace the whole list.
    fn update(&self, values: Vec<T>) -> SmjResult<()>;

    fn add_all(&self, values: Vec<T>) -> SmjResult<()>;

    fn clear(&self) -> SmjResult<()> {
        self.update(Vec::new())
    }

    fn async_get(&self) -> StateFuture<Vec<T>>;

    fn async_add(&self, value: T) -> StateFuture<()>;

    fn async_update(&self, values: Vec<T>) -> StateFuture<()>;

    fn async_add_all(&self, values: Vec<T>) -> StateFuture<()>;
}

/// Heap-backed list state; clones share the same list.
#[derive(Debug)]
pub struct InMemoryListState<T> {
    values: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for InMemoryListState<T> {
    fn clone(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
        }
    }
}

impl<T> Default for InMemoryListState<T> {
    fn default() -> Self {
        Self {
            values: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T> InMemoryListState<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T> ListState<T> for InMemoryListState<T>
where
    T: Clone + Send + 'static,
{
    fn get(&self) -> SmjResult<Vec<T>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn add(&self, value: T) -> SmjResult<()> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(value);
        Ok(())
    }

    fn update(&self, values: Vec<T>) -> SmjResult<()> {
        *self.values.lock().unwrap_or_else(|e| e.into_inner()) = values;
        Ok(())
    }

    fn add_all(&self, values: Vec<T>) -> SmjResult<()> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(values);
        Ok(())
    }

    fn async_get(&self) -> StateFuture<Vec<T>> {
        let this = self.clone();
        future::lazy(move |_| this.get()).boxed()
    }

    fn async_add(&self, value: T) -> StateFuture<()> {
        let this = self.clone();
        future::lazy(move |_| this.add(value)).boxed()
    }

    fn async_update(&self, values: Vec<T>) -> StateFuture<()> {
        let this = self.clone();
        future::lazy(move |_| this.update(values)).boxed()
    }

    fn async_add_all(&self, values: Vec<T>) -> StateFuture<()> {
        let this = self.clone();
        future::lazy(move |_| this.add_all(values)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn sync_and_async_views_agree() {
        let state = InMemoryListState::<u64>::new();
        state.add(1).unwrap();
        block_on(state.async_add_all(vec![2, 3])).unwrap();
        assert_eq!(state.get().unwrap(), vec![1, 2, 3]);
        block_on(state.async_update(vec![9])).unwrap();
        assert_eq!(block_on(state.async_get()).unwrap(), vec![9]);
        state.clear().unwrap();
        assert!(state.get().unwrap().is_empty());
    }

    #[test]
    fn async_ops_are_lazy_until_polled() {
        let state = InMemoryListState::<u64>::new();
        let pending = state.async_add(5);
        assert!(state.get().unwrap().is_empty());
        block_on(pending).unwrap();
        assert_eq!(state.get().unwrap(), vec![5]);
    }
}
