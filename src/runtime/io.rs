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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use threadpool::ThreadPool;

use crate::common::config::{spill_io_queue_size, spill_io_threads};

pub struct IoTaskContext {
    cancelled: Arc<AtomicBool>,
}

impl IoTaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct IoTaskCompletion {
    done: AtomicBool,
    cv: Condvar,
    mu: Mutex<()>,
}

impl IoTaskCompletion {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            cv: Condvar::new(),
            mu: Mutex::new(()),
        }
    }

    fn mark_done(&self) {
        let _guard = self.mu.lock().unwrap_or_else(|e| e.into_inner());
        self.done.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    fn wait(&self) {
        let guard = self.mu.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = self
            .cv
            .wait_while(guard, |_| !self.done.load(Ordering::Acquire))
            .unwrap_or_else(|e| e.into_inner());
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.mu.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |_| !self.done.load(Ordering::Acquire))
            .unwrap_or_else(|e| e.into_inner());
        drop(guard);
        self.done.load(Ordering::Acquire)
    }
}

// Marks the task finished even if the closure panics, so waiters never hang.
struct CompletionGuard(Arc<IoTaskCompletion>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.mark_done();
    }
}

#[derive(Clone)]
pub struct IoTaskHandle {
    cancelled: Arc<AtomicBool>,
    completion: Arc<IoTaskCompletion>,
}

impl IoTaskHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.completion.done.load(Ordering::Acquire)
    }

    pub fn wait(&self) {
        self.completion.wait();
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.completion.wait_timeout(timeout)
    }
}

/// Background workers for spill reads.
pub struct IoExecutor {
    pool: ThreadPool,
    queue_size: usize,
}

impl IoExecutor {
    pub fn new(num_threads: usize, queue_size: usize) -> Self {
        let threads = num_threads.max(1);
        let pool = ThreadPool::with_name("spill_io".to_string(), threads);
        Self {
            pool,
            queue_size: queue_size.max(1),
        }
    }

    /// False when the backlog has reached the configured queue size; callers
    /// then do the IO inline.
    pub fn has_capacity(&self) -> bool {
        self.pool.queued_count() < self.queue_size
    }

    pub fn submit<F>(&self, task: F) -> IoTaskHandle
    where
        F: FnOnce(IoTaskContext) + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let completion = Arc::new(IoTaskCompletion::new());
        let ctx = IoTaskContext {
            cancelled: Arc::clone(&cancelled),
        };
        let guard = CompletionGuard(Arc::clone(&completion));
        let runner = move || {
            let _guard = guard;
            task(ctx);
        };
        self.pool.execute(runner);
        IoTaskHandle {
            cancelled,
            completion,
        }
    }
}

static SPILL_IO_EXECUTOR: OnceLock<IoExecutor> = OnceLock::new();

pub fn spill_io_executor() -> &'static IoExecutor {
    SPILL_IO_EXECUTOR.get_or_init(|| IoExecutor::new(spill_io_threads(), spill_io_queue_size()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn submitted_task_runs_and_completes() {
        let executor = IoExecutor::new(2, 16);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let handle = executor.submit(move |ctx| {
            if !ctx.is_cancelled() {
                hits_clone.fetch_add(1, Ordering::AcqRel);
            }
        });
        handle.wait();
        assert!(handle.is_finished());
        assert_eq!(hits.load(Ordering::Acquire), 1);
    }

    #[test]
    fn panicking_task_still_completes() {
        let executor = IoExecutor::new(1, 16);
        let handle = executor.submit(|_| panic!("boom"));
        assert!(handle.wait_timeout(Duration::from_secs(10)));
    }
}
