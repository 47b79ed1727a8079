// Copyright 2025 The Paraspin Authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Process-wide thread pool, for callers that don't want to manage their own.

use super::clock::WaitMode;
use super::thread_pool::{CpuPinningPolicy, ThreadCount, ThreadPool, ThreadPoolBuilder};
use crate::macros::log_debug;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

static GLOBAL_POOL: OnceLock<Mutex<ThreadPool>> = OnceLock::new();

impl ThreadPool {
    /// Returns exclusive access to a process-wide thread pool, which is
    /// spawned on first use.
    ///
    /// The global pool spawns [`ThreadCount::AvailableParallelism`] workers
    /// that initially block when idle, and is never dropped. Callers are
    /// serialized by a mutex: dispatching on the global pool from within one
    /// of its own jobs deadlocks.
    ///
    /// Building dedicated pools with [`ThreadPoolBuilder`] is equally valid.
    ///
    /// ```
    /// # use paraspin::{ThreadPool, WaitMode};
    /// # use std::sync::atomic::{AtomicUsize, Ordering};
    /// let count = AtomicUsize::new(0);
    /// ThreadPool::global().dispatch_indexed(
    ///     100,
    ///     |_lock, _i| {
    ///         count.fetch_add(1, Ordering::Relaxed);
    ///     },
    ///     WaitMode::Block,
    /// );
    /// assert_eq!(count.into_inner(), 100);
    /// ```
    pub fn global() -> MutexGuard<'static, ThreadPool> {
        GLOBAL_POOL
            .get_or_init(|| {
                log_debug!("[main thread] Spawning the global thread pool");
                Mutex::new(
                    ThreadPoolBuilder {
                        num_threads: ThreadCount::AvailableParallelism,
                        wait_mode: WaitMode::Block,
                        cpu_pinning: CpuPinningPolicy::No,
                    }
                    .build(),
                )
            })
            .lock()
            // A dispatch that panicked still waited for all the workers, so the pool
            // is consistent.
            .unwrap_or_else(PoisonError::into_inner)
    }
}
