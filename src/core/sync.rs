// Copyright 2025 The Paraspin Authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization primitives

use crossbeam_utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Barrier on which the main thread waits for all the worker threads to
/// finish the current generation.
///
/// Each worker [`arrive()`](Self::arrive)s exactly once per generation. The
/// main thread spins in [`wait()`](Self::wait) rather than blocking, as it
/// only waits once it has finished its own share of the work, at which point
/// the workers are expected to be done soon.
pub struct CompletionBarrier {
    /// Number of workers that must arrive.
    num_workers: usize,
    /// Number of workers that finished the current generation.
    num_done: CachePadded<AtomicUsize>,
    /// Number of workers whose job panicked during the current generation.
    num_panicking: CachePadded<AtomicUsize>,
}

impl CompletionBarrier {
    /// Creates a barrier for the given number of workers. No worker has
    /// arrived yet.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            num_done: CachePadded::new(AtomicUsize::new(0)),
            num_panicking: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Prepares the barrier for the next generation.
    ///
    /// Must only be called by the main thread while all the workers are idle.
    /// The reset is published to the workers by the subsequent generation
    /// advance.
    pub fn reset(&self) {
        self.num_done.store(0, Ordering::Relaxed);
        self.num_panicking.store(0, Ordering::Relaxed);
    }

    /// Records that the calling worker is done with the current generation.
    ///
    /// All the writes made by the worker before this call are visible to the
    /// main thread once [`wait()`](Self::wait) returns.
    pub fn arrive(&self) {
        let _previous = self.num_done.fetch_add(1, Ordering::Release);
        debug_assert!(
            _previous < self.num_workers,
            "More workers arrived at the barrier than there are in the pool"
        );
    }

    /// Records that the job of the calling worker panicked. Must be called
    /// before [`arrive()`](Self::arrive).
    pub fn record_panic(&self) {
        self.num_panicking.fetch_add(1, Ordering::Relaxed);
    }

    /// Spins until all the workers have arrived.
    pub fn wait(&self) {
        let backoff = Backoff::new();
        while self.num_done.load(Ordering::Acquire) != self.num_workers {
            backoff.snooze();
        }
    }

    /// Returns the number of workers whose job panicked in the current
    /// generation. Only meaningful once [`wait()`](Self::wait) has returned.
    pub fn num_panicking(&self) -> usize {
        self.num_panicking.load(Ordering::Relaxed)
    }

    /// Returns the number of workers that arrived so far.
    #[cfg(test)]
    pub fn num_done(&self) -> usize {
        self.num_done.load(Ordering::Acquire)
    }
}
