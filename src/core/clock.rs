// Copyright 2025 The Paraspin Authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Generation clock: the signal by which the main thread announces new work to
//! the worker threads, and the protocol to wake up workers that are blocked
//! waiting for it.

use crossbeam_utils::{Backoff, CachePadded};
#[cfg(test)]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// How idle worker threads wait for the next dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitMode {
    /// Idle workers busy-poll for new work. This yields the lowest wake-up
    /// latency, but each idle worker keeps a CPU busy.
    Spin,
    /// Idle workers block on a condition variable. Idle workers don't consume
    /// CPU time, but waking them up takes longer.
    Block,
}

/// A monotonic counter of dispatched jobs, paired with a wake-up mechanism for
/// blocked workers.
///
/// The generation is only ever advanced by the main thread, and read by
/// workers to detect that a new job is available. Advancing the generation
/// with [`Ordering::Release`] publishes all the writes that the main thread
/// did before (in particular the job descriptor) to the workers that observe
/// the new generation with [`Ordering::Acquire`].
pub struct GenerationClock {
    /// Number of jobs dispatched so far (plus one on shutdown).
    generation: CachePadded<AtomicU64>,
    /// Whether workers should block (rather than spin) on their next wait.
    blocking: AtomicBool,
    /// Lock held when checking or advancing the generation on the blocking
    /// path.
    wake_lock: Mutex<()>,
    /// Signaled whenever the generation advances while workers may be
    /// blocked.
    wake_signal: Condvar,
    /// Number of workers currently blocked on `wake_signal`.
    #[cfg(test)]
    num_sleeping: AtomicUsize,
}

impl GenerationClock {
    /// Creates a clock at generation 0, with idle workers using the given
    /// mode.
    pub fn new(wait_mode: WaitMode) -> Self {
        Self {
            generation: CachePadded::new(AtomicU64::new(0)),
            blocking: AtomicBool::new(wait_mode == WaitMode::Block),
            wake_lock: Mutex::new(()),
            wake_signal: Condvar::new(),
            #[cfg(test)]
            num_sleeping: AtomicUsize::new(0),
        }
    }

    /// Returns the current generation.
    pub fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns the wait mode that workers will use for their next wait.
    pub fn wait_mode(&self) -> WaitMode {
        if self.blocking.load(Ordering::Relaxed) {
            WaitMode::Block
        } else {
            WaitMode::Spin
        }
    }

    /// Sets the wait mode that workers will use once they finish the next
    /// generation, and returns the previous mode, i.e. the mode with which
    /// currently idle workers are waiting.
    ///
    /// Only the main thread may call this, and only while all the workers are
    /// idle. The new value is published to the workers by the following call
    /// to [`advance()`](Self::advance).
    pub fn set_wait_mode(&self, wait_mode: WaitMode) -> WaitMode {
        let was_blocking = self
            .blocking
            .swap(wait_mode == WaitMode::Block, Ordering::Relaxed);
        if was_blocking {
            WaitMode::Block
        } else {
            WaitMode::Spin
        }
    }

    /// Advances the generation by one and returns the new generation.
    ///
    /// `idle_mode` must be the mode with which the workers are currently
    /// waiting. If they may be blocked, the increment and the notification
    /// both happen under the wake lock, so that a worker can't check the
    /// generation, miss the increment and then sleep through the notification.
    pub fn advance(&self, idle_mode: WaitMode) -> u64 {
        match idle_mode {
            WaitMode::Spin => self.generation.fetch_add(1, Ordering::Release) + 1,
            WaitMode::Block => self.advance_and_wake_all(),
        }
    }

    /// Advances the generation by one and wakes all the blocked workers,
    /// regardless of the current wait mode.
    pub fn advance_and_wake_all(&self) -> u64 {
        let guard = self.lock();
        let generation = self.generation.fetch_add(1, Ordering::Release) + 1;
        self.wake_signal.notify_all();
        drop(guard);
        generation
    }

    /// Waits until the generation differs from `last_seen`, and returns the
    /// new generation.
    pub fn wait_for_advance(&self, last_seen: u64, wait_mode: WaitMode) -> u64 {
        match wait_mode {
            WaitMode::Spin => {
                let backoff = Backoff::new();
                loop {
                    let generation = self.generation.load(Ordering::Acquire);
                    if generation != last_seen {
                        return generation;
                    }
                    backoff.snooze();
                }
            }
            WaitMode::Block => {
                let mut guard = self.lock();
                loop {
                    let generation = self.generation.load(Ordering::Acquire);
                    if generation != last_seen {
                        return generation;
                    }
                    #[cfg(test)]
                    self.num_sleeping.fetch_add(1, Ordering::Relaxed);
                    guard = self
                        .wake_signal
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner);
                    #[cfg(test)]
                    self.num_sleeping.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Returns the number of workers currently blocked in
    /// [`wait_for_advance()`](Self::wait_for_advance).
    #[cfg(test)]
    pub fn num_sleeping(&self) -> usize {
        let _guard = self.lock();
        self.num_sleeping.load(Ordering::Relaxed)
    }

    /// The wake lock protects no data, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.wake_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_advance_increments_by_one() {
        let clock = GenerationClock::new(WaitMode::Spin);
        assert_eq!(clock.current(), 0);
        assert_eq!(clock.advance(WaitMode::Spin), 1);
        assert_eq!(clock.advance(WaitMode::Block), 2);
        assert_eq!(clock.advance_and_wake_all(), 3);
        assert_eq!(clock.current(), 3);
    }

    #[test]
    fn test_set_wait_mode_returns_previous() {
        let clock = GenerationClock::new(WaitMode::Block);
        assert_eq!(clock.wait_mode(), WaitMode::Block);
        assert_eq!(clock.set_wait_mode(WaitMode::Spin), WaitMode::Block);
        assert_eq!(clock.wait_mode(), WaitMode::Spin);
        assert_eq!(clock.set_wait_mode(WaitMode::Spin), WaitMode::Spin);
        assert_eq!(clock.set_wait_mode(WaitMode::Block), WaitMode::Spin);
        assert_eq!(clock.wait_mode(), WaitMode::Block);
    }

    #[test]
    fn test_wait_returns_immediately_if_advanced() {
        let clock = GenerationClock::new(WaitMode::Block);
        clock.advance(WaitMode::Block);
        assert_eq!(clock.wait_for_advance(0, WaitMode::Spin), 1);
        assert_eq!(clock.wait_for_advance(0, WaitMode::Block), 1);
        assert_eq!(clock.num_sleeping(), 0);
    }

    fn wake_up_waiter(wait_mode: WaitMode) {
        let clock = Arc::new(GenerationClock::new(wait_mode));
        let (tx, rx) = mpsc::channel();
        let waiter = std::thread::spawn({
            let clock = clock.clone();
            move || {
                let generation = clock.wait_for_advance(0, wait_mode);
                tx.send(generation).unwrap();
            }
        });

        if wait_mode == WaitMode::Block {
            while clock.num_sleeping() == 0 {
                std::thread::yield_now();
            }
        }
        assert!(rx.try_recv().is_err());

        clock.advance(wait_mode);
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)), Ok(1));
        waiter.join().unwrap();
        assert_eq!(clock.num_sleeping(), 0);
    }

    #[test]
    fn test_spinning_waiter_observes_advance() {
        wake_up_waiter(WaitMode::Spin);
    }

    #[test]
    fn test_blocked_waiter_is_woken_up() {
        wake_up_waiter(WaitMode::Block);
    }

    #[test]
    fn test_wake_all_releases_every_blocked_waiter() {
        const NUM_THREADS: usize = 4;

        let clock = Arc::new(GenerationClock::new(WaitMode::Block));
        let (tx, rx) = mpsc::channel();
        let waiters: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let clock = clock.clone();
                let tx = tx.clone();
                std::thread::spawn(move || {
                    tx.send(clock.wait_for_advance(0, WaitMode::Block)).unwrap();
                })
            })
            .collect();

        while clock.num_sleeping() != NUM_THREADS {
            std::thread::yield_now();
        }

        clock.advance_and_wake_all();
        for _ in 0..NUM_THREADS {
            assert_eq!(rx.recv_timeout(Duration::from_secs(10)), Ok(1));
        }
        for waiter in waiters {
            waiter.join().unwrap();
        }
    }
}
