// Copyright 2025 The Paraspin Authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Job descriptors, and the slot through which the main thread lends them to
//! the worker threads.

use super::partition::Partition;
use std::cell::UnsafeCell;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Mutex;

/// Lock shared by all the invocations of a job, for the job's own use (e.g. to
/// guard an output shared between threads). The thread pool never acquires it
/// itself.
pub type JobLock = Mutex<()>;

/// A job to run on every participant of a dispatch.
#[derive(Clone, Copy)]
pub enum Job<'a> {
    /// Called once with each participant's whole (non-empty) range.
    Range(&'a (dyn Fn(&JobLock, Range<usize>) + Sync + 'a)),
    /// Called once for each index in each participant's range.
    Indexed(&'a (dyn Fn(&JobLock, usize) + Sync + 'a)),
}

impl Job<'_> {
    /// Runs this job over the given range. Nothing is called if the range is
    /// empty.
    pub fn run(&self, lock: &JobLock, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        match self {
            Job::Range(f) => f(lock, range),
            Job::Indexed(f) => range.for_each(|i| f(lock, i)),
        }
    }

    /// Short name of this job's kind, for logging purposes.
    #[cfg(feature = "log_parallelism")]
    pub fn kind(&self) -> &'static str {
        match self {
            Job::Range(_) => "range",
            Job::Indexed(_) => "indexed",
        }
    }
}

/// A job together with how its input is split.
#[derive(Clone, Copy)]
struct Published {
    /// Lifetime-erased pointer to the job, which lives on the main thread's
    /// stack for the duration of a dispatch.
    job: NonNull<Job<'static>>,
    partition: Partition,
}

/// Slot holding the job of the current generation.
///
/// The slot has no synchronization of its own: accesses are ordered by the
/// generation hand-off. The main thread only writes to it while all the
/// workers are idle, i.e. before advancing the generation (release) and after
/// the completion barrier (acquire). Workers only read it after observing the
/// new generation (acquire) and before arriving at the barrier (release).
pub struct JobSlot {
    published: UnsafeCell<Option<Published>>,
}

impl JobSlot {
    /// Creates an empty slot.
    pub fn empty() -> Self {
        Self {
            published: UnsafeCell::new(None),
        }
    }

    /// Publishes the given job and partition.
    ///
    /// # Safety
    ///
    /// - No other thread may access this slot during this call.
    /// - The job must outlive every reference later obtained via
    ///   [`get()`](Self::get), until the next call to
    ///   [`clear()`](Self::clear).
    pub unsafe fn publish(&self, job: &Job<'_>, partition: Partition) {
        let job = NonNull::from(job).cast::<Job<'static>>();
        // SAFETY: Exclusive access is ensured by the caller.
        unsafe {
            *self.published.get() = Some(Published { job, partition });
        }
    }

    /// Clears the published job. Subsequent calls to [`get()`](Self::get)
    /// obtain [`None`].
    ///
    /// # Safety
    ///
    /// No other thread may access this slot during this call.
    pub unsafe fn clear(&self) {
        // SAFETY: Exclusive access is ensured by the caller.
        unsafe {
            *self.published.get() = None;
        }
    }

    /// Returns the job and partition previously published, if any.
    ///
    /// # Safety
    ///
    /// - No thread may write to this slot during the whole output lifetime.
    /// - The published job must be valid during the whole output lifetime.
    pub unsafe fn get<'a>(&self) -> Option<(&'a Job<'a>, Partition)> {
        // SAFETY: There is no concurrent write, as ensured by the caller.
        let published = unsafe { *self.published.get() };
        published.map(|Published { job, partition }| {
            // SAFETY:
            // - This pointer points to a valid `Job`, as previously set via `publish()`.
            // - The job outlives the output lifetime, as ensured by the caller.
            let job = unsafe { job.cast::<Job<'a>>().as_ref() };
            (job, partition)
        })
    }
}

// SAFETY: A `JobSlot` acts as a `&Job`, whose callbacks are `Sync`. Moving the
// slot to another thread is therefore sound.
unsafe impl Send for JobSlot {}
// SAFETY: Accesses to the cell are synchronized by the generation hand-off, as
// required by the safety contracts of `publish()`, `clear()` and `get()`.
unsafe impl Sync for JobSlot {}

#[cfg(test)]
mod test {
    use super::*;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_range_job_called_once_per_range() {
        let lock = JobLock::default();
        let calls = Mutex::new(Vec::new());
        let f = |_: &JobLock, range: Range<usize>| calls.lock().unwrap().push(range);
        let job = Job::Range(&f);

        job.run(&lock, 3..7);
        job.run(&lock, 5..5);
        job.run(&lock, 0..1);
        assert_eq!(*calls.lock().unwrap(), [3..7, 0..1]);
    }

    #[test]
    fn test_indexed_job_called_once_per_index() {
        let lock = JobLock::default();
        let calls = Mutex::new(Vec::new());
        let f = |_: &JobLock, i: usize| calls.lock().unwrap().push(i);
        let job = Job::Indexed(&f);

        job.run(&lock, 3..7);
        job.run(&lock, 5..5);
        assert_eq!(*calls.lock().unwrap(), [3, 4, 5, 6]);
    }

    #[test]
    fn test_job_can_use_lock() {
        let lock = JobLock::default();
        let total = AtomicUsize::new(0);
        let f = |lock: &JobLock, i: usize| {
            let _guard = lock.lock().unwrap();
            total.fetch_add(i, Ordering::Relaxed);
        };
        Job::Indexed(&f).run(&lock, 0..10);
        assert_eq!(total.load(Ordering::Relaxed), 45);
        assert!(lock.try_lock().is_ok());
    }

    #[test]
    fn test_slot_publish_get_clear() {
        let slot = JobSlot::empty();
        assert!(unsafe { slot.get() }.is_none());

        let sum = AtomicUsize::new(0);
        let f = |_: &JobLock, range: Range<usize>| {
            sum.fetch_add(range.sum::<usize>(), Ordering::Relaxed);
        };
        let job = Job::Range(&f);
        let partition = Partition::new(10, NonZeroUsize::try_from(1).unwrap());
        unsafe { slot.publish(&job, partition) };

        let (published, published_partition) = unsafe { slot.get() }.unwrap();
        assert_eq!(published_partition, partition);
        published.run(&JobLock::default(), partition.range(1));
        assert_eq!(sum.load(Ordering::Relaxed), 5 + 6 + 7 + 8 + 9);

        unsafe { slot.clear() };
        assert!(unsafe { slot.get() }.is_none());
    }

    #[test]
    fn test_slot_read_from_other_threads() {
        const NUM_THREADS: usize = 3;

        let slot = Arc::new(JobSlot::empty());
        let counter = AtomicUsize::new(0);
        let f = |_: &JobLock, _: usize| {
            counter.fetch_add(1, Ordering::Relaxed);
        };
        let job = Job::Indexed(&f);
        let partition = Partition::new(8, NonZeroUsize::try_from(NUM_THREADS).unwrap());
        unsafe { slot.publish(&job, partition) };

        std::thread::scope(|scope| {
            for id in 1..=NUM_THREADS {
                let slot = slot.clone();
                // Spawning the threads orders them after the publish.
                scope.spawn(move || {
                    let (job, partition) = unsafe { slot.get() }.unwrap();
                    job.run(&JobLock::default(), partition.range(id));
                });
            }
        });

        unsafe { slot.clear() };
        assert_eq!(counter.load(Ordering::Relaxed), 6);
    }
}
