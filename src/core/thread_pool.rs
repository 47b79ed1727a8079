// Copyright 2025 The Paraspin Authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A thread pool of persistent workers, to which the main thread dispatches
//! one job at a time.

use super::clock::{GenerationClock, WaitMode};
use super::job::{Job, JobLock, JobSlot};
use super::partition::Partition;
use super::sync::CompletionBarrier;
#[cfg(feature = "log_parallelism")]
use crate::macros::{log_info, log_trace};
use crate::macros::{log_debug, log_error, log_warn};
use crossbeam_utils::CachePadded;
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    errno::Errno,
    sched::{sched_getaffinity, sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::num::NonZeroUsize;
use std::ops::Range;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Number of worker threads to spawn in a thread pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn one thread less than returned by
    /// [`std::thread::available_parallelism()`] (but at least one), so that
    /// the workers and the dispatching thread together occupy all the
    /// available CPUs.
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the number of worker threads to spawn.
    pub fn count(self) -> NonZeroUsize {
        match self {
            ThreadCount::AvailableParallelism => match std::thread::available_parallelism() {
                Ok(available) => {
                    NonZeroUsize::new(available.get() - 1).unwrap_or(NonZeroUsize::MIN)
                }
                Err(_e) => {
                    log_warn!("Getting the available parallelism failed, spawning 1 thread: {_e}");
                    NonZeroUsize::MIN
                }
            },
            ThreadCount::Count(count) => count,
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a thread pool will panic.
    Always,
}

/// A builder for [`ThreadPool`].
#[derive(Clone, Copy, Debug)]
pub struct ThreadPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// How the worker threads wait for the first dispatch.
    pub wait_mode: WaitMode,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl ThreadPoolBuilder {
    /// Spawns a thread pool. This blocks until all the worker threads are
    /// ready to receive work.
    ///
    /// ```
    /// # use paraspin::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder, WaitMode};
    /// # use std::sync::atomic::{AtomicU64, Ordering};
    /// let mut thread_pool = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::AvailableParallelism,
    ///     wait_mode: WaitMode::Block,
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build();
    ///
    /// let input: [u64; 10] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
    /// let sum = AtomicU64::new(0);
    /// thread_pool.dispatch_range(
    ///     input.len(),
    ///     |_lock, range| {
    ///         sum.fetch_add(input[range].iter().sum::<u64>(), Ordering::Relaxed);
    ///     },
    ///     WaitMode::Block,
    /// );
    /// assert_eq!(sum.into_inner(), 5 * 11);
    /// ```
    pub fn build(&self) -> ThreadPool {
        ThreadPool::new(self)
    }
}

/// A pool of worker threads that execute parallel jobs dispatched by the
/// thread owning the pool.
///
/// Each dispatch splits `0..total` into `N + 1` uniform chunks (see
/// [`Partition`]): the dispatching thread processes the first chunk itself,
/// while the `N` workers process the others. A dispatch returns once all the
/// chunks have been processed.
///
/// Between two dispatches, idle workers either spin or block, as selected by
/// the [`WaitMode`] passed to each dispatch. Spinning workers pick up the next
/// job with minimal latency, at the cost of keeping their CPUs busy.
///
/// Dispatching requires a mutable reference to the pool, so a pool can't be
/// used from several threads at the same time, nor from within one of its own
/// jobs. Dropping the pool terminates and joins all the workers.
pub struct ThreadPool {
    /// Handles to all the worker threads in the pool.
    threads: Vec<WorkerThreadHandle>,
    /// Number of worker threads in the pool.
    num_workers: NonZeroUsize,
    /// State shared with the worker threads.
    shared: Arc<SharedContext>,
    /// Counters about past dispatches.
    #[cfg(feature = "log_parallelism")]
    statistics: DispatchStatistics,
}

/// Handle to a worker thread in a thread pool.
struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

/// Context shared between the main thread and the worker threads.
struct SharedContext {
    /// Generation of the current job, and wake-up mechanism for blocked
    /// workers.
    clock: GenerationClock,
    /// Barrier on which the main thread waits for the workers.
    barrier: CompletionBarrier,
    /// Job of the current generation.
    job: JobSlot,
    /// Last generation processed by each worker (worker `id` uses slot
    /// `id - 1`).
    last_seen: Box<[CachePadded<AtomicU64>]>,
    /// Set when the pool is being dropped.
    terminating: AtomicBool,
    /// Number of workers that failed to pin themselves to a CPU with
    /// [`CpuPinningPolicy::Always`].
    num_pinning_failures: AtomicUsize,
    /// Lock lent to every job invocation.
    lock: JobLock,
}

impl ThreadPool {
    /// Creates a new thread pool using the given parameters.
    fn new(builder: &ThreadPoolBuilder) -> Self {
        let num_workers = builder.num_threads.count();
        let cpu_pinning = builder.cpu_pinning;

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        let shared = Arc::new(SharedContext {
            clock: GenerationClock::new(builder.wait_mode),
            barrier: CompletionBarrier::new(num_workers.get()),
            job: JobSlot::empty(),
            last_seen: (0..num_workers.get())
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            terminating: AtomicBool::new(false),
            num_pinning_failures: AtomicUsize::new(0),
            lock: JobLock::default(),
        });

        let threads = (1..=num_workers.get())
            .map(|id| {
                let mut context = WorkerContext {
                    id,
                    last_seen: 0,
                    shared: shared.clone(),
                };
                let handle = std::thread::Builder::new()
                    .name(format!("paraspin-worker-{id}"))
                    .spawn(move || context.run(cpu_pinning))
                    .unwrap_or_else(|e| panic!("Failed to spawn worker thread #{id}: {e}"));
                WorkerThreadHandle { handle }
            })
            .collect();
        log_debug!("[main thread] Spawned {num_workers} threads");

        let thread_pool = Self {
            threads,
            num_workers,
            shared,
            #[cfg(feature = "log_parallelism")]
            statistics: DispatchStatistics::default(),
        };

        thread_pool.shared.barrier.wait();
        log_debug!("[main thread] All threads are ready");

        // Dropping the pool upon panic joins the threads that did start.
        let num_pinning_failures = thread_pool
            .shared
            .num_pinning_failures
            .load(Ordering::Relaxed);
        if num_pinning_failures != 0 {
            panic!("Failed to pin {num_pinning_failures} worker thread(s) to CPUs");
        }

        thread_pool
    }

    /// Returns the number of worker threads that have been spawned in this
    /// thread pool. A dispatch has one more participant: the dispatching
    /// thread.
    pub fn num_threads(&self) -> NonZeroUsize {
        self.num_workers
    }

    /// Returns the number of jobs dispatched so far.
    pub fn generation(&self) -> u64 {
        self.shared.clock.current()
    }

    /// Returns how the worker threads are currently waiting for the next
    /// dispatch.
    pub fn wait_mode(&self) -> WaitMode {
        self.shared.clock.wait_mode()
    }

    /// Runs `job` over `0..total` in parallel, and waits for it to complete.
    ///
    /// The job is called at most once per participant, with the participant's
    /// non-empty range. Each index of `0..total` belongs to exactly one range.
    /// Once this returns, the workers wait for the next dispatch according to
    /// `next_wait_mode`.
    ///
    /// All the calls receive the same [`JobLock`], which the job may use to
    /// synchronize accesses to shared state.
    ///
    /// # Panics
    ///
    /// If the job panics on any thread, this panics once all the threads are
    /// done with the job. The thread pool remains usable afterwards.
    ///
    /// ```
    /// # use paraspin::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder, WaitMode};
    /// # let mut thread_pool = ThreadPoolBuilder {
    /// #     num_threads: ThreadCount::try_from(3).unwrap(),
    /// #     wait_mode: WaitMode::Block,
    /// #     cpu_pinning: CpuPinningPolicy::No,
    /// # }
    /// # .build();
    /// # use std::sync::atomic::{AtomicU64, Ordering};
    /// let input = (0..1000).collect::<Vec<u64>>();
    /// let max = AtomicU64::new(0);
    /// thread_pool.dispatch_range(
    ///     input.len(),
    ///     |_lock, range| {
    ///         // Ranges passed to the job are never empty.
    ///         let local_max = *input[range].iter().max().unwrap();
    ///         max.fetch_max(local_max, Ordering::Relaxed);
    ///     },
    ///     WaitMode::Spin,
    /// );
    /// assert_eq!(max.into_inner(), 999);
    /// ```
    pub fn dispatch_range<F>(&mut self, total: usize, job: F, next_wait_mode: WaitMode)
    where
        F: Fn(&JobLock, Range<usize>) + Sync,
    {
        self.dispatch(total, Job::Range(&job), next_wait_mode)
    }

    /// Runs `job` over `0..total` in parallel like
    /// [`dispatch_range()`](Self::dispatch_range), additionally passing the
    /// given context to every call.
    ///
    /// ```
    /// # use paraspin::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder, WaitMode};
    /// # use std::sync::Mutex;
    /// # let mut thread_pool = ThreadPoolBuilder {
    /// #     num_threads: ThreadCount::try_from(3).unwrap(),
    /// #     wait_mode: WaitMode::Block,
    /// #     cpu_pinning: CpuPinningPolicy::No,
    /// # }
    /// # .build();
    /// struct Histogram {
    ///     input: Vec<u8>,
    ///     buckets: Mutex<[usize; 4]>,
    /// }
    ///
    /// let histogram = Histogram {
    ///     input: (0..=255).collect(),
    ///     buckets: Mutex::new([0; 4]),
    /// };
    /// thread_pool.dispatch_range_with(
    ///     histogram.input.len(),
    ///     &histogram,
    ///     |_lock, range, histogram| {
    ///         let mut local = [0; 4];
    ///         for &x in &histogram.input[range] {
    ///             local[x as usize / 64] += 1;
    ///         }
    ///         let mut buckets = histogram.buckets.lock().unwrap();
    ///         for (bucket, count) in buckets.iter_mut().zip(local) {
    ///             *bucket += count;
    ///         }
    ///     },
    ///     WaitMode::Block,
    /// );
    /// assert_eq!(histogram.buckets.into_inner().unwrap(), [64; 4]);
    /// ```
    pub fn dispatch_range_with<C, F>(
        &mut self,
        total: usize,
        context: &C,
        job: F,
        next_wait_mode: WaitMode,
    ) where
        C: Sync + ?Sized,
        F: Fn(&JobLock, Range<usize>, &C) + Sync,
    {
        self.dispatch_range(total, |lock, range| job(lock, range, context), next_wait_mode)
    }

    /// Runs `job` once for each index in `0..total` in parallel, and waits for
    /// all the calls to complete.
    ///
    /// Indices are split among participants in the same way as
    /// [`dispatch_range()`](Self::dispatch_range); each participant calls the
    /// job on its indices in increasing order.
    ///
    /// ```
    /// # use paraspin::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder, WaitMode};
    /// # let mut thread_pool = ThreadPoolBuilder {
    /// #     num_threads: ThreadCount::try_from(3).unwrap(),
    /// #     wait_mode: WaitMode::Block,
    /// #     cpu_pinning: CpuPinningPolicy::No,
    /// # }
    /// # .build();
    /// let squares = std::sync::Mutex::new(vec![0; 10]);
    /// thread_pool.dispatch_indexed(
    ///     10,
    ///     |_lock, i| squares.lock().unwrap()[i] = i * i,
    ///     WaitMode::Block,
    /// );
    /// assert_eq!(
    ///     squares.into_inner().unwrap(),
    ///     [0, 1, 4, 9, 16, 25, 36, 49, 64, 81]
    /// );
    /// ```
    pub fn dispatch_indexed<F>(&mut self, total: usize, job: F, next_wait_mode: WaitMode)
    where
        F: Fn(&JobLock, usize) + Sync,
    {
        self.dispatch(total, Job::Indexed(&job), next_wait_mode)
    }

    /// Publishes the job to the workers, runs the first chunk on this thread
    /// and waits for the workers to complete theirs.
    fn dispatch(&mut self, total: usize, job: Job<'_>, next_wait_mode: WaitMode) {
        let shared = &*self.shared;
        let partition = Partition::new(total, self.num_workers);

        // SAFETY:
        // - The workers don't access the slot: they are all idle, as the barrier was
        //   reached at the end of the previous dispatch (or in `new()`).
        // - The job outlives its uses by the workers, as the slot is cleared below
        //   once all the workers have arrived at the barrier, before the job is
        //   dropped. This also holds if the job panics on this thread, as the panic
        //   is only resumed after the barrier.
        unsafe { shared.job.publish(&job, partition) };
        shared.barrier.reset();
        let idle_mode = shared.clock.set_wait_mode(next_wait_mode);
        let generation = shared.clock.advance(idle_mode);
        log_debug!(
            "[main thread, generation {generation}] Dispatched {total} items in chunks of {}, waking up {idle_mode:?} workers",
            partition.chunk()
        );

        #[cfg(feature = "log_parallelism")]
        self.statistics
            .record(&job, &partition, next_wait_mode, self.num_workers);

        let result = catch_unwind(AssertUnwindSafe(|| {
            job.run(&shared.lock, partition.range(0))
        }));

        log_debug!("[main thread, generation {generation}] Waiting for all threads to finish.");
        shared.barrier.wait();
        // SAFETY: All the workers have arrived at the barrier, so none of them
        // accesses the slot anymore.
        unsafe { shared.job.clear() };

        debug_assert!(
            shared
                .last_seen
                .iter()
                .all(|last_seen| last_seen.load(Ordering::Relaxed) == generation),
            "All the workers must have processed generation {generation}"
        );

        let num_panicking = shared.barrier.num_panicking();
        if result.is_err() || num_panicking != 0 {
            shared.lock.clear_poison();
        }
        if let Err(payload) = result {
            log_error!("[main thread, generation {generation}] The job panicked on the main thread!");
            resume_unwind(payload);
        }
        if num_panicking != 0 {
            log_error!(
                "[main thread, generation {generation}] {num_panicking} worker thread(s) panicked!"
            );
            panic!("{num_panicking} worker thread(s) panicked!");
        }
        log_debug!("[main thread, generation {generation}] All threads have finished.");
    }
}

impl Drop for ThreadPool {
    /// Terminates and joins all the threads in the pool.
    #[allow(clippy::single_match, clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        log_debug!("[main thread] Notifying threads to terminate...");
        self.shared.terminating.store(true, Ordering::Release);
        self.shared.clock.advance_and_wake_all();

        log_debug!("[main thread] Joining threads in the pool...");
        for (_i, t) in self.threads.drain(..).enumerate() {
            let result = t.handle.join();
            match result {
                Ok(_) => log_debug!("[main thread] Thread {} joined with result: {result:?}", _i + 1),
                Err(_) => log_error!("[main thread] Thread {} joined with result: {result:?}", _i + 1),
            }
        }
        log_debug!("[main thread] Joined threads.");

        #[cfg(feature = "log_parallelism")]
        self.statistics.print();
    }
}

/// Context object owned by a worker thread.
struct WorkerContext {
    /// Thread index, in `1..=num_workers`.
    id: usize,
    /// Last generation processed by this thread.
    last_seen: u64,
    /// State shared with the main thread.
    shared: Arc<SharedContext>,
}

impl WorkerContext {
    /// Main function run by this thread.
    fn run(&mut self, cpu_pinning: CpuPinningPolicy) {
        if !self.pin_to_cpu(cpu_pinning) {
            self.shared
                .num_pinning_failures
                .fetch_add(1, Ordering::Relaxed);
            self.shared.barrier.arrive();
            return;
        }

        let mut wait_mode = self.shared.clock.wait_mode();
        self.shared.barrier.arrive();

        loop {
            log_debug!(
                "[thread {}] Waiting for generation {} ({wait_mode:?})",
                self.id,
                self.last_seen + 1
            );
            let generation = self.shared.clock.wait_for_advance(self.last_seen, wait_mode);
            if self.shared.terminating.load(Ordering::Acquire) {
                log_debug!("[thread {}] Received termination signal", self.id);
                break;
            }
            debug_assert_eq!(
                generation,
                self.last_seen + 1,
                "Worker thread {} skipped a generation",
                self.id
            );

            self.process(generation);

            // The main thread publishes the next wait mode before advancing the
            // generation, and doesn't change it until this thread arrives.
            wait_mode = self.shared.clock.wait_mode();
            self.last_seen = generation;
            self.shared.last_seen[self.id - 1].store(generation, Ordering::Relaxed);
            self.shared.barrier.arrive();
        }
    }

    /// Runs this thread's share of the job of the given generation.
    fn process(&self, _generation: u64) {
        // SAFETY:
        // - The main thread published the job before advancing to the generation that
        //   this thread observed (with acquire ordering), and doesn't write to the
        //   slot again until this thread arrives at the barrier.
        // - The job outlives this function, as the main thread keeps it alive until
        //   all the workers arrive at the barrier.
        let Some((job, partition)) = (unsafe { self.shared.job.get() }) else {
            log_error!(
                "[thread {}, generation {_generation}] No job was published",
                self.id
            );
            return;
        };

        let range = partition.range(self.id);
        #[cfg(feature = "log_parallelism")]
        log_trace!(
            "[thread {}, generation {_generation}] Running {} job over {range:?}",
            self.id,
            job.kind()
        );

        let result = catch_unwind(AssertUnwindSafe(|| job.run(&self.shared.lock, range)));
        if result.is_err() {
            log_error!(
                "[thread {}, generation {_generation}] Detected panic in this thread, notifying the main thread",
                self.id
            );
            self.shared.barrier.record_panic();
        }
    }

    /// Pins this thread to a CPU according to the given policy. Returns false
    /// if pinning was mandatory but failed.
    fn pin_to_cpu(&self, cpu_pinning: CpuPinningPolicy) -> bool {
        #[cfg(all(
            not(miri),
            any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            )
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => match pin_current_thread(self.id) {
                Ok(_cpu) => log_debug!("Pinned thread #{} to CPU #{_cpu}", self.id),
                Err(_e) => log_warn!("Failed to set CPU affinity for thread #{}: {_e}", self.id),
            },
            CpuPinningPolicy::Always => match pin_current_thread(self.id) {
                Ok(_cpu) => log_debug!("Pinned thread #{} to CPU #{_cpu}", self.id),
                Err(_e) => {
                    log_error!("Failed to set CPU affinity for thread #{}: {_e}", self.id);
                    return false;
                }
            },
        }
        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        let _ = cpu_pinning;
        true
    }
}

/// Pins the current thread to the `index`-th CPU (modulo the number of CPUs)
/// among those that it is allowed to run on. Returns the CPU number.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_current_thread(index: usize) -> nix::Result<usize> {
    let allowed = sched_getaffinity(Pid::from_raw(0))?;
    let cpus = (0..CpuSet::count())
        .filter(|&cpu| allowed.is_set(cpu).unwrap_or(false))
        .collect::<Vec<_>>();
    if cpus.is_empty() {
        return Err(Errno::EINVAL);
    }
    let cpu = cpus[index % cpus.len()];

    let mut cpu_set = CpuSet::new();
    cpu_set.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &cpu_set)?;
    Ok(cpu)
}

/// Counters about the dispatches of a thread pool, printed when the pool is
/// dropped.
#[cfg(feature = "log_parallelism")]
#[derive(Default)]
struct DispatchStatistics {
    num_range_jobs: u64,
    num_indexed_jobs: u64,
    num_spin_waits: u64,
    num_block_waits: u64,
    num_items: u64,
    num_idle_workers: u64,
}

#[cfg(feature = "log_parallelism")]
impl DispatchStatistics {
    fn record(
        &mut self,
        job: &Job<'_>,
        partition: &Partition,
        next_wait_mode: WaitMode,
        num_workers: NonZeroUsize,
    ) {
        match job {
            Job::Range(_) => self.num_range_jobs += 1,
            Job::Indexed(_) => self.num_indexed_jobs += 1,
        }
        match next_wait_mode {
            WaitMode::Spin => self.num_spin_waits += 1,
            WaitMode::Block => self.num_block_waits += 1,
        }
        self.num_items += partition.total() as u64;
        self.num_idle_workers += (1..=num_workers.get())
            .filter(|&id| partition.range(id).is_empty())
            .count() as u64;
    }

    fn print(&self) {
        log_info!(
            "Dispatched {} range job(s) and {} indexed job(s) over {} items in total",
            self.num_range_jobs,
            self.num_indexed_jobs,
            self.num_items
        );
        log_info!(
            "Workers then waited {} time(s) by spinning and {} time(s) by blocking",
            self.num_spin_waits,
            self.num_block_waits
        );
        log_info!(
            "Workers got an empty range {} time(s)",
            self.num_idle_workers
        );
    }
}
