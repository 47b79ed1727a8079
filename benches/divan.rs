// Copyright 2025 The Paraspin Authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

fn main() {
    divan::main();
}

const NUM_THREADS: &[usize] = &[1, 2, 4, 8];
const LENGTHS: &[usize] = &[10_000, 100_000, 1_000_000];

/// Baseline benchmarks using serial iterators (without any multi-threading
/// involved).
mod serial {
    use super::LENGTHS;
    use divan::counter::BytesCount;
    use divan::{black_box, Bencher};

    #[divan::bench(args = LENGTHS)]
    fn sum(bencher: Bencher, len: usize) {
        let input = (0..len as u64).collect::<Vec<u64>>();
        let input_slice = input.as_slice();
        bencher
            .counter(BytesCount::of_many::<u64>(len))
            .bench_local(|| black_box(input_slice).iter().sum::<u64>())
    }

    #[divan::bench(args = LENGTHS)]
    fn dot(bencher: Bencher, len: usize) {
        let left = (0..len as u64).collect::<Vec<u64>>();
        let right = (0..len as u64).collect::<Vec<u64>>();
        let left_slice = left.as_slice();
        let right_slice = right.as_slice();
        bencher
            .counter(BytesCount::of_many::<u64>(len * 2))
            .bench_local(|| {
                black_box(left_slice)
                    .iter()
                    .zip(black_box(right_slice))
                    .map(|(&a, &b)| a.wrapping_mul(b))
                    .fold(0u64, u64::wrapping_add)
            })
    }
}

/// Benchmarks using Rayon.
mod rayon {
    use super::{LENGTHS, NUM_THREADS};
    use divan::counter::BytesCount;
    use divan::{black_box, Bencher};
    use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator};

    #[divan::bench(consts = NUM_THREADS, args = LENGTHS)]
    fn sum_rayon<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        let input = (0..len as u64).collect::<Vec<u64>>();
        let input_slice = input.as_slice();
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(NUM_THREADS)
            .build()
            .unwrap();
        // Ideally we'd prefer to run bench_local() inside the Rayon thread pool, but
        // that doesn't work because divan::Bencher isn't Send (and bench_local()
        // consumes it).
        bencher
            .counter(BytesCount::of_many::<u64>(len))
            .bench_local(|| thread_pool.install(|| black_box(input_slice).par_iter().sum::<u64>()));
    }

    #[divan::bench(consts = NUM_THREADS, args = LENGTHS)]
    fn dot_rayon<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        let left = (0..len as u64).collect::<Vec<u64>>();
        let right = (0..len as u64).collect::<Vec<u64>>();
        let left_slice = left.as_slice();
        let right_slice = right.as_slice();
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(NUM_THREADS)
            .build()
            .unwrap();
        bencher
            .counter(BytesCount::of_many::<u64>(len * 2))
            .bench_local(|| {
                thread_pool.install(|| {
                    black_box(left_slice)
                        .par_iter()
                        .zip(black_box(right_slice))
                        .map(|(&a, &b)| a.wrapping_mul(b))
                        .reduce(|| 0, u64::wrapping_add)
                })
            });
    }
}

/// Benchmarks using Paraspin.
mod paraspin {
    use super::{LENGTHS, NUM_THREADS};
    use divan::counter::BytesCount;
    use divan::{black_box, Bencher};
    use paraspin::{CpuPinningPolicy, ThreadCount, ThreadPool, ThreadPoolBuilder, WaitMode};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn build(num_threads: usize, wait_mode: WaitMode) -> ThreadPool {
        ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            wait_mode,
            cpu_pinning: CpuPinningPolicy::IfSupported,
        }
        .build()
    }

    #[divan::bench(consts = NUM_THREADS, args = LENGTHS)]
    fn sum_spin<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        sum_impl::<NUM_THREADS>(bencher, len, WaitMode::Spin)
    }

    #[divan::bench(consts = NUM_THREADS, args = LENGTHS)]
    fn sum_block<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        sum_impl::<NUM_THREADS>(bencher, len, WaitMode::Block)
    }

    fn sum_impl<const NUM_THREADS: usize>(bencher: Bencher, len: usize, wait_mode: WaitMode) {
        let input = (0..len as u64).collect::<Vec<u64>>();
        let input_slice = input.as_slice();
        let mut thread_pool = build(NUM_THREADS, wait_mode);

        bencher
            .counter(BytesCount::of_many::<u64>(len))
            .bench_local(|| {
                let sum = AtomicU64::new(0);
                let input = black_box(input_slice);
                thread_pool.dispatch_range(
                    input.len(),
                    |_, range| {
                        sum.fetch_add(input[range].iter().sum::<u64>(), Ordering::Relaxed);
                    },
                    wait_mode,
                );
                sum.into_inner()
            });
    }

    #[divan::bench(consts = NUM_THREADS, args = LENGTHS)]
    fn dot_spin<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        dot_impl::<NUM_THREADS>(bencher, len, WaitMode::Spin)
    }

    #[divan::bench(consts = NUM_THREADS, args = LENGTHS)]
    fn dot_block<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        dot_impl::<NUM_THREADS>(bencher, len, WaitMode::Block)
    }

    fn dot_impl<const NUM_THREADS: usize>(bencher: Bencher, len: usize, wait_mode: WaitMode) {
        let left = (0..len as u64).collect::<Vec<u64>>();
        let right = (0..len as u64).collect::<Vec<u64>>();
        let left_slice = left.as_slice();
        let right_slice = right.as_slice();
        let mut thread_pool = build(NUM_THREADS, wait_mode);

        bencher
            .counter(BytesCount::of_many::<u64>(len * 2))
            .bench_local(|| {
                let dot = AtomicU64::new(0);
                let left = black_box(left_slice);
                let right = black_box(right_slice);
                thread_pool.dispatch_range(
                    len,
                    |_, range| {
                        let local = left[range.clone()]
                            .iter()
                            .zip(&right[range])
                            .map(|(&a, &b)| a.wrapping_mul(b))
                            .fold(0u64, u64::wrapping_add);
                        dot.fetch_add(local, Ordering::Relaxed);
                    },
                    wait_mode,
                );
                dot.into_inner()
            });
    }

    /// Round trip of an empty job, i.e. the cost of waking up the workers and
    /// waiting for them.
    #[divan::bench(consts = NUM_THREADS, args = [WaitMode::Spin, WaitMode::Block])]
    fn empty_dispatch<const NUM_THREADS: usize>(bencher: Bencher, wait_mode: WaitMode) {
        let mut thread_pool = build(NUM_THREADS, wait_mode);
        bencher.bench_local(|| thread_pool.dispatch_indexed(black_box(0), |_, _| (), wait_mode));
    }
}
