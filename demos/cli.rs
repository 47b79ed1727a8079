// Copyright 2025 The Paraspin Authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run examples of parallel tasks.

use clap::{Parser, ValueEnum};
use paraspin::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder, WaitMode};
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut thread_pool = ThreadPoolBuilder {
        num_threads: match cli.num_threads {
            Some(num_threads) => ThreadCount::Count(num_threads),
            None => ThreadCount::AvailableParallelism,
        },
        wait_mode: cli.wait_mode.into(),
        cpu_pinning: match cli.cpu_pinning {
            CpuPinningCli::No => CpuPinningPolicy::No,
            CpuPinningCli::IfSupported => CpuPinningPolicy::IfSupported,
            CpuPinningCli::Always => CpuPinningPolicy::Always,
        },
    }
    .build();
    println!(
        "spawned {} worker thread(s) in {:?} mode",
        thread_pool.num_threads(),
        thread_pool.wait_mode()
    );

    let start = Instant::now();
    for step in 0..cli.steps {
        // Workers go to sleep after the last step.
        let next_wait_mode = if step + 1 == cli.steps {
            WaitMode::Block
        } else {
            cli.wait_mode.into()
        };

        match cli.scenario {
            Scenario::Sum => {
                let input = (0..cli.input_size).collect::<Vec<u64>>();
                let input = black_box(input.as_slice());
                let sum = AtomicU64::new(0);
                thread_pool.dispatch_range(
                    input.len(),
                    |_, range| {
                        sum.fetch_add(input[range].iter().sum::<u64>(), Ordering::Relaxed);
                    },
                    next_wait_mode,
                );
                println!("sum = {}", sum.into_inner());
            }
            Scenario::Dot => {
                let left = (0..cli.input_size).collect::<Vec<u64>>();
                let right = (0..cli.input_size).collect::<Vec<u64>>();
                let left = black_box(left.as_slice());
                let right = black_box(right.as_slice());
                let dot = AtomicU64::new(0);
                thread_pool.dispatch_range(
                    left.len(),
                    |_, range| {
                        let local = left[range.clone()]
                            .iter()
                            .zip(&right[range])
                            .map(|(&a, &b)| a.wrapping_mul(b))
                            .fold(0u64, u64::wrapping_add);
                        dot.fetch_add(local, Ordering::Relaxed);
                    },
                    next_wait_mode,
                );
                println!("dot = {}", dot.into_inner());
            }
            Scenario::CountNeedles => {
                let input = fill_needles(cli.input_size as usize, cli.density);
                let input = black_box(input.as_slice());
                let count = AtomicUsize::new(0);
                thread_pool.dispatch_indexed(
                    input.len(),
                    |_, i| {
                        if input[i] {
                            count.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    next_wait_mode,
                );
                println!("needles = {}", count.into_inner());
            }
            Scenario::FindNeedles => {
                let input = fill_needles(cli.input_size as usize, cli.density);
                let input = black_box(input.as_slice());
                let found = Mutex::new(Vec::new());
                thread_pool.dispatch_range(
                    input.len(),
                    |_, range| {
                        let start = range.start;
                        let local = input[range]
                            .iter()
                            .enumerate()
                            .filter(|&(_, &x)| x)
                            .map(|(i, _)| start + i);
                        found.lock().unwrap().extend(local);
                    },
                    next_wait_mode,
                );
                let mut found = found.into_inner().unwrap();
                found.sort_unstable();
                println!("found = {found:?}");
            }
        }
    }
    println!(
        "ran {} step(s) in {:?}, final generation = {}",
        cli.steps,
        start.elapsed(),
        thread_pool.generation()
    );
}

/// Creates a vector of `input_size` booleans, `density` of which are set to
/// [`true`] (the needles). The set of needles follows a uniform distribution,
/// but is fixed by a constant-time seed for reproducibility.
fn fill_needles(input_size: usize, density: usize) -> Vec<bool> {
    let mut input = vec![false; input_size];

    let mut rng = ChaCha12Rng::seed_from_u64(42);
    let needles = index::sample(&mut rng, input_size, density.min(input_size));
    for needle in needles {
        input[needle] = true;
    }

    input
}

/// CLI tool to run examples of parallel tasks.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Number of worker threads. Default to the available parallelism minus
    /// one.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// How idle worker threads wait between two steps.
    #[arg(long, value_enum, default_value_t = WaitModeCli::Spin)]
    wait_mode: WaitModeCli,

    /// Policy to pin worker threads to CPUs.
    #[arg(long, value_enum, default_value_t = CpuPinningCli::IfSupported)]
    cpu_pinning: CpuPinningCli,

    /// Scenario to run in parallel.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Number of items in the input.
    #[arg(long, default_value_t = 1_000_000)]
    input_size: u64,

    /// Number of times to run the scenario.
    #[arg(long, default_value_t = 1)]
    steps: usize,

    /// Number of needles in the input. Used only for the count-needles and
    /// find-needles scenarios.
    #[arg(long, default_value_t = 1)]
    density: usize,
}

/// How idle worker threads wait.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum WaitModeCli {
    /// Busy-poll for the next step.
    Spin,
    /// Sleep until the next step.
    Block,
}

impl From<WaitModeCli> for WaitMode {
    fn from(wait_mode: WaitModeCli) -> Self {
        match wait_mode {
            WaitModeCli::Spin => WaitMode::Spin,
            WaitModeCli::Block => WaitMode::Block,
        }
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum CpuPinningCli {
    /// Don't pin worker threads.
    No,
    /// Pin worker threads if the platform supports it.
    IfSupported,
    /// Pin worker threads, or fail.
    Always,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Sum a slice of numbers.
    Sum,
    /// Compute the dot product of two slices.
    Dot,
    /// Count the needles in a haystack, one index at a time.
    CountNeedles,
    /// Find the positions of the needles in a haystack.
    FindNeedles,
}
