// Copyright 2025 The Paraspin Authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: thread pool, generation clock and synchronization primitives.

mod clock;
mod global;
mod job;
mod partition;
mod sync;
mod thread_pool;

pub use clock::WaitMode;
pub use job::JobLock;
pub use partition::Partition;
pub use thread_pool::{CpuPinningPolicy, ThreadCount, ThreadPool, ThreadPoolBuilder};
