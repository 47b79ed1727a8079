// Copyright 2025 The Paraspin Authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Uniform splitting of a range of work units among the participants of a
//! dispatch.

use std::ops::Range;

/// A uniform split of `0..total` into consecutive chunks, one per participant
/// of a dispatch.
///
/// A dispatch on a pool of `N` worker threads has `N + 1` participants: the
/// dispatching thread (participant `0`) and the workers (participants `1` to
/// `N`). Each participant owns at most `chunk = ceil(total / (N + 1))` units.
///
/// ```
/// # use paraspin::Partition;
/// # use std::num::NonZeroUsize;
/// let partition = Partition::new(10, NonZeroUsize::try_from(4).unwrap());
/// assert_eq!(partition.chunk(), 2);
/// assert_eq!(partition.range(0), 0..2);
/// assert_eq!(partition.range(4), 8..10);
///
/// // Trailing participants may be left without work.
/// let partition = Partition::new(3, NonZeroUsize::try_from(4).unwrap());
/// assert_eq!(partition.range(2), 2..3);
/// assert_eq!(partition.range(3), 3..3);
/// assert_eq!(partition.range(4), 3..3);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    /// Total number of units to process.
    total: usize,
    /// Maximal number of units per participant.
    chunk: usize,
}

impl Partition {
    /// Splits `0..total` among `num_workers` workers plus the dispatching
    /// thread.
    pub fn new(total: usize, num_workers: std::num::NonZeroUsize) -> Self {
        let num_participants = num_workers.get().saturating_add(1);
        Self {
            total,
            chunk: total.div_ceil(num_participants),
        }
    }

    /// Total number of units.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of units owned by each participant (the last non-empty range
    /// may be shorter).
    pub fn chunk(&self) -> usize {
        self.chunk
    }

    /// Returns the half-open range owned by the given participant, where `0` is
    /// the dispatching thread and `1..=N` are the worker threads.
    ///
    /// Participants past the end of the input get the empty range
    /// `total..total`.
    pub fn range(&self, participant: usize) -> Range<usize> {
        match participant.checked_mul(self.chunk) {
            Some(start) if start < self.total => {
                let end = start + self.chunk.min(self.total - start);
                start..end
            }
            _ => self.total..self.total,
        }
    }
}
