//! Fixed-capacity sliding window used by threshold observers.

use std::collections::VecDeque;

/// Rolling buffer of the most recent `capacity` samples.
///
/// Pushing beyond capacity evicts the oldest sample, so memory stays bounded
/// no matter how long the observer runs.
#[derive(Debug, Clone)]
pub struct SlidingWindow<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T> SlidingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "window capacity must be positive");
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: T) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }

    /// Length of the trailing run for which `qualifies` holds on every
    /// sample, e.g. "how many of the most recent samples are over threshold".
    pub fn trailing_run(&self, qualifies: impl Fn(&T) -> bool) -> usize {
        self.samples.iter().rev().take_while(|s| qualifies(s)).count()
    }

    /// Length of the trailing run in which every sample relates to its
    /// predecessor via `holds` (e.g. strictly increasing). A run needs at
    /// least two samples; with fewer the run length equals the sample count.
    pub fn trailing_pairwise_run(&self, holds: impl Fn(&T, &T) -> bool) -> usize {
        if self.samples.len() < 2 {
            return self.samples.len();
        }

        let mut run = 1;
        for i in (1..self.samples.len()).rev() {
            if holds(&self.samples[i - 1], &self.samples[i]) {
                run += 1;
            } else {
                break;
            }
        }
        run
    }
}
