// src/layer/line_buffer.rs
//! Bounded ring buffer holding the last few rows of a streamed 2-D map
//!
//! A k x k window over an n-wide row-major stream spans (k-1)*n + k
//! consecutive samples, so that is all the buffer ever retains.

use crate::fixed::Sample;

#[derive(Clone, Debug)]
pub struct LineBuffer {
    slots: Vec<Sample>,
    /// Next slot to be written
    head: usize,
    /// Samples written since the last clear, saturating at capacity
    filled: usize,
}

impl LineBuffer {
    /// Buffer able to rebuild a `window` x `window` neighborhood of a `row_len`-wide map
    pub fn for_window(row_len: usize, window: usize) -> Self {
        Self::new((window - 1) * row_len + window)
    }

    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![0; capacity.max(1)],
            head: 0,
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Shift in a new sample, evicting the oldest once full
    pub fn push(&mut self, sample: Sample) {
        self.slots[self.head] = sample;
        self.head = (self.head + 1) % self.slots.len();
        self.filled = (self.filled + 1).min(self.slots.len());
    }

    /// Sample pushed `age` pushes ago (0 = newest)
    pub fn at_age(&self, age: usize) -> Sample {
        debug_assert!(age < self.filled, "age {} beyond {} buffered samples", age, self.filled);
        let cap = self.slots.len();
        self.slots[(self.head + cap - 1 - age % cap) % cap]
    }

    /// Row-major `side` x `side` window whose bottom-right corner is the newest sample
    pub fn window_into(&self, side: usize, row_len: usize, out: &mut Vec<Sample>) {
        out.clear();
        for i in 0..side {
            for j in 0..side {
                out.push(self.at_age((side - 1 - i) * row_len + (side - 1 - j)));
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = 0);
        self.head = 0;
        self.filled = 0;
    }
}
