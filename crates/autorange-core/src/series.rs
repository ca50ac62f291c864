//! Fixed-capacity sliding window used for every tracked metric
//!
//! Appending past capacity drops the oldest value, so a series always holds
//! the most recent `capacity` samples in insertion order.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A FIFO window over the last `capacity` pushed values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundedSeries<T> {
    values: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedSeries<T> {
    /// Create an empty series holding at most `capacity` values
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a value, evicting the oldest one when full.
    ///
    /// A zero-capacity series never stores anything.
    pub fn push(&mut self, value: T) {
        if self.capacity == 0 {
            return;
        }
        while self.values.len() >= self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.capacity > 0 && self.values.len() >= self.capacity
    }

    /// Oldest-first iterator over the stored values
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.values.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.values.back()
    }
}

impl<T: Clone> BoundedSeries<T> {
    /// Copy the window out, oldest first
    pub fn to_vec(&self) -> Vec<T> {
        self.values.iter().cloned().collect()
    }
}
