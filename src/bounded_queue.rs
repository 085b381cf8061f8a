//! A fixed-capacity queue with silent-drop backpressure.

use std::collections::VecDeque;

/// This queue maintains an ordered list of elements and a count of dropped
/// elements. Unlike an evicting queue, a push past capacity drops the *new*
/// element: producers on hot paths must never stall, and retained history
/// is worth more than the newest arrival.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct BoundedQueue<T> {
    queue: VecDeque<T>,
    capacity: usize,
    dropped_count: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a new `BoundedQueue` with a given capacity.
    pub(crate) fn new(capacity: usize) -> Self {
        BoundedQueue {
            queue: VecDeque::with_capacity(capacity.min(16)),
            capacity,
            dropped_count: 0,
        }
    }

    /// Push a new element to the back of the queue. Returns `false` and
    /// records a drop if the queue is at capacity.
    pub(crate) fn push_back(&mut self, value: T) -> bool {
        if self.queue.len() >= self.capacity {
            self.dropped_count += 1;
            return false;
        }
        self.queue.push_back(value);
        true
    }

    /// Removes and returns every element, front to back.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.queue.drain(..)
    }

    /// Returns `true` if the queue is empty.
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns the number of queued elements.
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns how many pushes have been rejected at capacity.
    pub(crate) fn dropped_count(&self) -> usize {
        self.dropped_count
    }
}
