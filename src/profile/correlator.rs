//! Attribution of stack captures to key transactions.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use super::aggregator::StackCapture;
use crate::bounded_queue::BoundedQueue;

/// Captures a thread may accumulate before attribution resolves.
pub(crate) const DEFAULT_PENDING_QUEUE_CAPACITY: usize = 8;

/// Holds stack captures per thread until the transaction running on that
/// thread finishes, then releases the captures that fall inside the
/// transaction window and match the target key transaction.
///
/// Pending queues are bounded; a capture arriving at a full queue is
/// dropped silently, never an older one, so a stuck transaction cannot
/// grow memory without bound.
#[derive(Debug)]
pub struct ThreadTransactionCorrelator {
    target_key_transaction: String,
    capacity: usize,
    queues: Mutex<HashMap<u64, BoundedQueue<StackCapture>>>,
}

impl ThreadTransactionCorrelator {
    /// Creates a correlator releasing only captures attributed to the
    /// given key transaction.
    pub fn new(target_key_transaction: impl Into<String>) -> Self {
        Self::with_capacity(target_key_transaction, DEFAULT_PENDING_QUEUE_CAPACITY)
    }

    /// Creates a correlator with an explicit per-thread queue capacity.
    pub fn with_capacity(target_key_transaction: impl Into<String>, capacity: usize) -> Self {
        ThreadTransactionCorrelator {
            target_key_transaction: target_key_transaction.into(),
            capacity,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Parks a capture until its thread's transaction finishes. Full
    /// queues drop the new capture.
    pub fn offer(&self, capture: StackCapture) {
        let mut queues = match self.queues.lock() {
            Ok(queues) => queues,
            Err(poisoned) => poisoned.into_inner(),
        };
        let capacity = self.capacity;
        let queue = queues
            .entry(capture.thread_id)
            .or_insert_with(|| BoundedQueue::new(capacity));
        let thread_id = capture.thread_id;
        if !queue.push_back(capture) {
            apm_debug!(
                name: "ThreadTransactionCorrelator.CaptureDropped",
                thread_id = thread_id,
                dropped = queue.dropped_count() as u64
            );
        }
    }

    /// Resolves attribution for a finished transaction on `thread_id`.
    ///
    /// Captures inside the `[started_at, ended_at]` window belonged to the
    /// transaction: they are released if the transaction matches the
    /// target key transaction and discarded otherwise. Captures outside
    /// the window stay parked for the next transaction on the thread.
    pub fn transaction_finished(
        &self,
        thread_id: u64,
        transaction_name: &str,
        started_at: SystemTime,
        ended_at: SystemTime,
    ) -> Vec<StackCapture> {
        let mut queues = match self.queues.lock() {
            Ok(queues) => queues,
            Err(poisoned) => poisoned.into_inner(),
        };
        let queue = match queues.get_mut(&thread_id) {
            Some(queue) => queue,
            None => return Vec::new(),
        };
        let matches_target = transaction_name == self.target_key_transaction;
        let mut released = Vec::new();
        let mut parked = Vec::new();
        for capture in queue.drain() {
            let in_window = capture.captured_at >= started_at && capture.captured_at <= ended_at;
            if in_window {
                if matches_target {
                    released.push(capture);
                }
            } else {
                parked.push(capture);
            }
        }
        for capture in parked {
            queue.push_back(capture);
        }
        released
    }

    /// Drops the queues of threads no longer alive.
    pub fn evict_idle(&self, active_threads: &std::collections::HashSet<u64>) {
        if let Ok(mut queues) = self.queues.lock() {
            queues.retain(|thread_id, _| active_threads.contains(thread_id));
        }
    }

    /// Captures currently parked for a thread.
    pub fn pending_count(&self, thread_id: u64) -> usize {
        self.queues
            .lock()
            .map(|queues| queues.get(&thread_id).map_or(0, BoundedQueue::len))
            .unwrap_or(0)
    }
}
