//! Priority queue of pending transfer jobs
//!
//! Strict priority order, FIFO among equals. A monotonic sequence number
//! keyed at enqueue time makes the tie-break deterministic; cancelled jobs
//! are dropped lazily at dequeue.

use crate::job::{TransferError, TransferHandle, TransferState};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

struct QueuedJob {
    priority: u8,
    seq: u64,
    handle: Arc<TransferHandle>,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Default queue capacity (jobs).
pub const DEFAULT_CAPACITY: usize = 64;

/// Bounded priority queue; owns jobs until they are dequeued.
pub struct TransferQueue {
    heap: Mutex<BinaryHeap<QueuedJob>>,
    capacity: usize,
    next_seq: AtomicU64,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            capacity,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Enqueue a newly created job. Fails with
    /// [`TransferError::QueueFull`] at capacity, or
    /// [`TransferError::IllegalState`] when the job was already enqueued,
    /// started, or finished.
    pub fn enqueue(&self, handle: Arc<TransferHandle>) -> Result<(), TransferError> {
        let mut heap = self.heap.lock();
        if heap.len() >= self.capacity {
            return Err(TransferError::QueueFull);
        }
        handle.try_enqueue()?;
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        heap.push(QueuedJob {
            priority: handle.priority(),
            seq,
            handle,
        });
        Ok(())
    }

    /// Dequeue up to `max` ready jobs in priority order, silently dropping
    /// entries cancelled while queued.
    pub fn pop_ready(&self, max: usize) -> Vec<Arc<TransferHandle>> {
        let mut heap = self.heap.lock();
        let mut ready = Vec::new();
        while ready.len() < max {
            match heap.pop() {
                Some(job) if job.handle.state() == TransferState::Queued => {
                    ready.push(job.handle);
                }
                Some(_) => continue, // cancelled while queued
                None => break,
            }
        }
        ready
    }

    /// Entries still in the heap, including lazily dropped cancellations.
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{StorageObject, TransferDirection};

    fn job(name: &str, priority: u8) -> Arc<TransferHandle> {
        TransferHandle::new(
            StorageObject::new(format!("storage://bucket/{name}"), name),
            TransferDirection::Upload,
            priority,
        )
    }

    #[test]
    fn priority_desc_fifo_within_tie() {
        let queue = TransferQueue::new();
        let job1 = job("one.bin", 1);
        let job2 = job("two.bin", 5);
        let job3 = job("three.bin", 1);

        queue.enqueue(job1.clone()).unwrap();
        queue.enqueue(job2.clone()).unwrap();
        queue.enqueue(job3.clone()).unwrap();

        let ready = queue.pop_ready(10);
        let names: Vec<&str> = ready.iter().map(|h| h.object().name.as_str()).collect();
        assert_eq!(names, vec!["two.bin", "one.bin", "three.bin"]);
    }

    #[test]
    fn pop_respects_batch_limit() {
        let queue = TransferQueue::new();
        for i in 0..5 {
            queue.enqueue(job(&format!("{i}.bin"), 1)).unwrap();
        }

        assert_eq!(queue.pop_ready(2).len(), 2);
        assert_eq!(queue.pop_ready(10).len(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn cancelled_jobs_are_skipped() {
        let queue = TransferQueue::new();
        let keep = job("keep.bin", 1);
        let drop_me = job("drop.bin", 9);

        queue.enqueue(keep.clone()).unwrap();
        queue.enqueue(drop_me.clone()).unwrap();
        drop_me.cancel_if_queued();

        let ready = queue.pop_ready(10);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].object().name, "keep.bin");
    }

    #[test]
    fn capacity_bound_rejects_overflow() {
        let queue = TransferQueue::with_capacity(2);
        queue.enqueue(job("a.bin", 1)).unwrap();
        queue.enqueue(job("b.bin", 1)).unwrap();

        let overflow = job("c.bin", 1);
        assert!(matches!(
            queue.enqueue(overflow.clone()),
            Err(TransferError::QueueFull)
        ));
        // The rejected job was never claimed and can be enqueued later.
        assert_eq!(overflow.state(), TransferState::Queued);
        queue.pop_ready(1);
        assert!(queue.enqueue(overflow).is_ok());
    }

    #[test]
    fn double_enqueue_rejected() {
        let queue = TransferQueue::new();
        let once = job("once.bin", 1);
        queue.enqueue(once.clone()).unwrap();
        assert!(matches!(
            queue.enqueue(once),
            Err(TransferError::IllegalState)
        ));
        assert_eq!(queue.len(), 1);
    }
}
