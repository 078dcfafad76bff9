//! FIFO queue for submissions that could not obtain resources.
//!
//! Exhaustion of any pool (shadow slot, grant token, owned frame) parks the
//! submission here instead of failing it; the completion reaper replays the
//! head whenever resources free up. While the queue is non-empty the engine's
//! admission gate routes fresh submissions through the queue too, so retried
//! and fresh requests cannot interleave.
//!
//! Only the head is retried per drain attempt: if the head still cannot be
//! admitted the pools are still tight, and trying the rest would just thrash
//! (and break FIFO fairness).

use std::collections::VecDeque;

use crate::transfer::{CompletionSink, TransferRequest};

/// One deferred submission, complete enough to replay later.
#[derive(Debug)]
pub struct PendingSubmission {
    pub seq: u64,
    pub request: TransferRequest,
    pub sink: CompletionSink,
}

#[derive(Default)]
pub struct BackpressureQueue {
    queue: VecDeque<PendingSubmission>,
}

impl BackpressureQueue {
    pub fn new() -> Self {
        BackpressureQueue { queue: VecDeque::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn enqueue(&mut self, pending: PendingSubmission) {
        self.queue.push_back(pending);
    }

    /// Takes the head for an admission attempt; a failed attempt must give
    /// it back via [`BackpressureQueue::put_back`].
    pub fn take_head(&mut self) -> Option<PendingSubmission> {
        self.queue.pop_front()
    }

    /// Returns an unadmittable head to its place.
    pub fn put_back(&mut self, pending: PendingSubmission) {
        self.queue.push_front(pending);
    }

    /// Removes a queued submission by its logical id (cancellation before
    /// the request ever reached the ring).
    pub fn remove_by_seq(&mut self, seq: u64) -> Option<PendingSubmission> {
        let pos = self.queue.iter().position(|p| p.seq == seq)?;
        self.queue.remove(pos)
    }

    /// Empties the queue (device-gone sweep).
    pub fn drain_all(&mut self) -> Vec<PendingSubmission> {
        self.queue.drain(..).collect()
    }
}
