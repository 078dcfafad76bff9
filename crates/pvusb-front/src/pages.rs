//! Bounded pool of frontend-owned page frames.
//!
//! Indirect pages, isochronous packet-descriptor pages, and scratch-probe
//! buffers need backing memory the transport allocates itself. The frame
//! pool is seeded once with the frames the frontend reserved for this and
//! recycles them; exhaustion is an ordinary backpressure signal.

pub struct FramePool {
    free: Vec<u64>,
    capacity: usize,
}

impl FramePool {
    pub fn new(frames: Vec<u64>) -> Self {
        let capacity = frames.len();
        FramePool { free: frames, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// `None` means exhausted; the caller rolls back and queues.
    pub fn alloc(&mut self) -> Option<u64> {
        self.free.pop()
    }

    pub fn free(&mut self, frame: u64) {
        debug_assert!(
            !self.free.contains(&frame),
            "frame {frame:#x} freed twice"
        );
        debug_assert!(self.free.len() < self.capacity);
        self.free.push(frame);
    }

    pub fn free_all(&mut self, frames: impl IntoIterator<Item = u64>) {
        for frame in frames {
            self.free(frame);
        }
    }
}
