//! Bounded hand-off queue between the network worker and the print task.
//!
//! Owns its copies of delivered segments in arrival order. The containing
//! `Mutex` is taken before any state is inspected, emptiness checks
//! included, and is never held across I/O.

use std::collections::VecDeque;

use crate::segment::Segment;

/// Default queue capacity in segments.
pub const FIFO_SIZE: usize = 512;

#[derive(Debug)]
pub struct SegmentFifo {
    queue: VecDeque<Segment>,
    capacity: usize,
    closed: bool,
}

impl SegmentFifo {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            closed: false,
        }
    }

    /// Appends a segment, or hands it back when the queue is at capacity.
    pub fn write(&mut self, segment: Segment) -> Result<usize, Segment> {
        if self.queue.len() == self.capacity {
            return Err(segment);
        }
        self.queue.push_back(segment);
        Ok(self.queue.len())
    }

    /// Detaches and returns the oldest segment.
    pub fn read(&mut self) -> Option<Segment> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() == self.capacity
    }

    /// Marks the producing side as finished; the consumer drains what is
    /// left and then stops polling.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(seq: u32) -> Segment {
        Segment {
            seq,
            ..Segment::default()
        }
    }

    #[test]
    fn is_empty_means_no_segments() {
        let mut fifo = SegmentFifo::new(2);
        assert!(fifo.is_empty());
        assert!(!fifo.is_full());
        fifo.write(segment(1)).unwrap();
        assert!(!fifo.is_empty());
    }

    #[test]
    fn is_full_means_at_capacity() {
        let mut fifo = SegmentFifo::new(2);
        assert!(!fifo.is_full());
        fifo.write(segment(1)).unwrap();
        fifo.write(segment(2)).unwrap();
        assert!(fifo.is_full());
        assert!(!fifo.is_empty());
    }

    #[test]
    fn rejects_writes_at_capacity() {
        let mut fifo = SegmentFifo::new(1);
        fifo.write(segment(1)).unwrap();
        let rejected = fifo.write(segment(2)).unwrap_err();
        assert_eq!(rejected.seq, 2);
        assert_eq!(fifo.len(), 1);
    }

    #[test]
    fn preserves_arrival_order() {
        let mut fifo = SegmentFifo::new(8);
        for seq in 1..=5 {
            fifo.write(segment(seq)).unwrap();
        }
        let drained: Vec<u32> = std::iter::from_fn(|| fifo.read()).map(|s| s.seq).collect();
        assert_eq!(drained, vec![1, 2, 3, 4, 5]);
        assert!(fifo.read().is_none());
    }

    #[test]
    fn close_is_sticky() {
        let mut fifo = SegmentFifo::new(2);
        assert!(!fifo.is_closed());
        fifo.close();
        assert!(fifo.is_closed());
    }
}
