//! Out-of-order receive buffer with a sliding acknowledgment window.
//!
//! Segments land in a circular array of `frame_size = 2 * window` slots at
//! index `seq % frame_size`. The window `[base, base + size)` slides right as
//! in-order segments are delivered; `next` marks the first still-missing
//! slot. Sequence zero is reserved for the handshake, so it never reaches
//! this buffer.

use crate::segment::Segment;

/// Result of inserting one received segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The segment filled the next expected slot; `next` advanced over any
    /// run of previously buffered segments.
    InOrder,
    /// Buffered beyond the gap; `ack` names the first missing seq so the
    /// caller can emit a duplicate ACK.
    OutOfOrder { ack: u32 },
    /// The same segment is already buffered.
    Duplicate,
    /// The seq falls outside the current window.
    OutOfRange,
    /// No free slot in the window.
    WindowFull,
}

#[derive(Debug)]
struct SlidingWindow {
    /// Left edge: index of the next slot to deliver.
    base: usize,
    /// First empty index within the window.
    next: usize,
    /// Window size in slots.
    size: usize,
    /// Free slots remaining in the window.
    win: usize,
}

#[derive(Debug)]
pub struct RecvBuffer {
    frame_size: usize,
    /// Seq of the segment that seeded the window; zero until then.
    first_seq: u32,
    /// Next expected seq, i.e. the current cumulative ACK value.
    next_seq: u32,
    /// Newest seq already covered by a sent cumulative ACK.
    acked: u32,
    /// Timestamp to echo with the next cumulative ACK.
    ts: u32,
    slots: Vec<Option<Segment>>,
    wnd: SlidingWindow,
}

impl RecvBuffer {
    pub fn new(window_size: u16) -> Self {
        let size = window_size as usize;
        let frame_size = 2 * size;
        Self {
            frame_size,
            first_seq: 0,
            next_seq: 0,
            acked: 0,
            ts: 0,
            slots: vec![None; frame_size],
            wnd: SlidingWindow {
                base: 0,
                next: 0,
                size,
                win: size,
            },
        }
    }

    /// Offset of a slot index from `base`, correcting for wrap.
    fn rel(&self, idx: usize) -> usize {
        (idx + self.frame_size - self.wnd.base) % self.frame_size
    }

    fn in_window(&self, idx: usize) -> bool {
        let r = self.rel(idx);
        r >= self.rel(self.wnd.next) && r < self.wnd.size
    }

    /// Slots delivered-ready at the front of the window.
    fn in_order_len(&self) -> usize {
        self.rel(self.wnd.next)
    }

    pub fn write(&mut self, segment: &Segment) -> WriteOutcome {
        if self.wnd.win == 0 {
            return WriteOutcome::WindowFull;
        }

        let idx = segment.seq as usize % self.frame_size;

        if self.first_seq > 0
            && self.slots[idx]
                .as_ref()
                .is_some_and(|buffered| buffered.seq == segment.seq)
        {
            return WriteOutcome::Duplicate;
        }

        if self.first_seq == 0 {
            // First segment seeds the window around its own slot.
            self.first_seq = segment.seq;
            self.next_seq = segment.seq + 1;
            self.ts = segment.ts;
            self.wnd.base = idx;
            self.wnd.next = (idx + 1) % self.frame_size;
            self.slots[idx] = Some(segment.clone());
            self.wnd.win -= 1;
            return WriteOutcome::InOrder;
        }

        if !self.in_window(idx) {
            return WriteOutcome::OutOfRange;
        }

        if idx == self.wnd.next {
            self.slots[idx] = Some(segment.clone());
            self.wnd.win -= 1;
            self.ts = segment.ts;
            // Advance over the freshly completed run, including segments
            // buffered out of order earlier.
            loop {
                self.next_seq += 1;
                self.wnd.next = (self.wnd.next + 1) % self.frame_size;
                if self.slots[self.wnd.next].is_none() {
                    break;
                }
            }
            WriteOutcome::InOrder
        } else {
            self.slots[idx] = Some(segment.clone());
            self.wnd.win -= 1;
            WriteOutcome::OutOfOrder { ack: self.next_seq }
        }
    }

    /// Delivers the segment at `base` and slides the window one slot.
    ///
    /// Without `force`, delivery requires that the filled part of the window
    /// has no gaps and that more than one in-order segment is waiting; the
    /// 500 ms delayed-ACK tick passes `force` so a lone buffered segment
    /// still gets out. Returns the segment and the count of in-order
    /// segments still waiting.
    pub fn read(&mut self, force: bool) -> Option<(Segment, usize)> {
        let in_order = self.in_order_len();

        let deliver = if force {
            in_order > 0
        } else {
            let buffered = self.wnd.size - self.wnd.win;
            if in_order < buffered {
                // Gaps remain; wait for them to fill.
                return None;
            }
            in_order > 1
        };
        if !deliver {
            return None;
        }

        let segment = self.slots[self.wnd.base].take()?;
        self.wnd.base = (self.wnd.base + 1) % self.frame_size;
        self.wnd.win += 1;
        Some((segment, in_order - 1))
    }

    /// Cumulative ACK for the buffered in-order run, if it is worth sending:
    /// more than one segment buffered since the last ACK and the newest of
    /// them not yet acknowledged.
    pub fn in_order_ack(&self) -> Option<(u32, u32)> {
        if self.in_order_len() <= 1 {
            return None;
        }
        let idx = (self.wnd.next + self.frame_size - 1) % self.frame_size;
        let last = self.slots[idx].as_ref()?;
        if last.seq <= self.acked {
            return None;
        }
        Some((last.seq + 1, last.ts))
    }

    /// Records that a cumulative ACK with this value went out.
    pub fn note_acked(&mut self, ack: u32) {
        if ack > 0 {
            self.acked = self.acked.max(ack - 1);
        }
    }

    pub fn win(&self) -> u16 {
        self.wnd.win as u16
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn first_seq(&self) -> u32 {
        self.first_seq
    }

    /// Timestamp of the newest in-order segment, echoed in cumulative ACKs.
    pub fn ts(&self) -> u32 {
        self.ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(seq: u32) -> Segment {
        let mut segment = Segment {
            seq,
            ts: seq * 10,
            ..Segment::default()
        };
        segment.set_payload(seq.to_string().as_bytes()).unwrap();
        segment
    }

    /// `win` must always equal the number of empty slots inside the window.
    fn check_win_invariant(buf: &RecvBuffer) {
        let empty = (0..buf.wnd.size)
            .map(|offset| (buf.wnd.base + offset) % buf.frame_size)
            .filter(|&idx| buf.slots[idx].is_none())
            .count();
        assert_eq!(buf.wnd.win, empty);
    }

    #[test]
    fn first_segment_seeds_the_window() {
        let mut buf = RecvBuffer::new(4);
        assert_eq!(buf.write(&segment(1)), WriteOutcome::InOrder);
        assert_eq!(buf.first_seq(), 1);
        assert_eq!(buf.next_seq(), 2);
        assert_eq!(buf.win(), 3);
        check_win_invariant(&buf);
    }

    #[test]
    fn gap_fill_advances_over_buffered_run() {
        let mut buf = RecvBuffer::new(4);
        buf.write(&segment(1));
        assert_eq!(buf.write(&segment(3)), WriteOutcome::OutOfOrder { ack: 2 });
        assert_eq!(buf.write(&segment(4)), WriteOutcome::OutOfOrder { ack: 2 });
        check_win_invariant(&buf);
        assert_eq!(buf.write(&segment(2)), WriteOutcome::InOrder);
        assert_eq!(buf.next_seq(), 5);
        check_win_invariant(&buf);
    }

    #[test]
    fn buffered_segment_is_reported_as_duplicate() {
        let mut buf = RecvBuffer::new(4);
        buf.write(&segment(1));
        buf.write(&segment(3));
        assert_eq!(buf.write(&segment(3)), WriteOutcome::Duplicate);
        check_win_invariant(&buf);
    }

    #[test]
    fn segment_beyond_the_window_is_out_of_range() {
        let mut buf = RecvBuffer::new(4);
        buf.write(&segment(1));
        assert_eq!(buf.write(&segment(6)), WriteOutcome::OutOfRange);
        check_win_invariant(&buf);
    }

    #[test]
    fn exhausted_window_reports_full() {
        let mut buf = RecvBuffer::new(2);
        buf.write(&segment(1));
        buf.write(&segment(2));
        assert_eq!(buf.write(&segment(3)), WriteOutcome::WindowFull);
    }

    #[test]
    fn read_without_force_needs_a_gapless_run_of_two() {
        let mut buf = RecvBuffer::new(4);
        buf.write(&segment(1));
        // A lone in-order segment stays put until the delayed-ACK tick.
        assert!(buf.read(false).is_none());

        buf.write(&segment(3));
        // Gap at seq 2: nothing may be delivered.
        assert!(buf.read(false).is_none());

        buf.write(&segment(2));
        let (first, remaining) = buf.read(false).unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(remaining, 2);
        check_win_invariant(&buf);
    }

    #[test]
    fn forced_read_delivers_a_lone_segment() {
        let mut buf = RecvBuffer::new(4);
        buf.write(&segment(1));
        let (delivered, remaining) = buf.read(true).unwrap();
        assert_eq!(delivered.seq, 1);
        assert_eq!(remaining, 0);
        assert_eq!(buf.win(), 4);
        assert!(buf.read(true).is_none());
        check_win_invariant(&buf);
    }

    #[test]
    fn duplicate_of_a_delivered_segment_leaves_the_buffer_unchanged() {
        let mut buf = RecvBuffer::new(4);
        buf.write(&segment(1));
        buf.read(true).unwrap();
        let win_before = buf.win();
        let next_before = buf.next_seq();
        // The slot was cleared on delivery, so the retransmission falls left
        // of the window and is absorbed.
        assert_eq!(buf.write(&segment(1)), WriteOutcome::OutOfRange);
        assert_eq!(buf.win(), win_before);
        assert_eq!(buf.next_seq(), next_before);
        check_win_invariant(&buf);
    }

    #[test]
    fn window_slides_across_the_frame_boundary() {
        let mut buf = RecvBuffer::new(2);
        let mut delivered = Vec::new();
        for seq in 1..=9u32 {
            assert_eq!(buf.write(&segment(seq)), WriteOutcome::InOrder);
            check_win_invariant(&buf);
            while let Some((seg, _)) = buf.read(true) {
                delivered.push(seg.seq);
            }
        }
        assert_eq!(delivered, (1..=9).collect::<Vec<_>>());
        assert_eq!(buf.win(), 2);
    }

    #[test]
    fn in_order_ack_names_the_run_end() {
        let mut buf = RecvBuffer::new(4);
        buf.write(&segment(1));
        assert!(buf.in_order_ack().is_none());
        buf.write(&segment(2));
        assert_eq!(buf.in_order_ack(), Some((3, 20)));
        buf.note_acked(3);
        assert!(buf.in_order_ack().is_none());
        buf.write(&segment(3));
        assert_eq!(buf.in_order_ack(), Some((4, 30)));
    }
}
