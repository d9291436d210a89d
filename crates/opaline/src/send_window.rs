//! Ordered buffer of outbound segments awaiting acknowledgment.
//!
//! The head entry is the oldest unacknowledged segment. `advance` drops the
//! cumulatively acknowledged prefix and reports how many entries it freed,
//! which the caller passes straight back to `refill` to keep the window
//! topped up until EOF.

use std::io::Read;

use crate::segment::{MAX_DATA, Segment};

#[derive(Debug)]
pub struct SendWindow {
    segments: std::collections::VecDeque<Segment>,
    /// Offset of the first entry not yet transmitted in the current pass.
    cursor: usize,
    /// Seq to assign to the next buffered segment; file data starts at 1
    /// because seq 0 belongs to the handshake.
    next_seq: u32,
    eof: bool,
}

impl SendWindow {
    pub fn new() -> Self {
        Self {
            segments: std::collections::VecDeque::new(),
            cursor: 0,
            next_seq: 1,
            eof: false,
        }
    }

    /// Buffers up to `count` more segments from the file.
    pub fn refill<R: Read>(&mut self, count: usize, reader: &mut R) -> std::io::Result<usize> {
        let mut added = 0;
        for _ in 0..count {
            if self.eof {
                break;
            }
            let mut segment = Segment::default();
            let mut filled = 0;
            while filled < MAX_DATA {
                let n = reader.read(&mut segment.data[filled..])?;
                if n == 0 {
                    self.eof = true;
                    break;
                }
                filled += n;
            }
            segment.len = filled as u16;
            segment.seq = self.next_seq;
            self.next_seq += 1;
            if self.eof {
                segment.flags.eof = true;
            }
            self.segments.push_back(segment);
            added += 1;
        }
        Ok(added)
    }

    /// Oldest unacknowledged segment.
    pub fn head(&self) -> Option<&Segment> {
        self.segments.front()
    }

    pub fn head_seq(&self) -> Option<u32> {
        self.segments.front().map(|segment| segment.seq)
    }

    /// Drops every entry with `seq < ack` and returns the number dropped.
    pub fn advance(&mut self, ack: u32) -> usize {
        let mut dropped = 0;
        while self
            .segments
            .front()
            .is_some_and(|segment| segment.seq < ack)
        {
            self.segments.pop_front();
            dropped += 1;
        }
        self.cursor = self.cursor.saturating_sub(dropped);
        dropped
    }

    /// Next untransmitted segment whose seq still fits inside the effective
    /// window of `budget` datagrams counted from the head.
    pub fn next_to_send(&mut self, budget: u16) -> Option<Segment> {
        let head_seq = self.head_seq()?;
        let segment = self.segments.get(self.cursor)?;
        if segment.seq < head_seq + budget as u32 {
            let segment = segment.clone();
            self.cursor += 1;
            Some(segment)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn eof_reached(&self) -> bool {
        self.eof
    }
}

impl Default for SendWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn refill_numbers_segments_from_one() {
        let mut window = SendWindow::new();
        let mut file = Cursor::new(vec![0xAB; MAX_DATA * 2 + 10]);
        let added = window.refill(8, &mut file).unwrap();
        assert_eq!(added, 3);
        let seqs: Vec<u32> = window.segments.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(window.segments[2].len, 10);
        assert!(window.segments[2].flags.eof);
        assert!(window.eof_reached());
    }

    #[test]
    fn exact_multiple_file_ends_with_an_empty_eof_segment() {
        let mut window = SendWindow::new();
        let mut file = Cursor::new(vec![0xCD; MAX_DATA]);
        window.refill(8, &mut file).unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window.segments[0].len as usize, MAX_DATA);
        assert!(!window.segments[0].flags.eof);
        assert_eq!(window.segments[1].len, 0);
        assert!(window.segments[1].flags.eof);
    }

    #[test]
    fn advance_drops_the_acked_prefix() {
        let mut window = SendWindow::new();
        let mut file = Cursor::new(vec![1u8; MAX_DATA * 5]);
        window.refill(4, &mut file).unwrap();
        assert_eq!(window.advance(3), 2);
        assert_eq!(window.head_seq(), Some(3));
        // refill with the freed count keeps the window topped up
        let added = window.refill(2, &mut file).unwrap();
        assert_eq!(added, 2);
        assert_eq!(window.len(), 4);
    }

    #[test]
    fn next_to_send_respects_the_budget() {
        let mut window = SendWindow::new();
        let mut file = Cursor::new(vec![1u8; MAX_DATA * 4]);
        window.refill(4, &mut file).unwrap();

        assert_eq!(window.next_to_send(2).map(|s| s.seq), Some(1));
        assert_eq!(window.next_to_send(2).map(|s| s.seq), Some(2));
        // budget exhausted: head is still 1, so seq 3 is outside head + 2
        assert!(window.next_to_send(2).is_none());

        // cumulative ack for 1 and 2 opens the budget again
        window.advance(3);
        assert_eq!(window.next_to_send(2).map(|s| s.seq), Some(3));
    }

    #[test]
    fn cursor_survives_partial_acks() {
        let mut window = SendWindow::new();
        let mut file = Cursor::new(vec![1u8; MAX_DATA * 3]);
        window.refill(3, &mut file).unwrap();
        window.next_to_send(3).unwrap();
        window.next_to_send(3).unwrap();
        window.advance(2);
        // seq 2 was already transmitted; the next fresh segment is 3
        assert_eq!(window.next_to_send(3).map(|s| s.seq), Some(3));
    }

    #[test]
    fn empty_file_yields_a_single_eof_segment() {
        let mut window = SendWindow::new();
        let mut file = Cursor::new(Vec::new());
        assert_eq!(window.refill(4, &mut file).unwrap(), 1);
        let head = window.head().unwrap();
        assert_eq!(head.seq, 1);
        assert_eq!(head.len, 0);
        assert!(head.flags.eof);
    }
}
