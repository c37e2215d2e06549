//! Per-connection queue of out-of-order received segments, ordered by
//! sequence number.

use std::collections::VecDeque;

use super::segment::Segment;
use super::seq_no;

#[derive(Debug, Default)]
pub struct IQueue {
    segments: VecDeque<Segment>,
}

impl IQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rcv_nxt: u32, rcv_wnd: u16, seg: Segment) {
        let pos = self
            .segments
            .iter()
            .position(|qe| seq_no::seg_cmp(rcv_nxt, rcv_wnd, seg.seq, qe.seq).is_lt())
            .unwrap_or(self.segments.len());
        self.segments.insert(pos, seg);
    }

    /// Removes a specific segment, identified by its sequence number. Used
    /// when a partially-consumed segment is re-extracted by the pipeline and
    /// still carries residual length to re-insert.
    pub fn remove(&mut self, seq: u32) {
        if let Some(pos) = self.segments.iter().position(|s| s.seq == seq) {
            self.segments.remove(pos);
        }
    }

    /// Pops the earliest ready segment, discarding any unacceptable ones in
    /// front of it. Returns `None` without dequeuing if the head is
    /// acceptable but not yet ready (its SEQ is still ahead of `rcv_nxt`).
    pub fn get_ready(&mut self, rcv_nxt: u32, rcv_wnd: u16) -> Option<Segment> {
        loop {
            let head = self.segments.front()?;
            if seq_no::segment_acceptable(rcv_nxt, rcv_wnd, head.seq, head.len()) {
                break;
            }
            self.segments.pop_front();
        }

        let head = self.segments.front().unwrap();
        if !seq_no::segment_ready(rcv_nxt, head.seq, head.len()) {
            return None;
        }

        self.segments.pop_front()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_seg(seq: u32, len: usize) -> Segment {
        Segment::make_data(seq, 0, 4096, true, false, vec![0; len])
    }

    #[test]
    fn insert_keeps_segments_sorted() {
        let mut q = IQueue::new();
        q.insert(100, 1000, data_seg(300, 5));
        q.insert(100, 1000, data_seg(200, 5));

        let first = q.get_ready(100, 1000);
        assert!(first.is_none(), "seq 200 is not yet ready: rcv_nxt is 100");
    }

    #[test]
    fn get_ready_discards_stale_segments() {
        let mut q = IQueue::new();
        // Entirely left of the window: rcv_nxt has already moved past it.
        q.insert(300, 1000, data_seg(100, 5));
        q.insert(300, 1000, data_seg(300, 5));

        let seg = q.get_ready(300, 1000).unwrap();
        assert_eq!(seg.seq, 300);
        assert!(q.is_empty());
    }

    #[test]
    fn get_ready_waits_for_gap_to_close() {
        let mut q = IQueue::new();
        q.insert(100, 1000, data_seg(105, 5));

        assert!(q.get_ready(100, 1000).is_none());
    }
}
