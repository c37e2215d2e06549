//! In-memory representation of a TCP segment, independent of wire framing.

use super::seq_no;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub seq: u32,
    pub ack: u32,
    pub wnd: u16,
    pub up: u16,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub ack_set: bool,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn control_len(&self) -> u32 {
        seq_no::control_len(self.syn, self.fin)
    }

    pub fn text_size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Sequence-space length: payload bytes plus one for each control bit
    /// that consumes a sequence number.
    pub fn len(&self) -> u32 {
        self.control_len() + self.text_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn make_ctrl(seq: u32, ack: u32, wnd: u16, syn: bool, fin: bool, rst: bool, ack_set: bool) -> Self {
        Segment {
            seq,
            ack,
            wnd,
            up: 0,
            syn,
            fin,
            rst,
            ack_set,
            data: Vec::new(),
        }
    }

    pub fn make_data(seq: u32, ack: u32, wnd: u16, ack_set: bool, fin: bool, data: Vec<u8>) -> Self {
        Segment {
            seq,
            ack,
            wnd,
            up: 0,
            syn: false,
            fin,
            rst: false,
            ack_set,
            data,
        }
    }

    /// Builds the RST that answers an incoming segment: if it carried ACK,
    /// the reset takes its sequence number from that ACK and carries no ACK
    /// of its own; otherwise it is `RST|ACK` with seq 0 and ack set to the
    /// sum of the incoming segment's sequence number and length.
    pub fn make_rst(incoming: &Segment) -> Self {
        if incoming.ack_set {
            Segment::make_ctrl(incoming.ack, 0, 0, false, false, true, false)
        } else {
            let ack = incoming.seq.wrapping_add(incoming.len());
            Segment::make_ctrl(0, ack, 0, false, false, true, true)
        }
    }

    pub fn dup(&self) -> Self {
        self.clone()
    }

    /// Trims `left` sequence-space units from the front and `right` from the
    /// back. Trimming the first unit removes SYN (if set) and advances
    /// `seq`; trimming the last unit removes FIN (if set). The two
    /// full-trim cases (entire segment consumed from one side) are handled
    /// before the general case, matching how control bits interact with
    /// payload trimming at the boundaries.
    pub fn trim(&mut self, mut left: u32, mut right: u32) {
        if left == 0 && right == 0 {
            return;
        }

        if left >= self.len() {
            // Entirely trimmed from the left: only seq moves.
            self.seq = self.seq.wrapping_add(self.len());
            self.len_to_zero();
            return;
        }

        if right >= self.len() {
            // Entirely trimmed from the right: seq stays put.
            self.len_to_zero();
            return;
        }

        if left > 0 && self.syn {
            self.syn = false;
            self.seq = self.seq.wrapping_add(1);
            left -= 1;
        }

        if right > 0 && self.fin {
            self.fin = false;
            right -= 1;
        }

        debug_assert!((left + right) as usize <= self.data.len());

        let new_len = self.data.len() - (left + right) as usize;
        self.data.drain(..left as usize);
        self.data.truncate(new_len);
        if left > 0 {
            self.seq = self.seq.wrapping_add(left);
        }
    }

    fn len_to_zero(&mut self) {
        self.syn = false;
        self.fin = false;
        self.data.clear();
    }

    pub fn text_copy(&self, dst: &mut [u8], n: usize) -> usize {
        let n = n.min(self.data.len()).min(dst.len());
        dst[..n].copy_from_slice(&self.data[..n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_only_segment_has_no_text() {
        let seg = Segment::make_ctrl(100, 0, 4096, true, false, false, false);
        assert_eq!(seg.len(), 1);
        assert_eq!(seg.text_size(), 0);
    }

    #[test]
    fn data_segment_len_accounts_for_fin() {
        let seg = Segment::make_data(100, 0, 4096, true, true, vec![1, 2, 3]);
        assert_eq!(seg.len(), 4);
    }

    #[test]
    fn make_rst_from_ack_bearing_segment() {
        let incoming = Segment::make_ctrl(50, 999, 4096, false, false, false, true);
        let rst = Segment::make_rst(&incoming);
        assert!(rst.rst);
        assert!(!rst.ack_set);
        assert_eq!(rst.seq, 999);
    }

    #[test]
    fn make_rst_from_non_ack_segment() {
        let incoming = Segment::make_data(500, 0, 0, false, false, vec![0; 4]);
        let rst = Segment::make_rst(&incoming);
        assert!(rst.rst);
        assert!(rst.ack_set);
        assert_eq!(rst.seq, 0);
        assert_eq!(rst.ack, 504);
    }

    #[test]
    fn trim_zero_is_identity() {
        let mut seg = Segment::make_data(100, 0, 4096, true, false, vec![1, 2, 3]);
        let before = seg.clone();
        seg.trim(0, 0);
        assert_eq!(seg, before);
    }

    #[test]
    fn trim_left_drops_syn_and_advances_seq() {
        let mut seg = Segment::make_data(100, 0, 4096, true, false, vec![1, 2, 3]);
        seg.syn = true;
        seg.trim(1, 0);
        assert!(!seg.syn);
        assert_eq!(seg.seq, 101);
        assert_eq!(seg.data, vec![1, 2, 3]);
    }

    #[test]
    fn trim_is_associative_on_the_left() {
        let mut a = Segment::make_data(100, 0, 4096, true, false, vec![1, 2, 3, 4, 5]);
        let mut b = a.clone();

        a.trim(1, 0);
        a.trim(2, 0);

        b.trim(3, 0);

        assert_eq!(a, b);
    }

    #[test]
    fn trim_entire_segment_from_left() {
        let mut seg = Segment::make_data(100, 0, 4096, true, true, vec![1, 2, 3]);
        seg.trim(5, 0);
        assert_eq!(seg.len(), 0);
        assert_eq!(seg.seq, 105);
    }
}
