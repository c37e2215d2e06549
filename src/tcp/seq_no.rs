//! Sequence number arithmetic, modulo 2^32.
//!
//! Every comparison here is a three-point test of the form "b lies between
//! a and c going forward around the ring", which is what makes wrap-around
//! at 2^32 transparent to the caller. These are free functions rather than
//! methods on a connection type: they only ever need a handful of u32/u16
//! values, never the whole connection.

use std::cmp::Ordering;

/// a <= b < c, modulo 2^32.
fn le_lt(a: u32, b: u32, c: u32) -> bool {
    if a <= c {
        a <= b && b < c
    } else {
        b < c || a <= b
    }
}

/// a < b <= c, modulo 2^32.
fn lt_le(a: u32, b: u32, c: u32) -> bool {
    if a <= c {
        a < b && b <= c
    } else {
        b <= c || a < b
    }
}

/// SND.UNA < SEG.ACK <= SND.NXT
pub fn ack_acceptable(snd_una: u32, seg_ack: u32, snd_nxt: u32) -> bool {
    lt_le(snd_una, seg_ack, snd_nxt)
}

/// An ACK is a duplicate if it acknowledges something already acked
/// (SEG.ACK <= SND.UNA). There's no three-point primitive for a plain
/// less-than, so this is done on a best-effort basis via signed difference:
/// a negative (top-bit-set) or zero difference means duplicate.
pub fn ack_duplicate(snd_una: u32, seg_ack: u32) -> bool {
    let diff = seg_ack.wrapping_sub(snd_una);
    diff == 0 || diff & 0x8000_0000 != 0
}

/// RCV.NXT <= sn < RCV.NXT + RCV.WND
pub fn in_rcv_wnd(rcv_nxt: u32, rcv_wnd: u16, sn: u32) -> bool {
    le_lt(rcv_nxt, sn, rcv_nxt.wrapping_add(rcv_wnd as u32))
}

/// Whether an already-acceptable segment carries a new window update.
/// SND.WL1 is used instead of SND.NXT as the anchor for "new enough": the
/// peer shouldn't have acked anything past what we've sent, so
/// SND.UNA+SND.WND is a safe upper comparison bound.
pub fn new_wnd_update(
    snd_wl1: u32,
    snd_wl2: u32,
    snd_una: u32,
    snd_wnd: u16,
    seg_seq: u32,
    seg_ack: u32,
) -> bool {
    let bound = snd_una.wrapping_add(snd_wnd as u32);

    let n_seq = lt_le(snd_wl1, seg_seq, bound);
    let n_ack = snd_wl1 == seg_seq && le_lt(snd_wl2, seg_ack, bound.wrapping_add(1));

    n_seq || n_ack
}

/// A segment is ready for processing once it intersects RCV.NXT, i.e. it
/// can be consumed right now rather than waiting behind a gap.
pub fn segment_ready(rcv_nxt: u32, seg_seq: u32, seg_len: u32) -> bool {
    le_lt(seg_seq, rcv_nxt, seg_seq.wrapping_add(seg_len).wrapping_add(1))
}

/// A data/control segment is fully acked once SEG.SEQ+SEG.LEN <= ack.
pub fn segment_acked(seg_seq: u32, seg_len: u32, ack: u32) -> bool {
    debug_assert!(seg_len > 0);
    lt_le(seg_seq, seg_seq.wrapping_add(seg_len), ack)
}

/// Whether the connection's initial SYN has been acked.
pub fn syn_acked(iss: u32, snd_una: u32, snd_nxt: u32) -> bool {
    lt_le(iss, snd_una, snd_nxt)
}

/// RFC 9293 S3.4's segment acceptability table over (SEG.LEN, RCV.WND) in
/// {0, >0} x {0, >0}.
pub fn segment_acceptable(rcv_nxt: u32, rcv_wnd: u16, seg_seq: u32, seg_len: u32) -> bool {
    if seg_len == 0 && rcv_wnd == 0 {
        return seg_seq == rcv_nxt;
    }
    if seg_len == 0 && rcv_wnd != 0 {
        return in_rcv_wnd(rcv_nxt, rcv_wnd, seg_seq);
    }
    if seg_len > 0 && rcv_wnd == 0 {
        return false;
    }

    let wnd_end = rcv_nxt.wrapping_add(rcv_wnd as u32);
    let seg_end = seg_seq.wrapping_add(seg_len);

    let begin_in = le_lt(rcv_nxt, seg_seq, wnd_end);
    let end_in = le_lt(rcv_nxt, seg_end.wrapping_sub(1), wnd_end);
    let wnd_begin_in = le_lt(seg_seq, rcv_nxt, seg_end);
    let wnd_end_in = le_lt(seg_seq, wnd_end.wrapping_sub(1), seg_end);

    begin_in || end_in || wnd_begin_in || wnd_end_in
}

/// Sequence-space units consumed by the control bits alone.
pub fn control_len(syn: bool, fin: bool) -> u32 {
    syn as u32 + fin as u32
}

/// How many units to trim off the left/right of an acceptable segment so it
/// fits entirely inside the receive window.
pub fn seg_trim_calc(rcv_nxt: u32, rcv_wnd: u16, seg_seq: u32, seg_len: u32) -> (u32, u32) {
    debug_assert!(segment_acceptable(rcv_nxt, rcv_wnd, seg_seq, seg_len));

    let wnd_end = rcv_nxt.wrapping_add(rcv_wnd as u32);

    let left = if lt_le(seg_seq, rcv_nxt, wnd_end) {
        rcv_nxt.wrapping_sub(seg_seq)
    } else {
        0
    };

    let seg_end = seg_seq.wrapping_add(seg_len);
    let right = if lt_le(seg_seq.wrapping_sub(1), seg_end, wnd_end) {
        0
    } else {
        seg_end.wrapping_sub(wnd_end)
    };

    (left, right)
}

/// Orders two acceptable segments by sequence, anchored at RCV.NXT+RCV.WND
/// so wrap-around near that boundary still sorts correctly. Only meaningful
/// for segments that already pass `segment_acceptable`.
pub fn seg_cmp(rcv_nxt: u32, rcv_wnd: u16, a_seq: u32, b_seq: u32) -> Ordering {
    let bound = rcv_nxt.wrapping_add(rcv_wnd as u32);

    if lt_le(a_seq, b_seq, bound) && a_seq != b_seq {
        return Ordering::Less;
    }
    if lt_le(b_seq, a_seq, bound) && a_seq != b_seq {
        return Ordering::Greater;
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_acceptable_basic() {
        assert!(ack_acceptable(100, 101, 110));
        assert!(!ack_acceptable(100, 100, 110));
        assert!(ack_acceptable(100, 110, 110));
        assert!(!ack_acceptable(100, 111, 110));
    }

    #[test]
    fn ack_acceptable_wraps() {
        let near_wrap = u32::MAX - 2;
        assert!(ack_acceptable(near_wrap, near_wrap.wrapping_add(1), near_wrap.wrapping_add(5)));
    }

    #[test]
    fn ack_duplicate_basic() {
        assert!(ack_duplicate(100, 100));
        assert!(ack_duplicate(100, 50));
        assert!(!ack_duplicate(100, 101));
    }

    #[test]
    fn segment_acceptable_zero_len_zero_wnd() {
        assert!(segment_acceptable(100, 0, 100, 0));
        assert!(!segment_acceptable(100, 0, 101, 0));
    }

    #[test]
    fn segment_acceptable_positive_len_zero_wnd_rejected() {
        assert!(!segment_acceptable(100, 0, 100, 5));
    }

    #[test]
    fn segment_acceptable_straddle() {
        // window is [100, 110); segment [90, 120) straddles it entirely.
        assert!(segment_acceptable(100, 10, 90, 30));
    }

    #[test]
    fn segment_ready_intersects_rcv_nxt() {
        assert!(segment_ready(100, 95, 10));
        assert!(!segment_ready(100, 101, 10));
    }

    #[test]
    fn seg_trim_calc_fully_inside() {
        let (left, right) = seg_trim_calc(100, 100, 150, 10);
        assert_eq!((left, right), (0, 0));
    }

    #[test]
    fn seg_trim_calc_left_overhang() {
        let (left, right) = seg_trim_calc(100, 100, 95, 10);
        assert_eq!((left, right), (5, 0));
    }

    #[test]
    fn seg_cmp_orders_by_sequence() {
        assert_eq!(seg_cmp(100, 1000, 200, 300), Ordering::Less);
        assert_eq!(seg_cmp(100, 1000, 300, 200), Ordering::Greater);
        assert_eq!(seg_cmp(100, 1000, 200, 200), Ordering::Equal);
    }
}
