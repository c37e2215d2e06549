use std::cmp;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice, TcpOptionElement};

use super::ioutil;
use super::iqueue::IQueue;
use super::segment::Segment;
use super::seq_no;
use super::tqueue::TQueue;
use super::{Dual, Quad};

pub const RCV_BUF_SIZE: usize = 4096;
pub const SND_BUF_SIZE: usize = 4096;
pub const DEFAULT_MSS: u16 = 536;

/*
                    RFC 9293 - S3.3.2 - Fig 5

                            +---------+ ---------\      active OPEN
                            |  CLOSED |            \    -----------
                            +---------+<---------\   \   create TCB
                              |     ^              \   \  snd SYN
                 passive OPEN |     |   CLOSE        \   \
                 ------------ |     | ----------       \   \
                  create TCB  |     | delete TCB         \   \
                              V     |                      \   \
          rcv RST (note 1)  +---------+            CLOSE    |    \
       -------------------->|  LISTEN |          ---------- |     |
      /                     +---------+          delete TCB |     |
     /           rcv SYN      |     |     SEND              |     |
    /           -----------   |     |    -------            |     V
+--------+      snd SYN,ACK  /       \   snd SYN          +--------+
|        |<-----------------           ------------------>|        |
|  SYN   |                    rcv SYN                     |  SYN   |
|  RCVD  |<-----------------------------------------------|  SENT  |
|        |                  snd SYN,ACK                   |        |
|        |------------------           -------------------|        |
+--------+   rcv ACK of SYN  \       /  rcv SYN,ACK       +--------+
   |         --------------   |     |   -----------
   |                x         |     |     snd ACK
   |                          V     V
   |  CLOSE                 +---------+
   | -------                |  ESTAB  |
   | snd FIN                +---------+
   |                 CLOSE    |     |    rcv FIN
   V                -------   |     |    -------
+---------+         snd FIN  /       \   snd ACK         +---------+
|  FIN    |<----------------          ------------------>|  CLOSE  |
| WAIT-1  |------------------                            |   WAIT  |
+---------+          rcv FIN  \                          +---------+
  | rcv ACK of FIN   -------   |                          CLOSE  |
  | --------------   snd ACK   |                         ------- |
  V        x                   V                         snd FIN V
+---------+               +---------+                    +---------+
|FINWAIT-2|               | CLOSING |                    | LAST-ACK|
+---------+               +---------+                    +---------+
  |              rcv ACK of FIN |                 rcv ACK of FIN |
  |  rcv FIN     -------------- |    Timeout=2MSL -------------- |
  |  -------            x       V    ------------        x       V
   \ snd ACK              +---------+delete TCB          +---------+
     -------------------->|TIME-WAIT|------------------->| CLOSED  |
                          +---------+                    +---------+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Listen,
    SynRcvd,
    SynSent,
    Estab,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
    /// Synthetic: never held by a live `TCB`. Reported by `TcpStream::status`
    /// and to `on_state_change` once the connection's entry has been
    /// removed from the dispatcher's tables.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Active,
    Passive,
}

#[derive(Debug, Clone)]
pub enum Action {
    Noop,
    AddToPending(TCB),
    RemoveFromPending,
    IsEstablished,
    /// Peer reset the connection, or a protocol violation forced one: wake
    /// every blocked caller with an error and drop the connection.
    Reset,
    /// The connection reached Closed through the ordinary close sequence;
    /// remove it and wake whoever is blocked in `close()`.
    DeleteTCB,
    Wakeup {
        wake_up_reader: bool,
        wake_up_writer: bool,
        wake_up_closer: bool,
    },
}

/*
                RFC 9293 - S3.3.1 - Fig 3

           1         2          3          4
      ----------|----------|----------|----------
             SND.UNA    SND.NXT    SND.UNA
                                  +SND.WND
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SendSpace {
    una: u32,
    nxt: u32,
    wnd: u16,
    wl1: u32,
    wl2: u32,
    iss: u32,
    mss: u16,
}

/*
                RFC 9293 - S3.3.1 - Fig 4

                       1          2          3
                   ----------|----------|----------
                          RCV.NXT    RCV.NXT
                                    +RCV.WND
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecvSpace {
    nxt: u32,
    wnd: u16,
    irs: u32,
    mss: u16,
}

enum Stage {
    Done,
    Continue,
}

#[derive(Debug, Clone)]
pub struct TCB {
    pub(crate) quad: Quad,
    pub(crate) kind: Kind,
    pub(crate) state: State,

    snd: SendSpace,
    rcv: RecvSpace,

    send_fin: bool,
    recv_fin: bool,
    fin_is_acked: bool,

    pub(crate) reset: Arc<AtomicBool>,
    time_wait: Option<Instant>,

    iqueue: IQueue,
    tqueue: TQueue,

    pub(crate) incoming: VecDeque<u8>,
    pub(crate) outgoing: VecDeque<u8>,
}

impl TCB {
    fn base(quad: Quad, kind: Kind, state: State, iss: u32) -> Self {
        TCB {
            quad,
            kind,
            state,
            snd: SendSpace {
                una: iss,
                nxt: iss,
                wnd: 0,
                wl1: 0,
                wl2: 0,
                iss,
                mss: DEFAULT_MSS,
            },
            rcv: RecvSpace {
                nxt: 0,
                wnd: RCV_BUF_SIZE as u16,
                irs: 0,
                mss: DEFAULT_MSS,
            },
            send_fin: false,
            recv_fin: false,
            fin_is_acked: false,
            reset: Arc::new(AtomicBool::new(false)),
            time_wait: None,
            iqueue: IQueue::new(),
            tqueue: TQueue::new(),
            incoming: VecDeque::with_capacity(RCV_BUF_SIZE),
            outgoing: VecDeque::with_capacity(SND_BUF_SIZE),
        }
    }

    /// Creates a fresh passive-open TCB for an inbound SYN; `iss` has
    /// already been chosen by the caller (see `choose_iss`).
    pub fn listen(quad: Quad, iss: u32) -> Self {
        TCB::base(quad, Kind::Passive, State::Listen, iss)
    }

    /// Creates an active-open TCB, enqueues its initial SYN for
    /// retransmission, and writes it to the wire immediately.
    pub fn connect(quad: Quad, iss: u32, tun: &mut impl std::io::Write) -> Self {
        let mut tcb = TCB::base(quad, Kind::Active, State::SynSent, iss);
        let syn = Segment::make_ctrl(iss, 0, tcb.rcv.wnd, true, false, false, false);
        tcb.snd.nxt = iss.wrapping_add(1);
        tcb.tqueue.enqueue(syn.dup(), Instant::now());
        tcb.transmit(tun, &syn);
        log::debug!("{:?}: active open, iss={}", tcb.quad, iss);
        tcb
    }

    pub fn is_outgoing_full(&self) -> bool {
        self.outgoing.len() >= SND_BUF_SIZE
    }

    /// Whether the peer's FIN has been reached in order (`rcv_buf_fin` in
    /// spec terms). Once set, `rcv_nxt` no longer advances, so a reader
    /// draining `incoming` to empty afterwards has seen everything the peer
    /// will ever send.
    pub fn is_recv_fin(&self) -> bool {
        self.recv_fin
    }

    fn is_fin_acked(&self) -> bool {
        self.tqueue.is_empty() && self.fin_is_acked
    }

    /// Marks the write half closed. If nothing is queued, a bare FIN
    /// segment is enqueued immediately; otherwise the FIN rides the last
    /// data segment once `drain_send_buffer` reaches the end of the buffer.
    pub fn close(&mut self) {
        match self.state {
            State::Estab => self.state = State::FinWait1,
            State::CloseWait => self.state = State::LastAck,
            State::Listen | State::SynSent => {
                self.reset();
                return;
            }
            _ => return,
        }

        self.send_fin = true;
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> usize {
        let len = cmp::min(buf.len(), self.incoming.len());
        for (i, byte) in self.incoming.drain(..len).enumerate() {
            buf[i] = byte;
        }

        // Receiver SWS avoidance (RFC 9293 S3.8.6.2.2): only grow the
        // advertised window once freed space is worth announcing.
        let free = RCV_BUF_SIZE - self.incoming.len() - self.rcv.wnd as usize;
        if free >= cmp::min(RCV_BUF_SIZE / 2, self.rcv.mss as usize) {
            self.rcv.wnd = (RCV_BUF_SIZE - self.incoming.len()) as u16;
        }

        len
    }

    /// Marks the connection reset. Idempotent: a second call (e.g. the
    /// pipeline resetting a connection that's already been torn down by an
    /// earlier stage in the same tick) is a no-op.
    pub fn reset(&mut self) {
        if self.reset.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("{:?}: reset from {:?}", self.quad, self.state);
        self.time_wait = None;
        self.tqueue.clear();
        self.iqueue.clear();
    }

    /// Per-tick housekeeping: retransmit on timeout, send any newly
    /// available data, and expire the Time-Wait timer. Returns `true` once
    /// the TCB should be deleted.
    pub fn on_tick(&mut self, tun: &mut impl std::io::Write) -> bool {
        let now = Instant::now();

        if let Some(seg) = self.tqueue.poll_timeout(now) {
            log::trace!("{:?}: retransmitting seq={}", self.quad, seg.seq);
            self.transmit(tun, &seg);
        }

        self.drain_send_buffer(tun);

        if let Some(deadline) = self.time_wait {
            if now >= deadline {
                log::debug!("{:?}: time-wait expired", self.quad);
                return true;
            }
        }

        false
    }

    /// Computes and sends as much newly-available send-buffer data as the
    /// peer's window allows, per the new-data transmit loop. The final
    /// segment carries FIN if the send buffer is fully drained and the
    /// write half is closed.
    fn drain_send_buffer(&mut self, tun: &mut impl std::io::Write) {
        let avail = self
            .snd
            .una
            .wrapping_add(self.snd.wnd as u32)
            .wrapping_sub(self.snd.nxt) as usize;
        let sent_len = self.snd.nxt.wrapping_sub(self.snd.una) as usize;
        let unsent = self.outgoing.len().saturating_sub(sent_len);
        let pending = unsent + if self.send_fin { 1 } else { 0 };

        let xfer = cmp::min(avail, pending);
        if xfer == 0 {
            return;
        }

        let send_fin = self.send_fin && xfer == pending;
        let data_len = xfer - if send_fin { 1 } else { 0 };

        let data: Vec<u8> = self.outgoing.iter().skip(sent_len).take(data_len).copied().collect();

        let seg = Segment::make_data(self.snd.nxt, 0, 0, true, send_fin, data);
        self.prepare_and_transmit(tun, seg);
    }

    /// Assigns SEQ, advances SND.NXT, sets the window/ack fields, enqueues
    /// a copy for retransmission (if it consumes sequence space), and
    /// writes the segment to the wire.
    fn prepare_and_transmit(&mut self, tun: &mut impl std::io::Write, mut seg: Segment) {
        let got_syn = !matches!(self.state, State::Listen | State::SynSent);
        if got_syn && !seg.rst {
            seg.ack_set = true;
        }

        seg.seq = self.snd.nxt;
        self.snd.nxt = self.snd.nxt.wrapping_add(seg.len());

        self.tqueue.enqueue(seg.dup(), Instant::now());
        self.transmit(tun, &seg);
    }

    fn transmit(&self, tun: &mut impl std::io::Write, seg: &Segment) {
        let wnd = self.rcv.wnd;
        let ack = if seg.ack_set { self.rcv.nxt } else { 0 };

        ioutil::write_segment(
            tun,
            &self.quad,
            seg.seq,
            ack,
            wnd,
            seg.syn,
            seg.fin,
            seg.rst,
            seg.ack_set,
            &seg.data,
        );
    }

    fn send_ack(&self, tun: &mut impl std::io::Write) {
        ioutil::write_segment(tun, &self.quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, false, false, false, true, &[]);
    }

    fn send_reset_reply(&self, tun: &mut impl std::io::Write, incoming: &Segment) {
        let rst = Segment::make_rst(incoming);
        ioutil::write_segment(tun, &self.quad, rst.seq, rst.ack, 0, false, false, true, rst.ack_set, &[]);
    }

    pub fn on_segment(
        &mut self,
        _ip4h: Ipv4HeaderSlice,
        tcph: TcpHeaderSlice,
        data: &[u8],
        tun: &mut impl std::io::Write,
    ) -> Action {
        let mss = parse_mss(&tcph);
        let seg = segment_from_wire(&tcph, data);

        match self.state {
            State::Listen => self.on_listen(seg, mss, tun),
            State::SynSent => self.on_syn_sent(seg, tun),
            _ => self.on_synchronized(seg, tun),
        }
    }

    fn on_listen(&mut self, seg: Segment, mss: Option<u16>, tun: &mut impl std::io::Write) -> Action {
        if seg.rst {
            return Action::Noop;
        }

        if seg.ack_set {
            self.send_reset_reply(tun, &seg);
            return Action::Noop;
        }

        if !seg.syn {
            return Action::Noop;
        }

        // A SYN carrying payload in Listen: the payload is dropped, the SYN
        // is still honored.
        self.rcv.irs = seg.seq;
        self.rcv.nxt = seg.seq.wrapping_add(1);
        self.rcv.mss = mss.unwrap_or(DEFAULT_MSS);

        self.snd.wnd = seg.wnd;
        self.snd.wl1 = seg.seq;
        self.snd.wl2 = seg.seq;

        self.state = State::SynRcvd;
        log::debug!("{:?}: SYN received, irs={}", self.quad, self.rcv.irs);

        let synack = Segment::make_ctrl(self.snd.nxt, self.rcv.nxt, self.rcv.wnd, true, false, false, true);
        self.prepare_and_transmit(tun, synack);

        Action::AddToPending(self.clone())
    }

    fn on_syn_sent(&mut self, seg: Segment, tun: &mut impl std::io::Write) -> Action {
        if seg.ack_set && !seq_no::ack_acceptable(self.snd.una, seg.ack, self.snd.nxt) {
            if !seg.rst {
                self.send_reset_reply(tun, &seg);
            }
            return Action::Noop;
        }

        if seg.rst {
            if seg.ack_set {
                self.reset();
                return Action::Reset;
            }
            return Action::Noop;
        }

        if !seg.syn {
            return Action::Noop;
        }

        self.rcv.irs = seg.seq;
        self.rcv.nxt = seg.seq.wrapping_add(1);

        if seg.ack_set {
            self.snd.una = seg.ack;
            let fin_acked = self.tqueue.on_ack(self.snd.una, Instant::now());
            if fin_acked {
                self.fin_is_acked = true;
            }
        }

        self.snd.wnd = seg.wnd;
        self.snd.wl1 = seg.seq;
        self.snd.wl2 = seg.seq;

        if seq_no::syn_acked(self.snd.iss, self.snd.una, self.snd.nxt) {
            self.state = State::Estab;
            log::debug!("{:?}: established (active)", self.quad);
            self.send_ack(tun);
            Action::IsEstablished
        } else {
            self.state = State::SynRcvd;
            let synack = Segment::make_ctrl(self.snd.nxt, self.rcv.nxt, self.rcv.wnd, true, false, false, true);
            self.prepare_and_transmit(tun, synack);
            Action::Noop
        }
    }

    /// The seven-stage pipeline for SynReceived and later. A segment that
    /// fails acceptability gets a bare ACK (unless it's RST) and is
    /// dropped before reaching the pipeline at all, matching how an
    /// unacceptable segment is handled ahead of per-state RST processing.
    fn on_synchronized(&mut self, seg: Segment, tun: &mut impl std::io::Write) -> Action {
        if !seq_no::segment_acceptable(self.rcv.nxt, self.rcv.wnd, seg.seq, seg.len()) {
            if !seg.rst {
                self.send_ack(tun);
            }
            return Action::Noop;
        }

        self.iqueue.insert(self.rcv.nxt, self.rcv.wnd, seg);

        let mut action = Action::Noop;
        let mut processed_any = false;
        while let Some(seg) = self.iqueue.get_ready(self.rcv.nxt, self.rcv.wnd) {
            processed_any = true;
            let (outcome, residue, next_action) = self.process_ready_segment(seg, tun);
            if let Some(next_action) = next_action {
                action = next_action;
            }
            if matches!(outcome, Stage::Continue) {
                if let Some(residue) = residue {
                    if residue.len() > 0 {
                        self.iqueue.insert(self.rcv.nxt, self.rcv.wnd, residue);
                    }
                }
            }
            if matches!(action, Action::Reset | Action::RemoveFromPending | Action::DeleteTCB) {
                break;
            }
        }

        // Accepted but left sitting behind a gap: ack the current rcv_nxt
        // so the peer can tell what's still missing (RFC 9293 S3.8.6.2.2's
        // immediate-ack-on-out-of-order recommendation).
        if !processed_any {
            self.send_ack(tun);
        }

        action
    }

    /// Runs the seven stages over one already-dequeued, ready segment.
    /// Returns the pipeline outcome, any residual segment to re-insert, and
    /// an `Action` for the dispatcher if this stage triggered a
    /// state-level event.
    fn process_ready_segment(
        &mut self,
        mut seg: Segment,
        tun: &mut impl std::io::Write,
    ) -> (Stage, Option<Segment>, Option<Action>) {
        // Stage 1: RST.
        if seg.rst {
            let action = match self.state {
                State::SynRcvd if self.kind == Kind::Passive => {
                    self.state = State::Listen;
                    Action::RemoveFromPending
                }
                State::SynRcvd | State::Estab | State::FinWait1 | State::FinWait2 | State::CloseWait => {
                    self.reset();
                    Action::Reset
                }
                State::Closing | State::LastAck | State::TimeWait => {
                    self.reset();
                    Action::Reset
                }
                _ => Action::Noop,
            };
            return (Stage::Done, None, Some(action));
        }

        // Stage 2: security/precedence — accept-all no-op.

        // Stage 3: SYN within the window is a protocol violation. The
        // compliant response is to reset the connection outright rather
        // than merely log it.
        if seg.syn {
            log::warn!("{:?}: SYN within window in {:?}, resetting", self.quad, self.state);
            self.send_reset_reply(tun, &seg);
            self.reset();
            return (Stage::Done, None, Some(Action::Reset));
        }

        // Stage 4: ACK.
        if !seg.ack_set {
            return (Stage::Done, None, None);
        }

        let mut action = None;
        match self.state {
            State::SynRcvd => {
                if seq_no::ack_acceptable(self.snd.una, seg.ack, self.snd.nxt) {
                    self.snd.una = seg.ack;
                    self.state = State::Estab;
                    log::debug!("{:?}: established (passive)", self.quad);
                    action = Some(Action::IsEstablished);
                } else {
                    self.send_reset_reply(tun, &seg);
                    return (Stage::Done, None, None);
                }
            }
            State::Estab | State::FinWait1 | State::FinWait2 | State::CloseWait | State::Closing | State::LastAck => {
                if !seq_no::ack_acceptable(self.snd.una, seg.ack, self.snd.nxt) {
                    if !seq_no::ack_duplicate(self.snd.una, seg.ack) {
                        self.send_ack(tun);
                        return (Stage::Done, None, None);
                    }
                    // Duplicate ack: ignore and fall through to later stages.
                } else {
                    self.snd.una = seg.ack;

                    if seq_no::new_wnd_update(self.snd.wl1, self.snd.wl2, self.snd.una, self.snd.wnd, seg.seq, seg.ack) {
                        self.snd.wnd = seg.wnd;
                        self.snd.wl1 = seg.seq;
                        self.snd.wl2 = seg.ack;
                    }

                    if self.tqueue.on_ack(self.snd.una, Instant::now()) {
                        self.fin_is_acked = true;
                    }
                }

                if self.state == State::FinWait1 && self.is_fin_acked() {
                    self.state = State::FinWait2;
                    action = Some(Action::Wakeup { wake_up_reader: false, wake_up_writer: false, wake_up_closer: true });
                } else if self.state == State::Closing && self.is_fin_acked() {
                    self.state = State::TimeWait;
                    self.time_wait = Some(Instant::now() + crate::tcp::TIME_WAIT_TIMEOUT);
                } else if self.state == State::LastAck && self.is_fin_acked() {
                    return (Stage::Done, None, Some(Action::DeleteTCB));
                }
            }
            State::TimeWait => {
                self.send_ack(tun);
            }
            _ => {}
        }

        // Stage 5: URG — no-op (urgent-pointer delivery is out of scope).

        // Stage 6: TEXT.
        if matches!(self.state, State::CloseWait | State::Closing | State::LastAck | State::TimeWait) {
            return (Stage::Done, None, action);
        }

        if seg.text_size() > 0 {
            let (left, right) = seq_no::seg_trim_calc(self.rcv.nxt, self.rcv.wnd, seg.seq, seg.len());
            seg.trim(left, right);

            let free = RCV_BUF_SIZE - self.incoming.len();
            let xfer = cmp::min(seg.text_size() as usize, free);

            if xfer > 0 {
                self.incoming.extend(&seg.data[..xfer]);
                self.rcv.nxt = self.rcv.nxt.wrapping_add(xfer as u32);
                self.rcv.wnd = self.rcv.wnd.saturating_sub(xfer as u16);
                self.send_ack(tun);
                action = Some(Action::Wakeup { wake_up_reader: true, wake_up_writer: false, wake_up_closer: false });
            }

            if xfer as u32 >= seg.text_size() {
                seg.data.clear();
            } else {
                seg.data.drain(..xfer);
                seg.seq = seg.seq.wrapping_add(xfer as u32);
            }

            if !seg.data.is_empty() {
                return (Stage::Continue, Some(seg), action);
            }
        }

        // Stage 7: FIN — only honored once no text remains.
        if seg.fin && seg.text_size() == 0 {
            self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
            self.rcv.wnd = self.rcv.wnd.saturating_sub(1);
            self.send_ack(tun);
            self.recv_fin = true;

            action = match self.state {
                State::Estab => {
                    self.state = State::CloseWait;
                    Some(Action::Wakeup { wake_up_reader: true, wake_up_writer: false, wake_up_closer: false })
                }
                State::FinWait1 => {
                    self.state = State::Closing;
                    Some(Action::Wakeup { wake_up_reader: true, wake_up_writer: false, wake_up_closer: false })
                }
                State::FinWait2 => {
                    self.state = State::TimeWait;
                    self.time_wait = Some(Instant::now() + crate::tcp::TIME_WAIT_TIMEOUT);
                    Some(Action::Wakeup { wake_up_reader: true, wake_up_writer: false, wake_up_closer: false })
                }
                State::TimeWait => {
                    self.time_wait = Some(Instant::now() + crate::tcp::TIME_WAIT_TIMEOUT);
                    action
                }
                _ => action,
            };
        }

        (Stage::Done, None, action)
    }
}

fn parse_mss(tcph: &TcpHeaderSlice) -> Option<u16> {
    tcph.options_iterator().find_map(|opt| match opt {
        Ok(TcpOptionElement::MaximumSegmentSize(mss)) => Some(mss),
        _ => None,
    })
}

fn segment_from_wire(tcph: &TcpHeaderSlice, data: &[u8]) -> Segment {
    Segment {
        seq: tcph.sequence_number(),
        ack: tcph.acknowledgment_number(),
        wnd: tcph.window_size(),
        up: tcph.urgent_pointer(),
        syn: tcph.syn(),
        fin: tcph.fin(),
        rst: tcph.rst(),
        ack_set: tcph.ack(),
        data: data.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::{Ipv4Header, TcpHeader};
    use std::net::Ipv4Addr;

    fn quad() -> Quad {
        Quad {
            src: Dual { ipv4: Ipv4Addr::new(10, 0, 0, 1), port: 9090 },
            dst: Dual { ipv4: Ipv4Addr::new(10, 0, 0, 2), port: 4000 },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn raw_segment(seq: u32, ack: u32, wnd: u16, syn: bool, fin: bool, rst: bool, ack_set: bool, data: &[u8]) -> Vec<u8> {
        let mut tcph = TcpHeader::new(4000, 9090, seq, wnd);
        tcph.syn = syn;
        tcph.fin = fin;
        tcph.rst = rst;
        tcph.ack = ack_set;
        tcph.acknowledgment_number = ack;

        let ip4h = Ipv4Header::new(tcph.header_len() + data.len() as u16, 64, 6, [10, 0, 0, 2], [10, 0, 0, 1]);
        tcph.checksum = tcph.calc_checksum_ipv4(&ip4h, data).unwrap();

        let mut buf = Vec::new();
        ip4h.write(&mut buf).unwrap();
        tcph.write(&mut buf).unwrap();
        buf.extend_from_slice(data);
        buf
    }

    fn dispatch(tcb: &mut TCB, raw: &[u8], sink: &mut Vec<u8>) -> Action {
        let ip4h = Ipv4HeaderSlice::from_slice(raw).unwrap();
        let ihl = ip4h.ihl() as usize * 4;
        let tcph = TcpHeaderSlice::from_slice(&raw[ihl..]).unwrap();
        let data_off = tcph.data_offset() as usize * 4;
        let data = &raw[ihl + data_off..];
        tcb.on_segment(ip4h, tcph, data, sink)
    }

    #[test]
    fn passive_handshake_reaches_established() {
        let mut tcb = TCB::listen(quad(), 1000);
        let mut sink = Vec::new();

        let syn = raw_segment(5000, 0, 4096, true, false, false, false, &[]);
        let action = dispatch(&mut tcb, &syn, &mut sink);
        assert!(matches!(action, Action::AddToPending(_)));
        assert_eq!(tcb.state, State::SynRcvd);
        assert_eq!(tcb.rcv.nxt, 5001);

        let ack = raw_segment(5001, tcb.snd.nxt, 4096, false, false, false, true, &[]);
        let action = dispatch(&mut tcb, &ack, &mut sink);
        assert!(matches!(action, Action::IsEstablished));
        assert_eq!(tcb.state, State::Estab);
    }

    #[test]
    fn active_handshake_reaches_established() {
        let mut sink = Vec::new();
        let mut tcb = TCB::connect(quad(), 1000, &mut sink);
        assert_eq!(tcb.state, State::SynSent);

        let synack = raw_segment(5000, 1001, 4096, true, false, false, true, &[]);
        let action = dispatch(&mut tcb, &synack, &mut sink);
        assert!(matches!(action, Action::IsEstablished));
        assert_eq!(tcb.state, State::Estab);
        assert_eq!(tcb.rcv.nxt, 5001);
    }

    fn established(iss: u32, peer_iss: u32) -> (TCB, Vec<u8>) {
        let mut tcb = TCB::listen(quad(), iss);
        let mut sink = Vec::new();

        dispatch(&mut tcb, &raw_segment(peer_iss, 0, 4096, true, false, false, false, &[]), &mut sink);
        dispatch(&mut tcb, &raw_segment(peer_iss + 1, tcb.snd.nxt, 4096, false, false, false, true, &[]), &mut sink);
        assert_eq!(tcb.state, State::Estab);

        (tcb, sink)
    }

    #[test]
    fn data_segment_is_delivered_and_acked() {
        let (mut tcb, mut sink) = established(1000, 5000);

        let data = raw_segment(5001, tcb.snd.nxt, 4096, false, false, false, true, b"hello");
        let action = dispatch(&mut tcb, &data, &mut sink);

        assert!(matches!(action, Action::Wakeup { wake_up_reader: true, .. }));
        assert_eq!(tcb.incoming, b"hello".iter().copied().collect::<VecDeque<_>>());
        assert_eq!(tcb.rcv.nxt, 5006);

        let mut buf = [0u8; 16];
        let n = tcb.recv(&mut buf);
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn peer_fin_moves_established_to_close_wait() {
        let (mut tcb, mut sink) = established(1000, 5000);

        let fin = raw_segment(5001, tcb.snd.nxt, 4096, false, true, false, true, &[]);
        let action = dispatch(&mut tcb, &fin, &mut sink);

        assert!(matches!(action, Action::Wakeup { wake_up_reader: true, .. }));
        assert_eq!(tcb.state, State::CloseWait);
    }

    #[test]
    fn peer_fin_with_empty_buffer_marks_recv_fin() {
        let (mut tcb, mut sink) = established(1000, 5000);

        let fin = raw_segment(5001, tcb.snd.nxt, 4096, false, true, false, true, &[]);
        dispatch(&mut tcb, &fin, &mut sink);

        assert!(tcb.incoming.is_empty());
        assert!(tcb.is_recv_fin());
    }

    #[test]
    fn syn_within_window_resets_established_connection() {
        let (mut tcb, mut sink) = established(1000, 5000);

        let syn = raw_segment(5001, tcb.snd.nxt, 4096, true, false, false, true, &[]);
        let action = dispatch(&mut tcb, &syn, &mut sink);

        assert!(matches!(action, Action::Reset));
        assert!(tcb.reset.load(Ordering::Acquire));
    }

    #[test]
    fn rst_in_established_resets_connection() {
        let (mut tcb, mut sink) = established(1000, 5000);

        let rst = raw_segment(5001, 0, 4096, false, false, true, false, &[]);
        let action = dispatch(&mut tcb, &rst, &mut sink);

        assert!(matches!(action, Action::Reset));
        assert!(tcb.reset.load(Ordering::Acquire));
    }

    #[test]
    fn close_on_established_enqueues_fin() {
        let (mut tcb, _sink) = established(1000, 5000);

        tcb.close();

        assert_eq!(tcb.state, State::FinWait1);
        assert!(tcb.send_fin);
    }

    #[test]
    fn is_outgoing_full_tracks_snd_buf_size() {
        let mut tcb = TCB::listen(quad(), 1000);
        tcb.outgoing.extend(std::iter::repeat(0u8).take(SND_BUF_SIZE));
        assert!(tcb.is_outgoing_full());
    }

    #[test]
    fn stray_ack_to_listen_resets_and_stays_listen() {
        let mut tcb = TCB::listen(quad(), 1000);
        let mut sink = Vec::new();

        let stray_ack = raw_segment(500, 999, 4096, false, false, false, true, &[]);
        let action = dispatch(&mut tcb, &stray_ack, &mut sink);

        assert!(matches!(action, Action::Noop));
        assert_eq!(tcb.state, State::Listen);
        assert!(!sink.is_empty(), "expected a RST reply on the wire");

        let ip4h = Ipv4HeaderSlice::from_slice(&sink).unwrap();
        let ihl = ip4h.ihl() as usize * 4;
        let tcph = TcpHeaderSlice::from_slice(&sink[ihl..]).unwrap();
        assert!(tcph.rst());
    }

    #[test]
    fn retransmission_recovers_after_timeout_via_on_tick() {
        let (mut tcb, mut sink) = established(1000, 5000);

        tcb.outgoing.extend(b"0123456789".iter().copied());
        assert!(!tcb.on_tick(&mut sink));
        assert!(!sink.is_empty(), "first on_tick should drain the send buffer onto the wire");

        std::thread::sleep(crate::tcp::tqueue::RETRANSMIT_TIMEOUT + std::time::Duration::from_millis(100));

        sink.clear();
        assert!(!tcb.on_tick(&mut sink));
        assert!(!sink.is_empty(), "expected S1 to be retransmitted after the 2s timeout");

        let ip4h = Ipv4HeaderSlice::from_slice(&sink).unwrap();
        let ihl = ip4h.ihl() as usize * 4;
        let tcph = TcpHeaderSlice::from_slice(&sink[ihl..]).unwrap();
        assert_eq!(tcph.sequence_number(), tcb.snd.una);

        // Peer finally acks the retransmitted segment: the queue disarms.
        let ack = raw_segment(5001, tcb.snd.nxt, 4096, false, false, false, true, &[]);
        dispatch(&mut tcb, &ack, &mut sink);
        assert!(tcb.tqueue.is_empty());
        assert!(!tcb.tqueue.is_armed());
    }

    #[test]
    fn out_of_order_reassembly_acks_once_after_gap_closes() {
        // rcv_nxt = 295 once established against peer_iss = 294.
        let (mut tcb, mut sink) = established(1000, 294);
        assert_eq!(tcb.rcv.nxt, 295);

        let second = raw_segment(300, tcb.snd.nxt, 4096, false, false, false, true, b"56789");
        sink.clear();
        let action = dispatch(&mut tcb, &second, &mut sink);
        assert!(matches!(action, Action::Noop));
        assert_eq!(tcb.rcv.nxt, 295, "out-of-order segment must not advance rcv_nxt");
        assert!(!sink.is_empty(), "expected an immediate ack for the still-missing gap");
        let ip4h = Ipv4HeaderSlice::from_slice(&sink).unwrap();
        let ihl = ip4h.ihl() as usize * 4;
        let tcph = TcpHeaderSlice::from_slice(&sink[ihl..]).unwrap();
        assert_eq!(tcph.acknowledgment_number(), 295);

        let first = raw_segment(295, tcb.snd.nxt, 4096, false, false, false, true, b"01234");
        sink.clear();
        let action = dispatch(&mut tcb, &first, &mut sink);
        assert!(matches!(action, Action::Wakeup { wake_up_reader: true, .. }));
        assert_eq!(tcb.rcv.nxt, 305);

        let mut buf = [0u8; 16];
        let n = tcb.recv(&mut buf);
        assert_eq!(&buf[..n], b"0123456789");

        // Closing the gap lets two segments become ready in one dispatch,
        // so the loop acks twice (once per segment consumed); only the
        // final ack (305) matters to the peer. Pure acks carry no payload
        // and no options here, so each is a fixed 40-byte frame.
        let last = &sink[sink.len() - 40..];
        let ip4h = Ipv4HeaderSlice::from_slice(last).unwrap();
        let ihl = ip4h.ihl() as usize * 4;
        let tcph = TcpHeaderSlice::from_slice(&last[ihl..]).unwrap();
        assert_eq!(tcph.acknowledgment_number(), 305);
    }
}
