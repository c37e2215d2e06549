//! TCP state machine, wire codec, and the queues that back them. `lib.rs`
//! owns the dispatcher loop and the maps that route arriving segments to a
//! `Tcb`; everything in this module is agnostic to how it's scheduled.

use std::net::Ipv4Addr;
use std::time::Duration;

pub(crate) mod amap;
mod ioutil;
mod iqueue;
mod listen;
mod segment;
mod seq_no;
mod stream;
mod tcb;
mod tqueue;

pub use ioutil::write_reset_reply;
pub use listen::TcpListener;
pub use stream::TcpStream;
pub use tcb::{Action, Kind, State, TCB};

/// Upper bound on how long a segment can remain in transit (RFC 9293 uses
/// this to size Time-Wait); tracked only as the basis for `TIME_WAIT_TIMEOUT`.
pub const MAX_SEGMENT_LIFETIME: Duration = Duration::from_secs(15);
/// 2*MSL. Time-Wait holds the quad this long before the Tcb is deleted.
pub const TIME_WAIT_TIMEOUT: Duration = Duration::from_secs(2 * 15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dual {
    pub ipv4: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub src: Dual,
    pub dst: Dual,
}
