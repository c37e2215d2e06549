//! Wire encoding: building an IPv4+TCP datagram from a segment's fields and
//! writing it to the tun device. This is the only module that speaks
//! `etherparse`/`tidy-tuntap`; everything above it deals in `Segment`s.

use std::io::{Cursor, Write};

use etherparse::{Ipv4Header, Ipv4HeaderSlice, TcpHeader, TcpHeaderSlice};

use super::{Dual, Quad};

const TTL: u8 = 64;
const TCP_PROTOCOL: u8 = 6;

#[allow(clippy::too_many_arguments)]
fn build_datagram(
    quad: &Quad,
    seq: u32,
    ack: u32,
    wnd: u16,
    syn: bool,
    fin: bool,
    rst: bool,
    ack_set: bool,
    data: &[u8],
) -> Cursor<[u8; 1500]> {
    let mut tcph = TcpHeader::new(quad.src.port, quad.dst.port, seq, wnd);
    tcph.syn = syn;
    tcph.fin = fin;
    tcph.rst = rst;
    tcph.ack = ack_set;
    tcph.acknowledgment_number = ack;

    let ip4h = Ipv4Header::new(
        tcph.header_len() + data.len() as u16,
        TTL,
        TCP_PROTOCOL,
        quad.src.ipv4.octets(),
        quad.dst.ipv4.octets(),
    );

    tcph.checksum = tcph.calc_checksum_ipv4(&ip4h, data).unwrap();

    let mut cursor = Cursor::new([0u8; 1500]);
    ip4h.write(&mut cursor).unwrap();
    tcph.write(&mut cursor).unwrap();
    cursor.write_all(data).unwrap();
    cursor
}

/// Writes any outbound segment described in terms of a known local quad
/// (the connection's own endpoints) to the tun device.
#[allow(clippy::too_many_arguments)]
pub fn write_segment(
    tun: &mut impl std::io::Write,
    quad: &Quad,
    seq: u32,
    ack: u32,
    wnd: u16,
    syn: bool,
    fin: bool,
    rst: bool,
    ack_set: bool,
    data: &[u8],
) {
    let cursor = build_datagram(quad, seq, ack, wnd, syn, fin, rst, ack_set, data);
    let n = cursor.position() as usize;
    let _ = tun.write(&cursor.get_ref()[..n]);
}

/// Builds and writes the RST that answers an arriving segment when no
/// connection owns its quad yet (the dispatcher only has the wire slices,
/// not a `Tcb`). Mirrors `Segment::make_rst`'s contract directly against the
/// raw header fields.
pub fn write_reset_reply(tun: &mut impl std::io::Write, ip4h: &Ipv4HeaderSlice, tcph: &TcpHeaderSlice, data: &[u8]) {
    let quad = Quad {
        src: Dual {
            ipv4: ip4h.destination_addr(),
            port: tcph.destination_port(),
        },
        dst: Dual {
            ipv4: ip4h.source_addr(),
            port: tcph.source_port(),
        },
    };

    if tcph.ack() {
        write_segment(tun, &quad, tcph.acknowledgment_number(), 0, 0, false, false, true, false, &[]);
    } else {
        let ack = tcph
            .sequence_number()
            .wrapping_add(data.len() as u32)
            .wrapping_add(if tcph.syn() { 1 } else { 0 });
        write_segment(tun, &quad, 0, ack, 0, false, false, true, true, &[]);
    }
}
