//! TCP header views and segment builders.
//!
//! Two builder flavours exist on purpose. [`rebuild_segment`] carries the
//! original header bytes (options included) into the forged segment and only
//! patches seq/flags/lengths; [`build_segment`] serializes a fresh 20-byte
//! header. The mangler picks one per the section's fragmentation strategy.

use super::ip::{self, PROTO_TCP};
use super::{fold, incremental_update, pseudo_sum, sum16};

pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_ACK: u8 = 0x10;

/// Borrowed view of the TCP header at `l4` inside a whole L3 packet.
#[derive(Clone, Copy)]
pub struct TcpView<'a> {
    pkt: &'a [u8],
    l4: usize,
}

impl<'a> TcpView<'a> {
    pub fn new(pkt: &'a [u8], l4: usize) -> Option<Self> {
        if pkt.len() < l4 + 20 {
            return None;
        }
        let v = Self { pkt, l4 };
        if v.header_len() < 20 || pkt.len() < l4 + v.header_len() {
            return None;
        }
        Some(v)
    }

    fn h(&self) -> &[u8] {
        &self.pkt[self.l4..]
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.h()[0], self.h()[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.h()[2], self.h()[3]])
    }

    pub fn seq(&self) -> u32 {
        u32::from_be_bytes([self.h()[4], self.h()[5], self.h()[6], self.h()[7]])
    }

    pub fn ack(&self) -> u32 {
        u32::from_be_bytes([self.h()[8], self.h()[9], self.h()[10], self.h()[11]])
    }

    pub fn header_len(&self) -> usize {
        usize::from(self.h()[12] >> 4) * 4
    }

    pub fn flags(&self) -> u8 {
        self.h()[13]
    }

    pub fn is_syn(&self) -> bool {
        self.flags() & FLAG_SYN != 0
    }

    pub fn window(&self) -> u16 {
        u16::from_be_bytes([self.h()[14], self.h()[15]])
    }
}

/// Recompute the TCP checksum of the packet in place (pseudo-header + TCP
/// header + data per RFC 1071).
pub fn finalize_tcp_checksum(pkt: &mut [u8], l4: usize) {
    pkt[l4 + 16] = 0;
    pkt[l4 + 17] = 0;
    let Some(pseudo) = pseudo_sum(pkt, l4, PROTO_TCP) else {
        return;
    };
    let ck = !fold(sum16(&pkt[l4..], pseudo));
    pkt[l4 + 16..l4 + 18].copy_from_slice(&ck.to_be_bytes());
}

/// Overwrite the TCP window with `win`, adjusting the checksum via the
/// RFC 1624 incremental update so every other byte stays identical.
pub fn override_window(pkt: &mut [u8], win: u16) -> bool {
    let Some((proto, l4)) = ip::l4_offset(pkt) else {
        return false;
    };
    if proto != PROTO_TCP || pkt.len() < l4 + 20 {
        return false;
    }
    let old = u16::from_be_bytes([pkt[l4 + 14], pkt[l4 + 15]]);
    pkt[l4 + 14..l4 + 16].copy_from_slice(&win.to_be_bytes());
    let check = u16::from_be_bytes([pkt[l4 + 16], pkt[l4 + 17]]);
    let check = incremental_update(check, old, win);
    pkt[l4 + 16..l4 + 18].copy_from_slice(&check.to_be_bytes());
    true
}

/// Forge a segment by reusing the original IP + TCP header bytes wholesale:
/// same options, same ACK/flags (SYN cleared), patched seq and lengths,
/// recomputed checksums.
pub fn rebuild_segment(pkt: &[u8], l4: usize, payload: &[u8], seq: u32) -> Option<Vec<u8>> {
    let tcp = TcpView::new(pkt, l4)?;
    let hdr_end = l4 + tcp.header_len();
    let mut out = Vec::with_capacity(hdr_end + payload.len());
    out.extend_from_slice(&pkt[..hdr_end]);
    out.extend_from_slice(payload);
    out[l4 + 4..l4 + 8].copy_from_slice(&seq.to_be_bytes());
    out[l4 + 13] &= !FLAG_SYN;
    let total = out.len();
    ip::patch_ip_len(&mut out, total);
    finalize_tcp_checksum(&mut out, l4);
    Some(out)
}

/// Forge a segment with a freshly serialized 20-byte TCP header: ports,
/// seq/ack, ACK/PSH flags and window taken from the template, options and
/// SYN discarded.
pub fn build_segment(
    pkt: &[u8],
    l4: usize,
    payload: &[u8],
    seq: u32,
    window: Option<u16>,
) -> Option<Vec<u8>> {
    let tcp = TcpView::new(pkt, l4)?;
    let mut out = Vec::with_capacity(l4 + 20 + payload.len());
    out.extend_from_slice(&pkt[..l4]);
    out.extend_from_slice(&tcp.src_port().to_be_bytes());
    out.extend_from_slice(&tcp.dst_port().to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&tcp.ack().to_be_bytes());
    out.push(5 << 4);
    out.push(tcp.flags() & !FLAG_SYN);
    out.extend_from_slice(&window.unwrap_or_else(|| tcp.window()).to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]); // checksum + urgent
    out.extend_from_slice(payload);
    let total = out.len();
    ip::patch_ip_len(&mut out, total);
    finalize_tcp_checksum(&mut out, l4);
    Some(out)
}

/// Verify a packet's TCP checksum; test helper for the builders.
#[cfg(test)]
pub fn tcp_checksum_ok(pkt: &[u8], l4: usize) -> bool {
    let Some(pseudo) = pseudo_sum(pkt, l4, PROTO_TCP) else {
        return false;
    };
    fold(sum16(&pkt[l4..], pseudo)) == 0xffff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::checksum;
    use crate::testutil::tcp_packet_v4;

    #[test]
    fn view_fields() {
        let pkt = tcp_packet_v4(b"payload", 0x1000, FLAG_ACK);
        let tcp = TcpView::new(&pkt, 20).unwrap();
        assert_eq!(tcp.dst_port(), 443);
        assert_eq!(tcp.seq(), 0x1000);
        assert!(!tcp.is_syn());
        assert_eq!(tcp.header_len(), 20);
    }

    #[test]
    fn window_override_round_trips_bitwise() {
        let pkt = tcp_packet_v4(b"some tls bytes", 7, FLAG_ACK);
        let orig_win = TcpView::new(&pkt, 20).unwrap().window();
        let mut work = pkt.clone();
        assert!(override_window(&mut work, 4096));
        assert_eq!(TcpView::new(&work, 20).unwrap().window(), 4096);
        assert!(tcp_checksum_ok(&work, 20));
        assert!(override_window(&mut work, orig_win));
        assert_eq!(work, pkt);
    }

    #[test]
    fn rebuild_clears_syn_and_sets_seq() {
        let pkt = tcp_packet_v4(b"hello", 100, FLAG_SYN | FLAG_ACK);
        let seg = rebuild_segment(&pkt, 20, b"he", 100).unwrap();
        let tcp = TcpView::new(&seg, 20).unwrap();
        assert!(!tcp.is_syn());
        assert_eq!(tcp.seq(), 100);
        assert_eq!(&seg[40..], b"he");
        assert!(tcp_checksum_ok(&seg, 20));
        assert_eq!(checksum(&seg[..20]), 0);
    }

    #[test]
    fn fresh_build_drops_options() {
        let pkt = tcp_packet_v4(b"abcdef", 55, FLAG_ACK);
        let seg = build_segment(&pkt, 20, b"cdef", 57, Some(2048)).unwrap();
        let tcp = TcpView::new(&seg, 20).unwrap();
        assert_eq!(tcp.header_len(), 20);
        assert_eq!(tcp.window(), 2048);
        assert_eq!(tcp.seq(), 57);
        assert!(tcp_checksum_ok(&seg, 20));
    }
}
