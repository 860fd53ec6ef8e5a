//! UDP header view and datagram builder.

use super::ip::{self, PROTO_UDP};
use super::{fold, pseudo_sum, sum16};

/// Borrowed view of the UDP header at `l4` inside a whole L3 packet.
#[derive(Clone, Copy)]
pub struct UdpView<'a> {
    pkt: &'a [u8],
    l4: usize,
}

impl<'a> UdpView<'a> {
    pub fn new(pkt: &'a [u8], l4: usize) -> Option<Self> {
        if pkt.len() < l4 + 8 {
            return None;
        }
        Some(Self { pkt, l4 })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.pkt[self.l4], self.pkt[self.l4 + 1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.pkt[self.l4 + 2], self.pkt[self.l4 + 3]])
    }
}

/// Recompute the UDP checksum of the packet in place.
pub fn finalize_udp_checksum(pkt: &mut [u8], l4: usize) {
    pkt[l4 + 6] = 0;
    pkt[l4 + 7] = 0;
    let Some(pseudo) = pseudo_sum(pkt, l4, PROTO_UDP) else {
        return;
    };
    let mut ck = !fold(sum16(&pkt[l4..], pseudo));
    if ck == 0 {
        ck = 0xffff; // transmitted zero means "no checksum"
    }
    pkt[l4 + 6..l4 + 8].copy_from_slice(&ck.to_be_bytes());
}

/// Build a UDP datagram reusing the template's IP header and ports, with the
/// given payload and a valid checksum.
pub fn build_datagram(pkt: &[u8], l4: usize, payload: &[u8]) -> Option<Vec<u8>> {
    let udp = UdpView::new(pkt, l4)?;
    let mut out = Vec::with_capacity(l4 + 8 + payload.len());
    out.extend_from_slice(&pkt[..l4]);
    out.extend_from_slice(&udp.src_port().to_be_bytes());
    out.extend_from_slice(&udp.dst_port().to_be_bytes());
    out.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(payload);
    let total = out.len();
    ip::patch_ip_len(&mut out, total);
    finalize_udp_checksum(&mut out, l4);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ip::PROTO_UDP;
    use crate::testutil::udp_packet_v4;

    #[test]
    fn view_ports() {
        let pkt = udp_packet_v4(b"\x00", 443);
        let udp = UdpView::new(&pkt, 20).unwrap();
        assert_eq!(udp.dst_port(), 443);
    }

    #[test]
    fn built_datagram_checksum_verifies() {
        let tpl = udp_packet_v4(b"orig", 443);
        let out = build_datagram(&tpl, 20, &[0u8; 64]).unwrap();
        assert_eq!(out.len(), 20 + 8 + 64);
        let pseudo = pseudo_sum(&out, 20, PROTO_UDP).unwrap();
        assert_eq!(fold(sum16(&out[20..], pseudo)), 0xffff);
        assert_eq!(
            u16::from_be_bytes([out[24], out[25]]),
            (8 + 64) as u16
        );
    }
}
