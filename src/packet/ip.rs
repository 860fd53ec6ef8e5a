//! IPv4/IPv6 header walking.
//!
//! The IPv6 walk handles the common extension-header chain: HopByHop,
//! Routing and DstOpts are `(hdr_ext_len + 1) * 8` bytes, Fragment is a
//! fixed 8, AH is `(payload_len + 2) * 4`; ESP and NoNext terminate the
//! chain because nothing meaningful can be parsed past them.

use super::{checksum, ip_version};

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const V6_HOP_BY_HOP: u8 = 0;
const V6_ROUTING: u8 = 43;
const V6_FRAGMENT: u8 = 44;
const V6_ESP: u8 = 50;
const V6_AH: u8 = 51;
const V6_NO_NEXT: u8 = 59;
const V6_DST_OPTS: u8 = 60;
const V6_HDR_LEN: usize = 40;

/// Walk the L3 headers of `pkt` and return `(l4_proto, l4_offset)`.
pub fn l4_offset(pkt: &[u8]) -> Option<(u8, usize)> {
    match ip_version(pkt) {
        4 => {
            if pkt.len() < 20 {
                return None;
            }
            let ihl = usize::from(pkt[0] & 0x0f) * 4;
            if ihl < 20 || pkt.len() < ihl {
                return None;
            }
            Some((pkt[9], ihl))
        }
        6 => {
            if pkt.len() < V6_HDR_LEN {
                return None;
            }
            let mut next = pkt[6];
            let mut off = V6_HDR_LEN;
            loop {
                match next {
                    V6_HOP_BY_HOP | V6_ROUTING | V6_DST_OPTS => {
                        if pkt.len() < off + 2 {
                            return None;
                        }
                        let len = (usize::from(pkt[off + 1]) + 1) * 8;
                        if pkt.len() < off + len {
                            return None;
                        }
                        next = pkt[off];
                        off += len;
                    }
                    V6_FRAGMENT => {
                        if pkt.len() < off + 8 {
                            return None;
                        }
                        next = pkt[off];
                        off += 8;
                    }
                    V6_AH => {
                        if pkt.len() < off + 2 {
                            return None;
                        }
                        let len = (usize::from(pkt[off + 1]) + 2) * 4;
                        if pkt.len() < off + len {
                            return None;
                        }
                        next = pkt[off];
                        off += len;
                    }
                    V6_ESP | V6_NO_NEXT => return None,
                    other => return Some((other, off)),
                }
            }
        }
        _ => None,
    }
}

/// Length of the IP header chain, i.e. where the L4 header begins.
pub fn ip_header_len(pkt: &[u8]) -> Option<usize> {
    l4_offset(pkt).map(|(_, off)| off)
}

/// End of the datagram as declared by the IP header, clamped to the slice.
/// GSO and short captures can leave `pkt` longer or shorter than the total
/// length field claims; never read past either bound.
pub fn declared_end(pkt: &[u8]) -> usize {
    match ip_version(pkt) {
        4 if pkt.len() >= 20 => {
            let tot = usize::from(u16::from_be_bytes([pkt[2], pkt[3]]));
            tot.min(pkt.len())
        }
        6 if pkt.len() >= V6_HDR_LEN => {
            let pl = usize::from(u16::from_be_bytes([pkt[4], pkt[5]]));
            (V6_HDR_LEN + pl).min(pkt.len())
        }
        _ => pkt.len(),
    }
}

/// TCP application payload inside a whole L3 packet, or `None` when the
/// packet does not carry well-formed TCP.
pub fn split_tcp(pkt: &[u8]) -> Option<&[u8]> {
    let (proto, l4) = l4_offset(pkt)?;
    if proto != PROTO_TCP {
        return None;
    }
    let end = declared_end(pkt);
    if end < l4 + 20 {
        return None;
    }
    let doff = usize::from(pkt[l4 + 12] >> 4) * 4;
    if doff < 20 || l4 + doff > end {
        return None;
    }
    Some(&pkt[l4 + doff..end])
}

/// UDP payload inside a whole L3 packet.
pub fn split_udp(pkt: &[u8]) -> Option<&[u8]> {
    let (proto, l4) = l4_offset(pkt)?;
    if proto != PROTO_UDP {
        return None;
    }
    let end = declared_end(pkt);
    if end < l4 + 8 {
        return None;
    }
    let udp_len = usize::from(u16::from_be_bytes([pkt[l4 + 4], pkt[l4 + 5]]));
    if udp_len < 8 {
        return None;
    }
    let data_end = (l4 + udp_len).min(end);
    Some(&pkt[l4 + 8..data_end])
}

/// Zero and recompute the IPv4 header checksum in place. `hdr` must be the
/// full header (IHL bytes).
pub fn finalize_ipv4_checksum(hdr: &mut [u8]) {
    hdr[10] = 0;
    hdr[11] = 0;
    let ck = checksum(hdr);
    hdr[10..12].copy_from_slice(&ck.to_be_bytes());
}

/// Patch the length field of the IP header for a packet of `total` bytes
/// and refresh the v4 header checksum.
pub fn patch_ip_len(pkt: &mut [u8], total: usize) {
    match ip_version(pkt) {
        4 => {
            pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
            let ihl = usize::from(pkt[0] & 0x0f) * 4;
            finalize_ipv4_checksum(&mut pkt[..ihl]);
        }
        6 => {
            // Payload length counts extension headers too.
            let pl = (total - V6_HDR_LEN) as u16;
            pkt[4..6].copy_from_slice(&pl.to_be_bytes());
        }
        _ => {}
    }
}

/// Set TTL (v4) or hop limit (v6) and refresh the v4 header checksum.
pub fn set_ttl(pkt: &mut [u8], ttl: u8) {
    match ip_version(pkt) {
        4 => {
            pkt[8] = ttl;
            let ihl = usize::from(pkt[0] & 0x0f) * 4;
            finalize_ipv4_checksum(&mut pkt[..ihl]);
        }
        6 => pkt[7] = ttl,
        _ => {}
    }
}

/// Source address of the packet, if parseable.
pub fn src_addr(pkt: &[u8]) -> Option<std::net::IpAddr> {
    match ip_version(pkt) {
        4 if pkt.len() >= 20 => {
            let o: [u8; 4] = pkt[12..16].try_into().ok()?;
            Some(std::net::IpAddr::from(o))
        }
        6 if pkt.len() >= 40 => {
            let o: [u8; 16] = pkt[8..24].try_into().ok()?;
            Some(std::net::IpAddr::from(o))
        }
        _ => None,
    }
}

/// Destination address of the packet, if parseable.
pub fn dst_addr(pkt: &[u8]) -> Option<std::net::IpAddr> {
    match ip_version(pkt) {
        4 if pkt.len() >= 20 => {
            let o: [u8; 4] = pkt[16..20].try_into().ok()?;
            Some(std::net::IpAddr::from(o))
        }
        6 if pkt.len() >= 40 => {
            let o: [u8; 16] = pkt[24..40].try_into().ok()?;
            Some(std::net::IpAddr::from(o))
        }
        _ => None,
    }
}

/// RFC1918 (v4) / ULA fc00::/7 (v6) source test. Decoy processing is gated
/// on this so remote traffic on a misconfigured box cannot drive injection.
pub fn src_is_lan(pkt: &[u8]) -> bool {
    match ip_version(pkt) {
        4 if pkt.len() >= 20 => {
            let b = &pkt[12..16];
            b[0] == 10 || (b[0] == 192 && b[1] == 168) || (b[0] == 172 && b[1] & 0xf0 == 16)
        }
        6 if pkt.len() >= 40 => pkt[8] & 0xfe == 0xfc,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::checksum;

    fn v4_tcp_packet(payload: &[u8]) -> Vec<u8> {
        let total = 20 + 20 + payload.len();
        let mut pkt = vec![0u8; total];
        pkt[0] = 0x45;
        pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        pkt[8] = 64;
        pkt[9] = PROTO_TCP;
        pkt[12..16].copy_from_slice(&[192, 168, 1, 2]);
        pkt[16..20].copy_from_slice(&[93, 184, 216, 34]);
        pkt[32] = 5 << 4; // data offset
        pkt[40..].copy_from_slice(payload);
        finalize_ipv4_checksum(&mut pkt[..20]);
        pkt
    }

    #[test]
    fn split_tcp_v4() {
        let pkt = v4_tcp_packet(b"hello tls");
        assert_eq!(split_tcp(&pkt).unwrap(), b"hello tls");
    }

    #[test]
    fn split_tcp_honors_total_length() {
        // Padded capture: total length says 9-byte payload, slice has junk after.
        let mut pkt = v4_tcp_packet(b"hello tls");
        pkt.extend_from_slice(&[0xaa; 16]);
        assert_eq!(split_tcp(&pkt).unwrap(), b"hello tls");
    }

    #[test]
    fn split_tcp_v6_with_ext_headers() {
        // IPv6 + HopByHop(8) + Fragment(8) + TCP(20) + payload
        let payload = b"quic?no";
        let mut pkt = vec![0u8; 40 + 8 + 8 + 20 + payload.len()];
        pkt[0] = 0x60;
        let pl = (8 + 8 + 20 + payload.len()) as u16;
        pkt[4..6].copy_from_slice(&pl.to_be_bytes());
        pkt[6] = V6_HOP_BY_HOP;
        pkt[40] = V6_FRAGMENT; // next header after hop-by-hop
        pkt[41] = 0; // (0+1)*8 = 8 bytes
        pkt[48] = PROTO_TCP; // next header after fragment
        pkt[56 + 12] = 5 << 4;
        let off = 40 + 8 + 8 + 20;
        pkt[off..].copy_from_slice(payload);
        assert_eq!(split_tcp(&pkt).unwrap(), payload.as_slice());
    }

    #[test]
    fn esp_terminates_walk() {
        let mut pkt = vec![0u8; 60];
        pkt[0] = 0x60;
        pkt[4..6].copy_from_slice(&20u16.to_be_bytes());
        pkt[6] = V6_ESP;
        assert!(l4_offset(&pkt).is_none());
    }

    #[test]
    fn too_short_is_none() {
        assert!(split_tcp(&[0x45, 0x00]).is_none());
        assert!(split_udp(&[]).is_none());
        assert!(l4_offset(&[0x60; 39]).is_none());
    }

    #[test]
    fn ipv4_checksum_valid_after_finalize() {
        let pkt = v4_tcp_packet(b"x");
        assert_eq!(checksum(&pkt[..20]), 0);
    }

    #[test]
    fn lan_detection() {
        let pkt = v4_tcp_packet(b"x");
        assert!(src_is_lan(&pkt));
        let mut public = pkt.clone();
        public[12..16].copy_from_slice(&[8, 8, 8, 8]);
        assert!(!src_is_lan(&public));
    }
}
