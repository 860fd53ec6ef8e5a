//! Splitting one outbound datagram into two.
//!
//! Three flavours, one per `frag` strategy: [`tcp_split`] reuses the
//! original header bytes, [`tcp_split_fresh`] serializes new 20-byte TCP
//! headers, [`ip4_fragment`] cuts the IP payload on an 8-byte boundary and
//! lets the destination host reassemble.

use crate::packet::ip::{self, finalize_ipv4_checksum};
use crate::packet::tcp::{build_segment, rebuild_segment, TcpView};

const IP_FLAG_MF: u16 = 0x2000;
const IP_FRAG_OFF_MASK: u16 = 0x1fff;

/// Split the TCP payload at `split` (payload-relative), carrying the
/// original header bytes into both segments.
pub fn tcp_split(pkt: &[u8], l4: usize, split: usize) -> Option<(Vec<u8>, Vec<u8>)> {
    let payload = ip::split_tcp(pkt)?;
    if split == 0 || split >= payload.len() {
        return None;
    }
    let seq = TcpView::new(pkt, l4)?.seq();
    let first = rebuild_segment(pkt, l4, &payload[..split], seq)?;
    let second = rebuild_segment(pkt, l4, &payload[split..], seq.wrapping_add(split as u32))?;
    Some((first, second))
}

/// Split like [`tcp_split`] but serialize fresh headers (options dropped,
/// optional window override applied to both halves).
pub fn tcp_split_fresh(
    pkt: &[u8],
    l4: usize,
    split: usize,
    window: Option<u16>,
) -> Option<(Vec<u8>, Vec<u8>)> {
    let payload = ip::split_tcp(pkt)?;
    if split >= payload.len() {
        return None;
    }
    let seq = TcpView::new(pkt, l4)?.seq();
    let first = build_segment(pkt, l4, &payload[..split], seq, window)?;
    let second = build_segment(
        pkt,
        l4,
        &payload[split..],
        seq.wrapping_add(split as u32),
        window,
    )?;
    Some((first, second))
}

/// Cut an IPv4 datagram into two fragments at `cut` bytes into the IP
/// payload. The caller aligns `cut`; off-boundary cuts are rejected because
/// the fragment-offset field counts 8-byte words.
pub fn ip4_fragment(pkt: &[u8], cut: usize) -> Option<(Vec<u8>, Vec<u8>)> {
    if crate::packet::ip_version(pkt) != 4 {
        return None;
    }
    let hdr_len = ip::ip_header_len(pkt)?;
    let end = ip::declared_end(pkt);
    let payload = &pkt[hdr_len..end];
    if cut == 0 || cut >= payload.len() || cut % 8 != 0 {
        return None;
    }

    let build = |body: &[u8], more: bool, off_words: u16| {
        let mut out = Vec::with_capacity(hdr_len + body.len());
        out.extend_from_slice(&pkt[..hdr_len]);
        out.extend_from_slice(body);
        out[2..4].copy_from_slice(&((hdr_len + body.len()) as u16).to_be_bytes());
        let mut fo = off_words & IP_FRAG_OFF_MASK;
        if more {
            fo |= IP_FLAG_MF;
        }
        out[6..8].copy_from_slice(&fo.to_be_bytes());
        finalize_ipv4_checksum(&mut out[..hdr_len]);
        out
    };

    let first = build(&payload[..cut], true, 0);
    let second = build(&payload[cut..], false, (cut / 8) as u16);
    Some((first, second))
}
