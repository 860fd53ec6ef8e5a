//! The TCP mangling pipeline.
//!
//! Reassemble the front of the flow until a ClientHello shows its SNI, pick
//! split points, then replace the original segment with a burst: first real
//! half, optional decoy ClientHello, the fake storm, second real half. The
//! kernel never delivers the original — it gets a Drop verdict and the raw
//! socket carries our version instead.
//!
//! The fast-path filter order matters: dport filter, SYN handling, TLS
//! switch, then payload work. SYN decoys must fire before the TLS switch or
//! `--synfake` would be dead on sections with TLS disabled.

use std::time::Instant;

use tracing::{debug, trace};

use crate::config::{FragStrategy, Section, SniDetection};
use crate::flow::FlowKey;
use crate::inject::PacketSender;
use crate::packet::ip;
use crate::packet::tcp::{self as tcph, TcpView};
use crate::tls;

use super::{fake, frag, Mangler, Verdict};

const TLS_PORT: u16 = 443;

pub(super) fn process(m: &Mangler, sec: &Section, pkt: &[u8], l4: usize) -> Verdict {
    let Some(tcp) = TcpView::new(pkt, l4) else {
        return Verdict::Accept;
    };
    if sec.dport_filter && tcp.dst_port() != TLS_PORT {
        return Verdict::Accept;
    }
    let Some(key) = FlowKey::from_packet(pkt, tcp.src_port(), tcp.dst_port()) else {
        return Verdict::Accept;
    };

    if tcp.is_syn() {
        if sec.syn_fake {
            return send_syn_fake(m, sec, pkt, l4, &key);
        }
        return Verdict::Continue;
    }
    if !sec.tls_enabled {
        return Verdict::Continue;
    }

    let Some(payload) = ip::split_tcp(pkt) else {
        return Verdict::Continue;
    };
    if payload.is_empty() {
        return Verdict::Continue;
    }

    let now = Instant::now();
    if m.done.is_done(&key, now) {
        return Verdict::Continue;
    }

    let (prefix, base_seq) = m.tcp_flows.insert(&key, tcp.seq(), payload);
    let delta = tcp.seq().wrapping_sub(base_seq) as i32;
    if delta < 0 {
        return Verdict::Continue;
    }
    let pkt_start = delta as usize;
    let pkt_end = pkt_start + payload.len();

    let candidates = match discover_sni(sec, &prefix) {
        Discovery::Host { host, off } => {
            if off < pkt_start || off + host.len() > pkt_end {
                trace!(host = %String::from_utf8_lossy(&host), "SNI not in this segment yet");
                return Verdict::Continue;
            }
            if sec.sni_detection == SniDetection::Parse
                && !sec.matcher.matches(&String::from_utf8_lossy(&host))
            {
                return Verdict::Continue;
            }
            debug!(host = %String::from_utf8_lossy(&host), "SNI hit");
            split_candidates(sec, off - pkt_start, host.len())
        }
        Discovery::Midpoint => vec![payload.len() / 2],
        Discovery::None => {
            // The hostname is not visible yet. Split blindly one byte in if
            // a ClientHello start is in this segment's window, or on the
            // very first data segment of the flow.
            let win_start = pkt_start.min(prefix.len());
            let win_end = pkt_end.min(prefix.len());
            let hello_here = tls::find_hello_start(&prefix[win_start..win_end]).is_some();
            if hello_here || pkt_start == 0 {
                vec![1]
            } else {
                return Verdict::Continue;
            }
        }
    };

    // The splitters read the window from the header, so the fk_winsize
    // rewrite happens once, up front, via the incremental checksum.
    let mut work = pkt.to_vec();
    if sec.fk_winsize > 0 {
        tcph::override_window(&mut work, sec.fk_winsize);
    }

    for split in candidates {
        if emit_split(m, sec, &work, l4, payload.len(), split, tcp.seq()) {
            m.done.mark(&key, now);
            m.tcp_flows.remove(&key);
            return Verdict::Drop;
        }
    }
    Verdict::Continue
}

enum Discovery {
    /// Hostname bytes and their offset inside the reassembled prefix.
    Host { host: Vec<u8>, off: usize },
    /// Brute all-domains mode: split the payload in the middle.
    Midpoint,
    None,
}

fn discover_sni(sec: &Section, prefix: &[u8]) -> Discovery {
    match sec.sni_detection {
        SniDetection::Parse => match tls::extract_sni(prefix) {
            Ok(host) if !host.is_empty() => {
                let off = find_subslice(prefix, &host).unwrap_or(1);
                Discovery::Host { host, off }
            }
            _ => {
                // The record may be malformed or incomplete while the
                // hostname bytes are already on the wire; a substring hit
                // on the include list is good enough to start splitting.
                match crate::config::domains::brute_find(prefix, sec.matcher.include_list()) {
                    Some((dom, off)) => Discovery::Host {
                        host: dom.into_bytes(),
                        off,
                    },
                    None => Discovery::None,
                }
            }
        },
        SniDetection::Brute => {
            if sec.matcher.all_domains() {
                return Discovery::Midpoint;
            }
            match crate::config::domains::brute_find(prefix, sec.matcher.include_list()) {
                Some((dom, off)) => Discovery::Host {
                    host: dom.into_bytes(),
                    off,
                },
                None => Discovery::None,
            }
        }
    }
}

fn find_subslice(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || hay.len() < needle.len() {
        return None;
    }
    hay.windows(needle.len()).position(|w| w == needle)
}

/// Split offsets to try, in order, relative to this packet's payload.
/// `base_in_pkt` is where the hostname starts.
fn split_candidates(sec: &Section, base_in_pkt: usize, sni_len: usize) -> Vec<usize> {
    let mut cands = Vec::with_capacity(2);
    if sec.frag_sni_pos > 0 && (sec.frag_sni_pos as usize) < sni_len {
        cands.push(base_in_pkt + sec.frag_sni_pos as usize);
    }
    if sec.frag_middle_sni {
        cands.push(base_in_pkt + (sni_len + 1) / 2);
    }
    if cands.is_empty() {
        cands.push(base_in_pkt);
    }
    let mut out = Vec::with_capacity(cands.len());
    for c in cands {
        if !out.contains(&c) {
            out.push(c);
        }
    }
    out
}

/// Build and emit one split attempt. `true` means the burst went out and
/// the original packet must be dropped.
fn emit_split(
    m: &Mangler,
    sec: &Section,
    work: &[u8],
    l4: usize,
    payload_len: usize,
    split: usize,
    seq: u32,
) -> bool {
    let halves = match sec.frag_strategy {
        FragStrategy::Ip if crate::packet::ip_version(work) == 4 => {
            let Some(tcp) = TcpView::new(work, l4) else {
                return false;
            };
            // Fragment offsets count 8-byte words of IP payload; round the
            // cut up so the boundary is legal.
            let mut cut = tcp.header_len() + split;
            if cut % 8 != 0 {
                cut += 8 - cut % 8;
            }
            frag::ip4_fragment(work, cut)
        }
        FragStrategy::Ip | FragStrategy::Tcp => frag::tcp_split(work, l4, split),
        FragStrategy::None => frag::tcp_split_fresh(work, l4, split, None),
    };
    let Some((mut first, mut second)) = halves else {
        return false;
    };
    if sec.frag_sni_reverse {
        std::mem::swap(&mut first, &mut second);
    }

    if let Err(e) = m.sender.send(&first) {
        debug!("first segment send failed: {e}");
    }

    if sec.fake_sni {
        let payload = sec.fake_payload(payload_len);
        if let Some(decoy) = tcph::build_segment(work, l4, &payload, seq, None) {
            if let Err(e) = m.sender.send(&decoy) {
                debug!("decoy clienthello send failed: {e}");
            }
        }
    }

    let seq_override = (sec.frag_sni_faked || sec.frag_two_stage).then_some(split as u32);
    fake::send_tcp_burst(m.sender.as_ref(), sec, work, l4, seq, seq_override, payload_len);

    // The asymmetric delay rule: the late half is delayed only when the
    // first-sent half actually carried bytes, XOR'd with reverse order.
    let delayed = sec.seg2delay_ms > 0 && ((split > 0) != sec.frag_sni_reverse);
    if delayed {
        m.sender.send_delayed(second, sec.seg2delay_ms);
    } else if let Err(e) = m.sender.send(&second) {
        debug!("second segment send failed: {e}");
    }
    true
}

/// SYN decoy: a SYN-shaped packet carrying the front of a fake ClientHello,
/// so stateful DPI books the flow as already-handshaken garbage.
fn send_syn_fake(m: &Mangler, sec: &Section, pkt: &[u8], l4: usize, key: &FlowKey) -> Verdict {
    let Some(tcp) = TcpView::new(pkt, l4) else {
        return Verdict::Accept;
    };
    let mut payload = sec.fake_sni_pkt.clone();
    let cap = sec.syn_fake_len as usize;
    if cap > 0 && cap < payload.len() {
        payload.truncate(cap);
    }

    let hdr_end = l4 + tcp.header_len();
    let mut out = Vec::with_capacity(hdr_end + payload.len());
    out.extend_from_slice(&pkt[..hdr_end]);
    out.extend_from_slice(&payload);
    if sec.fk_winsize > 0 {
        out[l4 + 14..l4 + 16].copy_from_slice(&sec.fk_winsize.to_be_bytes());
    }
    let total = out.len();
    ip::patch_ip_len(&mut out, total);
    tcph::finalize_tcp_checksum(&mut out, l4);

    if m.sender.send(&out).is_err() {
        return Verdict::Accept;
    }
    m.done.mark(key, Instant::now());
    m.tcp_flows.remove(key);
    Verdict::Drop
}
