//! Decoy packet construction.
//!
//! Each strategy describes one way to make a forged packet convincing to a
//! middlebox yet harmless to the real endpoint: a sequence number the server
//! will discard, a TTL that dies before the server, a checksum the server
//! will reject, or an MD5 option the server will strip. The burst emits
//! `strategies.len() * fake_sni_seq_len` packets.

use rand::Rng;
use tracing::trace;

use crate::config::Section;
use crate::inject::PacketSender;
use crate::packet::ip::{self, set_ttl};
use crate::packet::tcp::{finalize_tcp_checksum, TcpView, FLAG_SYN};
use crate::packet::udp::build_datagram;

/// One way of poisoning a decoy TCP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeStrategy {
    /// Sequence number drawn from `base + U[0..=max_off]`.
    RandSeq { max_off: u32 },
    /// Sequence number `base - off`, already acknowledged territory.
    PastSeq { off: u32 },
    /// IP TTL / hop limit low enough to die between the DPI and the server.
    Ttl(u8),
    /// Deliberately invalid TCP checksum (urgent pointer nudged after the
    /// checksum is computed).
    BadTcpChecksum,
    /// TCP MD5-Signature option (kind 19) the receiver will not accept.
    Md5Option,
}

/// UDP decoy perturbations; applied cumulatively to every fake datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpFakeStrategy {
    Ttl(u8),
    BadChecksum,
}

/// MD5-Signature option (kind=19, len=18, 16 zero bytes) plus two NOPs to
/// pad to a 4-byte boundary.
const MD5_OPTION: [u8; 20] = [
    19, 18, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1,
];

/// Forge one decoy TCP packet from the original's headers.
///
/// `seq_override` replaces the strategy's own offset when the caller wants
/// decoys straddling the real split point (`frag_sni_faked`,
/// `frag_two_stage`).
pub fn build_tcp_fake(
    pkt: &[u8],
    l4: usize,
    payload: &[u8],
    base_seq: u32,
    strategy: FakeStrategy,
    seq_override: Option<u32>,
) -> Option<Vec<u8>> {
    let tcp = TcpView::new(pkt, l4)?;

    let seq = match strategy {
        FakeStrategy::RandSeq { max_off } => {
            let off = seq_override.unwrap_or(max_off);
            base_seq.wrapping_add(rand::thread_rng().gen_range(0..=off))
        }
        FakeStrategy::PastSeq { off } => base_seq.wrapping_sub(seq_override.unwrap_or(off)),
        _ => base_seq,
    };

    let options: &[u8] = match strategy {
        FakeStrategy::Md5Option => &MD5_OPTION,
        _ => &[],
    };

    let mut out = Vec::with_capacity(l4 + 20 + options.len() + payload.len());
    out.extend_from_slice(&pkt[..l4]);
    out.extend_from_slice(&tcp.src_port().to_be_bytes());
    out.extend_from_slice(&tcp.dst_port().to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&tcp.ack().to_be_bytes());
    out.push((((20 + options.len()) / 4) as u8) << 4);
    out.push(tcp.flags() & !FLAG_SYN);
    out.extend_from_slice(&tcp.window().to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]); // checksum + urgent
    out.extend_from_slice(options);
    out.extend_from_slice(payload);

    let total = out.len();
    ip::patch_ip_len(&mut out, total);
    if let FakeStrategy::Ttl(ttl) = strategy {
        set_ttl(&mut out, ttl);
    }
    finalize_tcp_checksum(&mut out, l4);
    if strategy == FakeStrategy::BadTcpChecksum {
        let urg = u16::from_be_bytes([out[l4 + 18], out[l4 + 19]]).wrapping_add(1);
        out[l4 + 18..l4 + 20].copy_from_slice(&urg.to_be_bytes());
    }
    Some(out)
}

/// The decoy storm between the two real halves of a split ClientHello.
///
/// For strategies that keep the base sequence, `seq` advances by the payload
/// length between packets so consecutive decoys cover a plausible range.
pub fn send_tcp_burst(
    sender: &dyn PacketSender,
    sec: &Section,
    pkt: &[u8],
    l4: usize,
    base_seq: u32,
    seq_override: Option<u32>,
    source_len: usize,
) {
    if sec.fake_sni_seq_len == 0 {
        return;
    }
    let mut seq = base_seq;
    for &strategy in &sec.faking {
        for _ in 0..sec.fake_sni_seq_len {
            let payload = sec.fake_payload(source_len);
            if payload.is_empty() {
                continue;
            }
            if let Some(raw) = build_tcp_fake(pkt, l4, &payload, seq, strategy, seq_override) {
                if let Err(e) = sender.send(&raw) {
                    trace!("fake send failed: {e}");
                }
            }
            if !matches!(
                strategy,
                FakeStrategy::RandSeq { .. } | FakeStrategy::PastSeq { .. }
            ) {
                seq = seq.wrapping_add(payload.len() as u32);
            }
        }
    }
}

/// Forge one decoy UDP datagram: `udp_fake_len` zero bytes, perturbed per
/// the section's UDP strategies.
pub fn build_udp_fake(sec: &Section, pkt: &[u8], l4: usize) -> Option<Vec<u8>> {
    // keep the forged datagram within a plain MTU
    let body = vec![0u8; sec.udp_fake_len.min(1400) as usize];
    let mut out = build_datagram(pkt, l4, &body)?;
    for &strategy in &sec.udp_faking {
        match strategy {
            UdpFakeStrategy::Ttl(ttl) => set_ttl(&mut out, ttl),
            UdpFakeStrategy::BadChecksum => {
                let ck = u16::from_be_bytes([out[l4 + 6], out[l4 + 7]]).wrapping_add(1);
                out[l4 + 6..l4 + 8].copy_from_slice(&ck.to_be_bytes());
            }
        }
    }
    Some(out)
}

/// `udp_fake_seq_len` decoys ahead of the re-sent original.
pub fn send_udp_burst(sender: &dyn PacketSender, sec: &Section, pkt: &[u8], l4: usize) {
    for _ in 0..sec.udp_fake_seq_len {
        if let Some(raw) = build_udp_fake(sec, pkt, l4) {
            if let Err(e) = sender.send(&raw) {
                trace!("fake udp send failed: {e}");
            }
        }
    }
}
