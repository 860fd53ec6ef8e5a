//! The UDP/QUIC mangling path.
//!
//! QUIC carries the same ClientHello inside encrypted Initials, so the gate
//! either drops 443/UDP wholesale (`all`), or decrypts and reassembles the
//! CRYPTO stream to make a per-domain decision (`parsed`). Decoy processing
//! is restricted to LAN-sourced packets so a misconfigured box cannot be
//! used to amplify remote traffic.

use tracing::{debug, trace};

use crate::config::{Section, SniDetection, UdpFilterQuic, UdpMode};
use crate::packet::ip;
use crate::packet::udp::UdpView;
use crate::quic::{self, decrypt::decrypt_initial};
use crate::tls;

use super::{fake, Mangler, Verdict};

const QUIC_PORT: u16 = 443;

/// Outcome of the `parsed`-mode SNI extraction.
#[derive(Debug, PartialEq, Eq)]
enum QuicMatch {
    /// SNI resolved and the section wants this domain.
    Matched,
    /// SNI resolved to a domain the section does not care about.
    NoMatch,
    /// Not QUIC, not decryptable, or the hello is still incomplete.
    Unresolved,
}

pub(super) fn process(m: &Mangler, sec: &Section, pkt: &[u8], l4: usize) -> Verdict {
    let Some(udp) = UdpView::new(pkt, l4) else {
        return Verdict::Accept;
    };
    if !ip::src_is_lan(pkt) {
        return Verdict::Continue;
    }
    let Some(payload) = ip::split_udp(pkt) else {
        return Verdict::Continue;
    };
    if payload.is_empty() {
        return Verdict::Continue;
    }

    let dport_ok = !(sec.dport_filter && udp.dst_port() != QUIC_PORT);

    let mut hit = false;
    if dport_ok {
        match sec.udp_filter_quic {
            UdpFilterQuic::Disabled => {}
            UdpFilterQuic::All => {
                if sec.udp_mode == UdpMode::Drop {
                    debug!(dport = udp.dst_port(), "QUIC drop (all mode)");
                    return Verdict::Drop;
                }
                hit = true;
            }
            UdpFilterQuic::Parsed => match quic_sni_match(m, sec, payload) {
                QuicMatch::Matched => {
                    if sec.udp_mode == UdpMode::Drop {
                        return Verdict::Drop;
                    }
                    hit = true;
                }
                QuicMatch::NoMatch => {}
                QuicMatch::Unresolved => {
                    // Can't tell what this is. In drop mode ambiguity loses.
                    if sec.udp_mode == UdpMode::Drop {
                        trace!(dport = udp.dst_port(), "QUIC ambiguous, drop");
                        return Verdict::Drop;
                    }
                }
            },
        }
    }

    if !hit && !sec.udp_dport_ranges.is_empty() {
        let dport = udp.dst_port();
        hit = sec
            .udp_dport_ranges
            .iter()
            .any(|&(lo, hi)| (lo..=hi).contains(&dport));
    }
    if !hit {
        return Verdict::Continue;
    }

    match sec.udp_mode {
        UdpMode::Drop => Verdict::Drop,
        UdpMode::Fake => {
            fake::send_udp_burst(m.sender.as_ref(), sec, pkt, l4);
            // Re-send the original ourselves; the queued copy is dropped so
            // the kernel does not deliver it twice.
            if let Err(e) = m.sender.send(pkt) {
                debug!("original udp re-send failed: {e}");
            }
            Verdict::Drop
        }
    }
}

fn quic_sni_match(m: &Mangler, sec: &Section, payload: &[u8]) -> QuicMatch {
    if !quic::is_initial(payload) {
        return QuicMatch::Unresolved;
    }
    let Some(dcid) = quic::dcid(payload) else {
        return QuicMatch::Unresolved;
    };
    let Some(plain) = decrypt_initial(dcid, payload) else {
        trace!("QUIC initial did not decrypt");
        return QuicMatch::Unresolved;
    };
    let Some(crypto) = m.quic_flows.assemble(dcid, &plain) else {
        return QuicMatch::Unresolved;
    };

    match sec.sni_detection {
        SniDetection::Parse => match tls::extract_sni_from_handshake(&crypto) {
            Ok(host) => {
                m.quic_flows.remove(dcid);
                let host = String::from_utf8_lossy(&host).into_owned();
                debug!(%host, "QUIC SNI");
                if sec.matcher.matches(&host) {
                    QuicMatch::Matched
                } else {
                    QuicMatch::NoMatch
                }
            }
            Err(_) => QuicMatch::Unresolved,
        },
        SniDetection::Brute => {
            if sec.matcher.all_domains() {
                m.quic_flows.remove(dcid);
                return QuicMatch::Matched;
            }
            match crate::config::domains::brute_find(&crypto, sec.matcher.include_list()) {
                Some((dom, _)) => {
                    m.quic_flows.remove(dcid);
                    debug!(host = %dom, "QUIC SNI (brute)");
                    QuicMatch::Matched
                }
                None => QuicMatch::Unresolved,
            }
        }
    }
}
