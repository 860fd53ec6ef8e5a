//! Packet mangling: the per-section pipeline behind every queue verdict.

pub mod fake;
pub mod frag;
pub mod tcp;
pub mod udp;

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::flow::{FlowDone, TcpAssembler};
use crate::inject::PacketSender;
use crate::packet::ip::{self, PROTO_TCP, PROTO_UDP};
use crate::quic::assemble::CryptoAssembler;

/// What to do with one queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Pass it on; no section wants it anymore.
    Accept,
    /// We replaced it (or policy kills it); the kernel must not deliver it.
    Drop,
    /// This section has no opinion; try the next one.
    Continue,
}

/// Shared mangling state: the section list, the flow tables and the
/// injection capability. One instance serves every worker thread.
pub struct Mangler {
    cfg: Arc<Config>,
    pub(crate) tcp_flows: TcpAssembler,
    pub(crate) quic_flows: CryptoAssembler,
    pub(crate) done: FlowDone,
    pub(crate) sender: Arc<dyn PacketSender>,
}

impl Mangler {
    pub fn new(cfg: Arc<Config>, sender: Arc<dyn PacketSender>) -> Self {
        Self {
            cfg,
            tcp_flows: TcpAssembler::new(),
            quic_flows: CryptoAssembler::new(),
            done: FlowDone::new(),
            sender,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Run the packet through each section in order. The first section with
    /// an opinion wins; `Continue` means nobody cared.
    pub fn process_packet(&self, pkt: &[u8]) -> Verdict {
        let Some((proto, l4)) = ip::l4_offset(pkt) else {
            return Verdict::Accept;
        };
        for sec in &self.cfg.sections {
            let verdict = match proto {
                PROTO_TCP => tcp::process(self, sec, pkt, l4),
                PROTO_UDP => udp::process(self, sec, pkt, l4),
                _ => Verdict::Continue,
            };
            if verdict != Verdict::Continue {
                return verdict;
            }
        }
        Verdict::Continue
    }

    /// Reclaim idle flow state; driven by the binary's 2-minute ticker and
    /// called directly (with a synthetic `now`) from tests.
    pub fn gc(&self, now: Instant) {
        self.tcp_flows.gc(now);
        self.quic_flows.gc(now);
        self.done.gc(now);
    }
}
