//! Queue workers: consume packets from the kernel queue, run the mangler,
//! return exactly one verdict per packet id.
//!
//! The kernel queue is consumed through the [`PacketSource`]/[`VerdictSink`]
//! pair so tests can drive a worker with in-memory queues; production uses
//! the netlink-backed [`netlink::NfQueue`].

pub mod conntrack;
pub mod netlink;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, trace};

use crate::config::Config;
use crate::mangle::{Mangler, Verdict};

/// One packet handed up by the kernel.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub id: u32,
    pub payload: Vec<u8>,
    pub mark: Option<u32>,
    pub conntrack: Option<Vec<u8>>,
}

/// What goes back down for a packet id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelVerdict {
    Accept,
    Drop,
    /// Accept and set the packet mark, suppressing the forged loopback.
    AcceptWithMark(u32),
}

pub trait PacketSource {
    /// Next packet; `Ok(None)` on a (timeout) tick with nothing to do.
    fn recv(&mut self) -> io::Result<Option<PacketRecord>>;
}

pub trait VerdictSink {
    fn verdict(&mut self, id: u32, verdict: KernelVerdict) -> io::Result<()>;
}

/// Per-packet policy around the mangler: loop avoidance, empty payloads,
/// the conntrack early-flow threshold, then the section pipeline.
pub fn decide(cfg: &Config, mangler: &Mangler, rec: &PacketRecord) -> KernelVerdict {
    if let Some(mark) = rec.mark {
        if mark & cfg.mark == cfg.mark {
            // Our own injected packet echoed back through the hook.
            return KernelVerdict::AcceptWithMark(cfg.mark);
        }
    }
    if rec.payload.is_empty() {
        return KernelVerdict::AcceptWithMark(cfg.mark);
    }
    if cfg.connbytes_limit > 0 {
        if let Some(ct) = &rec.conntrack {
            if let Some(pkts) = conntrack::orig_packets(ct) {
                if pkts > u64::from(cfg.connbytes_limit) {
                    return KernelVerdict::AcceptWithMark(cfg.mark);
                }
            }
        }
    }
    match mangler.process_packet(&rec.payload) {
        Verdict::Drop => KernelVerdict::Drop,
        Verdict::Accept | Verdict::Continue => KernelVerdict::AcceptWithMark(cfg.mark),
    }
}

/// Drive one queue until shutdown. Every received packet gets exactly one
/// verdict, including on mangler surprises — forgetting a verdict wedges the
/// kernel queue.
pub fn run_worker<Q>(queue: &mut Q, cfg: &Config, mangler: &Mangler, shutdown: &AtomicBool)
where
    Q: PacketSource + VerdictSink,
{
    while !shutdown.load(Ordering::Relaxed) {
        let rec = match queue.recv() {
            Ok(Some(rec)) => rec,
            Ok(None) => continue,
            Err(e) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                error!("queue recv: {e}");
                continue;
            }
        };
        let verdict = decide(cfg, mangler, &rec);
        trace!(id = rec.id, ?verdict, "verdict");
        if let Err(e) = queue.verdict(rec.id, verdict) {
            error!(id = rec.id, "verdict send: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{tcp_packet_v4, RecordingSender};
    use std::collections::VecDeque;
    use std::sync::Arc;

    struct MemQueue {
        inbox: VecDeque<PacketRecord>,
        verdicts: Vec<(u32, KernelVerdict)>,
    }

    impl MemQueue {
        fn new(records: Vec<PacketRecord>) -> Self {
            Self {
                inbox: records.into(),
                verdicts: Vec::new(),
            }
        }
    }

    impl PacketSource for MemQueue {
        fn recv(&mut self) -> io::Result<Option<PacketRecord>> {
            match self.inbox.pop_front() {
                Some(rec) => Ok(Some(rec)),
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "drained")),
            }
        }
    }

    impl VerdictSink for MemQueue {
        fn verdict(&mut self, id: u32, verdict: KernelVerdict) -> io::Result<()> {
            self.verdicts.push((id, verdict));
            Ok(())
        }
    }

    fn setup() -> (Arc<Config>, Mangler, Arc<RecordingSender>) {
        let cfg = Arc::new(Config::default());
        let sender = Arc::new(RecordingSender::new());
        let mangler = Mangler::new(cfg.clone(), sender.clone());
        (cfg, mangler, sender)
    }

    fn rec(id: u32, payload: Vec<u8>) -> PacketRecord {
        PacketRecord {
            id,
            payload,
            mark: None,
            conntrack: None,
        }
    }

    #[test]
    fn marked_packet_is_accepted_without_sends() {
        let (cfg, mangler, sender) = setup();
        let mut r = rec(1, tcp_packet_v4(b"anything", 1, 0x18));
        r.mark = Some(cfg.mark);
        assert_eq!(
            decide(&cfg, &mangler, &r),
            KernelVerdict::AcceptWithMark(cfg.mark)
        );
        assert_eq!(sender.count(), 0);
    }

    #[test]
    fn partial_mark_overlap_is_not_ours() {
        let cfg = Arc::new(Config {
            mark: 0x8000,
            ..Config::default()
        });
        let sender = Arc::new(RecordingSender::new());
        let mangler = Mangler::new(cfg.clone(), sender);
        let mut r = rec(1, tcp_packet_v4(b"", 1, 0x10));
        r.mark = Some(0x0800); // some other tool's mark
        // not ours, so the pipeline runs (and, payload-less, continues)
        assert_eq!(
            decide(&cfg, &mangler, &r),
            KernelVerdict::AcceptWithMark(0x8000)
        );
    }

    #[test]
    fn empty_payload_accepted() {
        let (cfg, mangler, _) = setup();
        assert_eq!(
            decide(&cfg, &mangler, &rec(9, Vec::new())),
            KernelVerdict::AcceptWithMark(cfg.mark)
        );
    }

    #[test]
    fn connbytes_limit_skips_late_flow_packets() {
        let (cfg, mangler, sender) = setup();
        let inner_len = (4 + 8) as u16;
        let mut counters = Vec::new();
        counters.extend_from_slice(&inner_len.to_ne_bytes());
        counters.extend_from_slice(&1u16.to_ne_bytes()); // CTA_COUNTERS_PACKETS
        counters.extend_from_slice(&100u64.to_be_bytes());
        let outer_len = (4 + counters.len()) as u16;
        let mut ct = Vec::new();
        ct.extend_from_slice(&outer_len.to_ne_bytes());
        ct.extend_from_slice(&9u16.to_ne_bytes()); // CTA_COUNTERS_ORIG
        ct.extend_from_slice(&counters);

        let mut r = rec(3, tcp_packet_v4(b"late data", 50, 0x18));
        r.conntrack = Some(ct);
        assert_eq!(
            decide(&cfg, &mangler, &r),
            KernelVerdict::AcceptWithMark(cfg.mark)
        );
        assert_eq!(sender.count(), 0);
    }

    #[test]
    fn every_packet_gets_exactly_one_verdict() {
        let (cfg, mangler, _) = setup();
        let records = vec![
            rec(10, Vec::new()),
            rec(11, tcp_packet_v4(b"zz", 1, 0x18)),
            rec(12, vec![0xff, 0xff]), // unparseable L3
        ];
        let mut q = MemQueue::new(records);
        while let Ok(Some(r)) = q.recv() {
            let v = decide(&cfg, &mangler, &r);
            q.verdict(r.id, v).unwrap();
        }
        let ids: Vec<u32> = q.verdicts.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![10, 11, 12]);
        // unparseable packets are accepted, never dropped
        assert!(matches!(q.verdicts[2].1, KernelVerdict::AcceptWithMark(_)));
    }
}
