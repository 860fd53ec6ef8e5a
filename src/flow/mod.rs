//! Per-flow state: sparse reassembly buffers, the TCP flow table and the
//! done-tracker that keeps retransmissions from triggering a second burst.
//!
//! The tables are concurrent maps with per-entry locks: the outer lock is
//! held only long enough to clone an `Arc`, so flows never serialize against
//! each other. Expiry is driven externally through `gc(now)` (the binary
//! runs a 2-minute ticker; tests call it directly).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Reassembly entries idle longer than this are reclaimed.
pub const FLOW_MAX_AGE: Duration = Duration::from_secs(5 * 60);
/// Reassembly entries larger than this are reclaimed.
pub const FLOW_MAX_SIZE: usize = 256 * 1024;
/// Done-flags expire after this.
pub const DONE_TTL: Duration = Duration::from_secs(5 * 60);

/// Directional 5-tuple identifying a flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub version: u8,
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn from_packet(pkt: &[u8], src_port: u16, dst_port: u16) -> Option<Self> {
        Some(Self {
            version: crate::packet::ip_version(pkt),
            src: crate::packet::ip::src_addr(pkt)?,
            src_port,
            dst: crate::packet::ip::dst_addr(pkt)?,
            dst_port,
        })
    }
}

/// Byte buffer with sparse writes and a `head` pointer that advances over
/// the longest contiguous filled prefix. `head` never regresses.
#[derive(Default)]
pub struct SparseBuffer {
    data: Vec<u8>,
    mask: Vec<u8>,
    head: usize,
}

impl SparseBuffer {
    fn ensure(&mut self, n: usize) {
        if n > self.data.len() {
            self.data.resize(n, 0);
            self.mask.resize(n, 0);
        }
    }

    pub fn write(&mut self, off: usize, p: &[u8]) {
        if p.is_empty() {
            return;
        }
        self.ensure(off + p.len());
        self.data[off..off + p.len()].copy_from_slice(p);
        for m in &mut self.mask[off..off + p.len()] {
            *m = 1;
        }
        if off <= self.head {
            while self.head < self.mask.len() && self.mask[self.head] == 1 {
                self.head += 1;
            }
        }
    }

    /// The filled prefix `[0..head]`; empty until the first byte lands.
    pub fn contiguous(&self) -> &[u8] {
        &self.data[..self.head]
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

struct TcpEntry {
    base_seq: u32,
    started: bool,
    buf: SparseBuffer,
    last_touch: Instant,
}

/// Per-5-tuple reassembly of the first bytes of each flow, indexed by the
/// 32-bit signed delta from the first observed data segment.
#[derive(Default)]
pub struct TcpAssembler {
    map: Mutex<HashMap<FlowKey, Arc<Mutex<TcpEntry>>>>,
}

impl TcpAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &FlowKey) -> Arc<Mutex<TcpEntry>> {
        let mut map = self.map.lock();
        map.entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TcpEntry {
                    base_seq: 0,
                    started: false,
                    buf: SparseBuffer::default(),
                    last_touch: Instant::now(),
                }))
            })
            .clone()
    }

    /// Insert a segment and return the contiguous prefix from `base_seq`.
    /// Segments earlier than `base_seq` (in signed-delta terms, handling
    /// sequence wrap) are dropped.
    pub fn insert(&self, key: &FlowKey, seq: u32, payload: &[u8]) -> (Vec<u8>, u32) {
        let entry = self.entry(key);
        let mut e = entry.lock();
        if !e.started {
            e.base_seq = seq;
            e.started = true;
        }
        let delta = seq.wrapping_sub(e.base_seq) as i32;
        if delta >= 0 {
            e.buf.write(delta as usize, payload);
        }
        e.last_touch = Instant::now();
        (e.buf.contiguous().to_vec(), e.base_seq)
    }

    pub fn remove(&self, key: &FlowKey) {
        self.map.lock().remove(key);
    }

    pub fn gc(&self, now: Instant) {
        self.map.lock().retain(|_, entry| {
            let e = entry.lock();
            now.saturating_duration_since(e.last_touch) <= FLOW_MAX_AGE && e.buf.capacity() <= FLOW_MAX_SIZE
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }
}

/// Flows already mangled within the TTL; keeps workers idempotent when the
/// kernel re-queues retransmissions.
#[derive(Default)]
pub struct FlowDone {
    map: Mutex<HashMap<FlowKey, Instant>>,
}

impl FlowDone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self, key: &FlowKey, now: Instant) -> bool {
        let mut map = self.map.lock();
        match map.get(key) {
            Some(&t) if now.saturating_duration_since(t) <= DONE_TTL => true,
            Some(_) => {
                map.remove(key);
                false
            }
            None => false,
        }
    }

    pub fn mark(&self, key: &FlowKey, now: Instant) {
        self.map.lock().insert(key.clone(), now);
    }

    pub fn gc(&self, now: Instant) {
        self.map
            .lock()
            .retain(|_, &mut t| now.saturating_duration_since(t) <= DONE_TTL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FlowKey {
        FlowKey {
            version: 4,
            src: IpAddr::from([192, 168, 1, 10]),
            src_port: 51000,
            dst: IpAddr::from([93, 184, 216, 34]),
            dst_port: 443,
        }
    }

    #[test]
    fn sparse_head_is_monotone() {
        let mut buf = SparseBuffer::default();
        buf.write(4, b"5678");
        assert_eq!(buf.head(), 0);
        buf.write(0, b"1234");
        assert_eq!(buf.head(), 8);
        assert_eq!(buf.contiguous(), b"12345678");
        buf.write(2, b"ab"); // overlap never regresses head
        assert_eq!(buf.head(), 8);
        assert_eq!(buf.contiguous(), b"12ab5678");
    }

    #[test]
    fn out_of_order_segments_assemble() {
        let asm = TcpAssembler::new();
        let k = key();
        let (prefix, base) = asm.insert(&k, 1000, b"first");
        assert_eq!(base, 1000);
        assert_eq!(prefix, b"first");
        // gap
        let (prefix, _) = asm.insert(&k, 1010, b"third");
        assert_eq!(prefix, b"first");
        let (prefix, _) = asm.insert(&k, 1005, b"gap__");
        assert_eq!(prefix, b"firstgap__third");
    }

    #[test]
    fn stale_segments_dropped() {
        let asm = TcpAssembler::new();
        let k = key();
        asm.insert(&k, 5000, b"base");
        let (prefix, base) = asm.insert(&k, 4990, b"old");
        assert_eq!(base, 5000);
        assert_eq!(prefix, b"base");
    }

    #[test]
    fn seq_wrap_is_signed() {
        let asm = TcpAssembler::new();
        let k = key();
        asm.insert(&k, u32::MAX - 1, b"ab");
        // wraps to offset 2
        let (prefix, _) = asm.insert(&k, 0, b"cd");
        assert_eq!(prefix, b"abcd");
    }

    #[test]
    fn gc_reclaims_old_and_oversized() {
        let asm = TcpAssembler::new();
        let k = key();
        asm.insert(&k, 0, b"x");
        asm.gc(Instant::now());
        assert_eq!(asm.len(), 1);
        asm.gc(Instant::now() + FLOW_MAX_AGE + Duration::from_secs(1));
        assert_eq!(asm.len(), 0);

        asm.insert(&k, 0, &vec![0u8; FLOW_MAX_SIZE + 1]);
        asm.gc(Instant::now());
        assert_eq!(asm.len(), 0);
    }

    #[test]
    fn done_flags_expire() {
        let done = FlowDone::new();
        let k = key();
        let t0 = Instant::now();
        assert!(!done.is_done(&k, t0));
        done.mark(&k, t0);
        assert!(done.is_done(&k, t0 + Duration::from_secs(10)));
        assert!(!done.is_done(&k, t0 + DONE_TTL + Duration::from_secs(1)));
    }
}
