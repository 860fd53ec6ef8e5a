//! CRYPTO stream reassembly across Initial datagrams, keyed by DCID.
//!
//! The frame walk is deliberately narrow: PADDING runs and PING are
//! tolerated, CRYPTO frames are scattered into the per-DCID buffer, and any
//! other frame type ends the walk without an error — the ClientHello always
//! travels in CRYPTO frames at the front of the first flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::flow::{SparseBuffer, FLOW_MAX_AGE};

use super::read_varint;

const FRAME_PADDING: u8 = 0x00;
const FRAME_PING: u8 = 0x01;
const FRAME_CRYPTO: u8 = 0x06;

/// Hostile-input bound on absolute CRYPTO offsets.
const MAX_CRYPTO_OFFSET: u64 = 1 << 20;

struct Entry {
    buf: SparseBuffer,
    last_touch: Instant,
}

/// Per-DCID CRYPTO reassembly table.
#[derive(Default)]
pub struct CryptoAssembler {
    map: Mutex<HashMap<Vec<u8>, Arc<Mutex<Entry>>>>,
}

impl CryptoAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scatter the CRYPTO frames of one decrypted payload into the DCID's
    /// buffer and return the contiguous prefix, or `None` while the front of
    /// the stream is still missing.
    pub fn assemble(&self, dcid: &[u8], plaintext: &[u8]) -> Option<Vec<u8>> {
        let entry = {
            let mut map = self.map.lock();
            map.entry(dcid.to_vec())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Entry {
                        buf: SparseBuffer::default(),
                        last_touch: Instant::now(),
                    }))
                })
                .clone()
        };
        let mut e = entry.lock();
        walk_frames(plaintext, |off, data| {
            e.buf.write(off as usize, data);
        });
        e.last_touch = Instant::now();
        let prefix = e.buf.contiguous();
        if prefix.is_empty() {
            None
        } else {
            Some(prefix.to_vec())
        }
    }

    pub fn remove(&self, dcid: &[u8]) {
        self.map.lock().remove(dcid);
    }

    pub fn gc(&self, now: Instant) {
        self.map.lock().retain(|_, entry| {
            let e = entry.lock();
            now.saturating_duration_since(e.last_touch) <= FLOW_MAX_AGE
                && e.buf.capacity() <= MAX_CRYPTO_OFFSET as usize
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }
}

/// Walk the decrypted frame sequence, feeding CRYPTO bodies to `sink`.
fn walk_frames(payload: &[u8], mut sink: impl FnMut(u64, &[u8])) {
    let mut pos = 0usize;
    while pos < payload.len() {
        match payload[pos] {
            FRAME_PADDING | FRAME_PING => pos += 1,
            FRAME_CRYPTO => {
                pos += 1;
                let Some((off, n)) = read_varint(payload, pos) else {
                    return;
                };
                pos += n;
                let Some((len, n)) = read_varint(payload, pos) else {
                    return;
                };
                pos += n;
                let len = len as usize;
                if payload.len() < pos + len {
                    return;
                }
                if off <= MAX_CRYPTO_OFFSET {
                    sink(off, &payload[pos..pos + len]);
                }
                pos += len;
            }
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto_frame(off: u64, data: &[u8]) -> Vec<u8> {
        let mut f = vec![FRAME_CRYPTO];
        // 2-byte varints keep the fixtures readable
        f.extend_from_slice(&(0x4000u16 | off as u16).to_be_bytes());
        f.extend_from_slice(&(0x4000u16 | data.len() as u16).to_be_bytes());
        f.extend_from_slice(data);
        f
    }

    #[test]
    fn padding_and_ping_are_skipped() {
        let asm = CryptoAssembler::new();
        let mut payload = vec![0u8; 8]; // PADDING run
        payload.push(FRAME_PING);
        payload.extend_from_slice(&crypto_frame(0, b"hello"));
        assert_eq!(asm.assemble(b"dcid", &payload).unwrap(), b"hello");
    }

    #[test]
    fn unknown_frame_terminates_walk() {
        let asm = CryptoAssembler::new();
        let mut payload = crypto_frame(0, b"ab");
        payload.push(0x1c); // CONNECTION_CLOSE
        payload.extend_from_slice(&crypto_frame(2, b"cd"));
        assert_eq!(asm.assemble(b"dcid", &payload).unwrap(), b"ab");
    }

    #[test]
    fn cross_datagram_reassembly() {
        let asm = CryptoAssembler::new();
        assert!(asm.assemble(b"d1", &crypto_frame(5, b"world")).is_none());
        let got = asm.assemble(b"d1", &crypto_frame(0, b"hell\x6f")).unwrap();
        assert_eq!(got, b"helloworld");
        // DCIDs don't mix
        assert_eq!(asm.assemble(b"d2", &crypto_frame(0, b"x")).unwrap(), b"x");
    }

    #[test]
    fn hostile_offset_ignored() {
        let asm = CryptoAssembler::new();
        let mut f = vec![FRAME_CRYPTO];
        f.extend_from_slice(&[0xc0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]); // 8-byte varint, huge
        f.extend_from_slice(&[0x01, 0x41]); // len 1, data
        assert!(asm.assemble(b"d", &f).is_none());
    }

    #[test]
    fn removal_and_gc() {
        let asm = CryptoAssembler::new();
        asm.assemble(b"d", &crypto_frame(0, b"x"));
        assert_eq!(asm.len(), 1);
        asm.remove(b"d");
        assert_eq!(asm.len(), 0);

        asm.assemble(b"d", &crypto_frame(0, b"x"));
        asm.gc(Instant::now() + FLOW_MAX_AGE + std::time::Duration::from_secs(1));
        assert_eq!(asm.len(), 0);
    }

    #[test]
    fn full_initial_chain_extracts_sni() {
        use crate::quic::decrypt::{decrypt_initial, seal_initial};
        use crate::quic::VERSION_V1;
        use crate::testutil::client_hello;

        let dcid = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let hello = client_hello("example.com");
        let hs = &hello[5..];
        let mut frames = vec![FRAME_CRYPTO, 0x00];
        frames.extend_from_slice(&(0x4000u16 | hs.len() as u16).to_be_bytes());
        frames.extend_from_slice(hs);

        let pkt = seal_initial(VERSION_V1, &dcid, 0x1234, &frames);
        let plain = decrypt_initial(&dcid, &pkt).unwrap();
        let asm = CryptoAssembler::new();
        let crypto = asm.assemble(&dcid, &plain).unwrap();
        assert_eq!(
            crate::tls::extract_sni_from_handshake(&crypto).unwrap(),
            b"example.com"
        );
    }

    #[test]
    fn truncated_crypto_frame_is_ignored() {
        let asm = CryptoAssembler::new();
        let mut f = crypto_frame(0, b"ok");
        f.extend_from_slice(&[FRAME_CRYPTO, 0x00]); // missing length varint
        assert_eq!(asm.assemble(b"d", &f).unwrap(), b"ok");
    }
}
