//! Shared byte fixtures for unit tests.

use parking_lot::Mutex;

use crate::inject::PacketSender;
use crate::packet::ip::{finalize_ipv4_checksum, PROTO_TCP, PROTO_UDP};
use crate::packet::tcp::finalize_tcp_checksum;
use crate::packet::udp::finalize_udp_checksum;

/// In-memory [`PacketSender`] recording every emission in order. Delayed
/// sends land in the same list, tagged with their delay.
#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<(Vec<u8>, Option<u32>)>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.sent.lock().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn delays(&self) -> Vec<Option<u32>> {
        self.sent.lock().iter().map(|(_, d)| *d).collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl PacketSender for RecordingSender {
    fn send(&self, pkt: &[u8]) -> std::io::Result<()> {
        self.sent.lock().push((pkt.to_vec(), None));
        Ok(())
    }

    fn send_delayed(&self, pkt: Vec<u8>, delay_ms: u32) {
        self.sent.lock().push((pkt, Some(delay_ms)));
    }
}

/// IPv4 + 20-byte TCP header + payload, LAN source, dst port 443,
/// checksums valid.
pub fn tcp_packet_v4(payload: &[u8], seq: u32, flags: u8) -> Vec<u8> {
    let total = 20 + 20 + payload.len();
    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[4..6].copy_from_slice(&0x3344u16.to_be_bytes()); // id
    pkt[8] = 64;
    pkt[9] = PROTO_TCP;
    pkt[12..16].copy_from_slice(&[192, 168, 1, 10]);
    pkt[16..20].copy_from_slice(&[93, 184, 216, 34]);
    finalize_ipv4_checksum(&mut pkt[..20]);
    pkt[20..22].copy_from_slice(&51000u16.to_be_bytes());
    pkt[22..24].copy_from_slice(&443u16.to_be_bytes());
    pkt[24..28].copy_from_slice(&seq.to_be_bytes());
    pkt[28..32].copy_from_slice(&0xdeadbeefu32.to_be_bytes()); // ack
    pkt[32] = 5 << 4;
    pkt[33] = flags;
    pkt[34..36].copy_from_slice(&29200u16.to_be_bytes());
    pkt[40..].copy_from_slice(payload);
    finalize_tcp_checksum(&mut pkt, 20);
    pkt
}

/// IPv6 + 20-byte TCP header + payload, ULA source, dst port 443,
/// checksum valid.
pub fn tcp_packet_v6(payload: &[u8], seq: u32, flags: u8) -> Vec<u8> {
    let mut pkt = vec![0u8; 40 + 20 + payload.len()];
    pkt[0] = 0x60;
    pkt[4..6].copy_from_slice(&((20 + payload.len()) as u16).to_be_bytes());
    pkt[6] = PROTO_TCP;
    pkt[7] = 64; // hop limit
    pkt[8] = 0xfd; // fd00::1
    pkt[23] = 1;
    pkt[24] = 0x20; // 2001:db8::1
    pkt[25] = 0x01;
    pkt[26] = 0x0d;
    pkt[27] = 0xb8;
    pkt[39] = 1;
    pkt[40..42].copy_from_slice(&51000u16.to_be_bytes());
    pkt[42..44].copy_from_slice(&443u16.to_be_bytes());
    pkt[44..48].copy_from_slice(&seq.to_be_bytes());
    pkt[52] = 5 << 4;
    pkt[53] = flags;
    pkt[54..56].copy_from_slice(&29200u16.to_be_bytes());
    pkt[60..].copy_from_slice(payload);
    finalize_tcp_checksum(&mut pkt, 40);
    pkt
}

/// IPv4 + UDP header + payload, LAN source, checksums valid.
pub fn udp_packet_v4(payload: &[u8], dst_port: u16) -> Vec<u8> {
    let total = 20 + 8 + payload.len();
    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[8] = 64;
    pkt[9] = PROTO_UDP;
    pkt[12..16].copy_from_slice(&[192, 168, 1, 10]);
    pkt[16..20].copy_from_slice(&[93, 184, 216, 34]);
    finalize_ipv4_checksum(&mut pkt[..20]);
    pkt[20..22].copy_from_slice(&50123u16.to_be_bytes());
    pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
    pkt[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    pkt[28..].copy_from_slice(payload);
    finalize_udp_checksum(&mut pkt, 20);
    pkt
}

/// Complete TLS ClientHello record with the given SNI hostname.
pub fn client_hello(host: &str) -> Vec<u8> {
    let sni_list = {
        let mut v = Vec::new();
        v.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
        v.push(0); // name_type host_name
        v.extend_from_slice(&(host.len() as u16).to_be_bytes());
        v.extend_from_slice(host.as_bytes());
        v
    };
    let mut exts = Vec::new();
    exts.extend_from_slice(&[0x00, 0x00]); // server_name
    exts.extend_from_slice(&(sni_list.len() as u16).to_be_bytes());
    exts.extend_from_slice(&sni_list);
    // supported_versions, to keep the walk honest about skipping extensions
    exts.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // legacy_version
    body.extend_from_slice(&[0x5a; 32]); // random
    body.push(0); // session_id
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // cipher_suites
    body.extend_from_slice(&[0x01, 0x00]); // compression
    body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
    body.extend_from_slice(&exts);

    let mut hs = Vec::new();
    hs.push(0x01); // client_hello
    hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    hs.extend_from_slice(&body);

    let mut rec = Vec::new();
    rec.extend_from_slice(&[0x16, 0x03, 0x01]);
    rec.extend_from_slice(&(hs.len() as u16).to_be_bytes());
    rec.extend_from_slice(&hs);
    rec
}
