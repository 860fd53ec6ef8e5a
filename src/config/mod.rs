//! Runtime configuration: the global knobs and the ordered list of
//! [`Section`] policies evaluated per packet.
//!
//! Sections are built once at startup and never mutated afterwards; workers
//! read them without synchronization.

pub mod args;
pub mod domains;

use bytes::Bytes;

use crate::mangle::fake::{FakeStrategy, UdpFakeStrategy};

use self::domains::DomainMatcher;

/// Built-in decoy ClientHello, shipped in the binary.
pub static FAKE_SNI_DEFAULT: &[u8] = include_bytes!("../../assets/fake_sni.bin");
/// Older decoy variant kept for middleboxes that fingerprint the new one.
pub static FAKE_SNI_OLD: &[u8] = include_bytes!("../../assets/fake_sni_old.bin");

/// Decoy payloads larger than this are truncated at load time.
pub const MAX_FAKE_LEN: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragStrategy {
    Tcp,
    Ip,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeSniType {
    Default,
    Custom,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniDetection {
    Parse,
    Brute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpMode {
    Drop,
    Fake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpFilterQuic {
    Disabled,
    All,
    Parsed,
}

/// One immutable policy block. The defaults mirror the bare command line:
/// TLS mangling on 443 for all domains, TCP splitting one byte into the
/// SNI, no decoys until asked for.
#[derive(Debug, Clone)]
pub struct Section {
    pub tls_enabled: bool,
    pub dport_filter: bool,
    pub frag_strategy: FragStrategy,
    pub frag_sni_reverse: bool,
    pub frag_sni_faked: bool,
    pub frag_middle_sni: bool,
    pub frag_two_stage: bool,
    pub frag_sni_pos: u32,
    pub fake_sni: bool,
    pub fake_sni_seq_len: u32,
    pub fake_sni_type: FakeSniType,
    pub fake_custom_pkt: Bytes,
    pub fake_sni_pkt: Bytes,
    pub faking: Vec<FakeStrategy>,
    pub faking_ttl: u8,
    pub fake_seq_offset: i32,
    pub fk_winsize: u16,
    pub syn_fake: bool,
    pub syn_fake_len: u32,
    pub seg2delay_ms: u32,
    pub sni_detection: SniDetection,
    pub matcher: DomainMatcher,
    pub udp_mode: UdpMode,
    pub udp_fake_seq_len: u32,
    pub udp_fake_len: u32,
    pub udp_faking: Vec<UdpFakeStrategy>,
    pub udp_dport_ranges: Vec<(u16, u16)>,
    pub udp_filter_quic: UdpFilterQuic,
}

impl Default for Section {
    fn default() -> Self {
        Self {
            tls_enabled: true,
            dport_filter: true,
            frag_strategy: FragStrategy::Tcp,
            frag_sni_reverse: false,
            frag_sni_faked: false,
            frag_middle_sni: false,
            frag_two_stage: false,
            frag_sni_pos: 1,
            fake_sni: false,
            fake_sni_seq_len: 1,
            fake_sni_type: FakeSniType::Default,
            fake_custom_pkt: Bytes::new(),
            fake_sni_pkt: Bytes::from_static(FAKE_SNI_DEFAULT),
            faking: vec![],
            faking_ttl: 8,
            fake_seq_offset: 10000,
            fk_winsize: 0,
            syn_fake: false,
            syn_fake_len: 0,
            seg2delay_ms: 0,
            sni_detection: SniDetection::Parse,
            matcher: DomainMatcher::new(vec![], vec![], true),
            udp_mode: UdpMode::Fake,
            udp_fake_seq_len: 6,
            udp_fake_len: 64,
            udp_faking: vec![],
            udp_dport_ranges: vec![],
            udp_filter_quic: UdpFilterQuic::Disabled,
        }
    }
}

impl Section {
    /// Decoy payload for one fake packet. `Random` draws a fresh buffer of
    /// `U[1..=min(1200, source_len)]` bytes each call.
    pub fn fake_payload(&self, source_len: usize) -> Bytes {
        use rand::Rng;
        match self.fake_sni_type {
            FakeSniType::Default => self.fake_sni_pkt.clone(),
            FakeSniType::Custom => self.fake_custom_pkt.clone(),
            FakeSniType::Random => {
                let cap = source_len.clamp(1, 1200);
                let len = rand::thread_rng().gen_range(1..=cap);
                let mut buf = vec![0u8; len];
                rand::thread_rng().fill(buf.as_mut_slice());
                Bytes::from(buf)
            }
        }
    }
}

/// Logging switches, resolved by the binary into a tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logging {
    pub silent: bool,
    pub trace: bool,
    pub instaflush: bool,
}

/// Process-wide settings plus the section list.
#[derive(Debug, Clone)]
pub struct Config {
    pub queue_start: u16,
    pub threads: usize,
    pub mark: u32,
    pub use_gso: bool,
    pub use_ipv6: bool,
    pub use_conntrack: bool,
    pub connbytes_limit: u32,
    pub logging: Logging,
    pub sections: Vec<Section>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_start: 537,
            threads: 1,
            mark: 1 << 15,
            use_gso: true,
            use_ipv6: true,
            use_conntrack: false,
            connbytes_limit: 19,
            logging: Logging::default(),
            sections: vec![Section::default()],
        }
    }
}
