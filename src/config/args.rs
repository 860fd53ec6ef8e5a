//! Command-line parsing.
//!
//! The flat argument list holds the global flags plus the first section;
//! every `--fbegin … --fend` pair delimits one additional section parsed
//! with the same grammar. clap sees each slice as its own invocation.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Args, Parser, ValueEnum};

use crate::mangle::fake::{FakeStrategy, UdpFakeStrategy};

use super::domains::{self, DomainMatcher};
use super::{
    Config, FakeSniType, FragStrategy, Logging, Section, SniDetection, UdpFilterQuic, UdpMode,
    FAKE_SNI_DEFAULT, FAKE_SNI_OLD, MAX_FAKE_LEN,
};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OnOff {
    Enabled,
    Disabled,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FragArg {
    Tcp,
    Ip,
    None,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FakeSniTypeArg {
    Default,
    Custom,
    Random,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BuiltinPayloadArg {
    Default,
    Old,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum FakingStrategyArg {
    Randseq,
    Ttl,
    #[value(name = "tcp_check")]
    TcpCheck,
    Pastseq,
    Md5sum,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SniDetectionArg {
    Parse,
    Brute,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum UdpModeArg {
    Drop,
    Fake,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum UdpFakingArg {
    Checksum,
    Ttl,
    None,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum UdpFilterQuicArg {
    Disabled,
    All,
    Parse,
}

/// One section's worth of options.
#[derive(Args, Debug, Clone)]
struct SectionArgs {
    /// Mangle TLS ClientHellos in this section
    #[arg(long, value_enum, default_value = "enabled")]
    tls: OnOff,

    /// Match any destination port, not just 443
    #[arg(long = "no-dport-filter")]
    no_dport_filter: bool,

    /// How to split the ClientHello carrier packet
    #[arg(long, value_enum, default_value = "tcp")]
    frag: FragArg,

    /// Send the SNI-bearing half before the leading half
    #[arg(long = "frag-sni-reverse")]
    frag_sni_reverse: bool,

    /// Let the decoy burst straddle the split point
    #[arg(long = "frag-sni-faked")]
    frag_sni_faked: bool,

    /// Split in the middle of the hostname
    #[arg(long = "frag-middle-sni")]
    frag_middle_sni: bool,

    /// Two-stage split (burst offsets follow the first half's length)
    #[arg(long = "frag-two-stage")]
    frag_two_stage: bool,

    /// Split this many bytes into the hostname (0 = off)
    #[arg(long = "frag-sni-pos", default_value_t = 1)]
    frag_sni_pos: u32,

    /// Send a whole decoy ClientHello before the burst
    #[arg(long = "fake-sni")]
    fake_sni: bool,

    /// Decoys per strategy in the fake burst
    #[arg(long = "fake-sni-seq-len", default_value_t = 1)]
    fake_sni_seq_len: u32,

    /// Payload for decoy packets
    #[arg(long = "fake-sni-type", value_enum, default_value = "default")]
    fake_sni_type: FakeSniTypeArg,

    /// Which built-in decoy ClientHello to use
    #[arg(long = "fake-sni-payload", value_enum, default_value = "default")]
    fake_sni_payload: BuiltinPayloadArg,

    /// Custom decoy payload as hex
    #[arg(long = "fake-custom-payload", value_name = "HEX")]
    fake_custom_payload: Option<String>,

    /// Custom decoy payload from a file
    #[arg(long = "fake-custom-payload-file", value_name = "PATH")]
    fake_custom_payload_file: Option<PathBuf>,

    /// Decoy poisoning strategy; repeat to combine
    #[arg(long = "faking-strategy", value_enum)]
    faking_strategy: Vec<FakingStrategyArg>,

    /// TTL / hop limit for ttl-strategy decoys
    #[arg(long = "faking-ttl", default_value_t = 8)]
    faking_ttl: u8,

    /// Sequence offset for randseq/pastseq decoys
    #[arg(long = "fake-seq-offset", default_value_t = 10000)]
    fake_seq_offset: i32,

    /// Override the TCP window of the split segments (0 = off)
    #[arg(long = "fk-winsize", default_value_t = 0)]
    fk_winsize: u16,

    /// Answer SYNs with a payload-carrying decoy SYN
    #[arg(long)]
    synfake: bool,

    /// Cap on the synfake payload (0 = whole decoy)
    #[arg(long = "synfake-len", default_value_t = 0)]
    synfake_len: u32,

    /// Delay before the late half of the split, in milliseconds
    #[arg(long = "seg2delay", value_name = "MS", default_value_t = 0)]
    seg2delay: u32,

    /// How to locate the SNI
    #[arg(long = "sni-detection", value_enum, default_value = "parse")]
    sni_detection: SniDetectionArg,

    /// Comma-separated suffixes to mangle, or "all"
    #[arg(long = "sni-domains", default_value = "all")]
    sni_domains: String,

    /// Domain list file (v2ray format)
    #[arg(long = "sni-domains-file", value_name = "PATH")]
    sni_domains_file: Option<PathBuf>,

    /// Comma-separated suffixes to leave alone
    #[arg(long = "exclude-domains", default_value = "")]
    exclude_domains: String,

    /// Exclude list file
    #[arg(long = "exclude-domains-file", value_name = "PATH")]
    exclude_domains_file: Option<PathBuf>,

    /// What to do with matched UDP
    #[arg(long = "udp-mode", value_enum, default_value = "fake")]
    udp_mode: UdpModeArg,

    /// Forged datagrams per hit
    #[arg(long = "udp-fake-seq-len", default_value_t = 6)]
    udp_fake_seq_len: u32,

    /// Zero-payload size of each forged datagram
    #[arg(long = "udp-fake-len", default_value_t = 64)]
    udp_fake_len: u32,

    /// UDP decoy perturbation; repeat to combine
    #[arg(long = "udp-faking-strategy", value_enum)]
    udp_faking_strategy: Vec<UdpFakingArg>,

    /// Extra UDP dport ranges to treat as hits, e.g. 50000-50100,3478
    #[arg(long = "udp-dport-filter", value_name = "RANGES")]
    udp_dport_filter: Option<String>,

    /// QUIC gate mode
    #[arg(long = "udp-filter-quic", value_enum, default_value = "disabled")]
    udp_filter_quic: UdpFilterQuicArg,

    /// Shorthand for --udp-filter-quic all --udp-mode drop
    #[arg(long = "quic-drop")]
    quic_drop: bool,
}

/// Global flags plus the first (flat) section.
#[derive(Parser, Debug)]
#[command(
    name = "snisplit",
    version,
    about = "NFQUEUE packet mangler that splits and decoys the TLS/QUIC SNI"
)]
struct Cli {
    /// First queue id; workers bind queue-num .. queue-num+threads
    #[arg(long = "queue-num", default_value_t = 537)]
    queue_num: u16,

    /// Parallel queue workers
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Mark set on verdicts and injected packets (loop avoidance)
    #[arg(long = "packet-mark", default_value_t = 32768)]
    packet_mark: u32,

    /// Only warnings and errors
    #[arg(long)]
    silent: bool,

    /// Per-packet trace logging
    #[arg(long)]
    trace: bool,

    /// Flush the log writer after every event
    #[arg(long)]
    instaflush: bool,

    /// Ask the kernel to resegment GSO superpackets
    #[arg(long = "no-gso")]
    no_gso: bool,

    /// Skip the IPv6 queue and raw socket
    #[arg(long = "no-ipv6")]
    no_ipv6: bool,

    /// Request conntrack attributes on queued packets
    #[arg(long = "use-conntrack")]
    use_conntrack: bool,

    /// Stop mangling flows past this many original-direction packets
    #[arg(long = "connbytes-limit", default_value_t = 19)]
    connbytes_limit: u32,

    #[command(flatten)]
    section: SectionArgs,
}

/// Extra sections are re-parsed with the same grammar.
#[derive(Parser, Debug)]
#[command(name = "--fbegin")]
struct SectionCli {
    #[command(flatten)]
    section: SectionArgs,
}

/// Parse a full argv (program name included) into a [`Config`].
pub fn parse<I, S>(argv: I) -> Result<Config>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
    let Some((prog, rest)) = argv.split_first() else {
        bail!("empty argument vector");
    };

    let mut global: Vec<String> = vec![prog.clone()];
    let mut extra: Vec<Vec<String>> = Vec::new();
    let mut current: Option<Vec<String>> = None;
    for tok in rest {
        match tok.as_str() {
            "--fbegin" => {
                if current.is_some() {
                    bail!("--fbegin inside an open section");
                }
                current = Some(vec!["--fbegin".into()]);
            }
            "--fend" => {
                let sec = current.take().context("--fend without --fbegin")?;
                extra.push(sec);
            }
            _ => match &mut current {
                Some(sec) => sec.push(tok.clone()),
                None => global.push(tok.clone()),
            },
        }
    }
    if current.is_some() {
        bail!("--fbegin without matching --fend");
    }

    let cli = Cli::try_parse_from(&global)?;
    if cli.silent && cli.trace {
        bail!("--silent and --trace are mutually exclusive");
    }
    if cli.threads == 0 {
        bail!("--threads must be at least 1");
    }

    let mut sections = vec![build_section(&cli.section)?];
    for toks in extra {
        let sc = SectionCli::try_parse_from(&toks)
            .context("inside --fbegin … --fend")?;
        sections.push(build_section(&sc.section)?);
    }

    Ok(Config {
        queue_start: cli.queue_num,
        threads: cli.threads,
        mark: cli.packet_mark,
        use_gso: !cli.no_gso,
        use_ipv6: !cli.no_ipv6,
        use_conntrack: cli.use_conntrack,
        connbytes_limit: cli.connbytes_limit,
        logging: Logging {
            silent: cli.silent,
            trace: cli.trace,
            instaflush: cli.instaflush,
        },
        sections,
    })
}

fn build_section(a: &SectionArgs) -> Result<Section> {
    let mut sec = Section {
        tls_enabled: a.tls == OnOff::Enabled,
        dport_filter: !a.no_dport_filter,
        frag_strategy: match a.frag {
            FragArg::Tcp => FragStrategy::Tcp,
            FragArg::Ip => FragStrategy::Ip,
            FragArg::None => FragStrategy::None,
        },
        frag_sni_reverse: a.frag_sni_reverse,
        frag_sni_faked: a.frag_sni_faked,
        frag_middle_sni: a.frag_middle_sni,
        frag_two_stage: a.frag_two_stage,
        frag_sni_pos: a.frag_sni_pos,
        fake_sni: a.fake_sni,
        fake_sni_seq_len: a.fake_sni_seq_len,
        fake_sni_type: match a.fake_sni_type {
            FakeSniTypeArg::Default => FakeSniType::Default,
            FakeSniTypeArg::Custom => FakeSniType::Custom,
            FakeSniTypeArg::Random => FakeSniType::Random,
        },
        fake_sni_pkt: match a.fake_sni_payload {
            BuiltinPayloadArg::Default => Bytes::from_static(FAKE_SNI_DEFAULT),
            BuiltinPayloadArg::Old => Bytes::from_static(FAKE_SNI_OLD),
        },
        faking_ttl: a.faking_ttl,
        fake_seq_offset: a.fake_seq_offset,
        fk_winsize: a.fk_winsize,
        syn_fake: a.synfake,
        syn_fake_len: a.synfake_len,
        seg2delay_ms: a.seg2delay,
        sni_detection: match a.sni_detection {
            SniDetectionArg::Parse => SniDetection::Parse,
            SniDetectionArg::Brute => SniDetection::Brute,
        },
        udp_mode: match a.udp_mode {
            UdpModeArg::Drop => UdpMode::Drop,
            UdpModeArg::Fake => UdpMode::Fake,
        },
        udp_fake_seq_len: a.udp_fake_seq_len,
        udp_fake_len: a.udp_fake_len,
        udp_filter_quic: match a.udp_filter_quic {
            UdpFilterQuicArg::Disabled => UdpFilterQuic::Disabled,
            UdpFilterQuicArg::All => UdpFilterQuic::All,
            UdpFilterQuicArg::Parse => UdpFilterQuic::Parsed,
        },
        ..Section::default()
    };

    if a.quic_drop {
        sec.udp_filter_quic = UdpFilterQuic::All;
        sec.udp_mode = UdpMode::Drop;
    }

    // custom decoy payload: file wins over inline hex
    if let Some(path) = &a.fake_custom_payload_file {
        let mut data = std::fs::read(path)
            .with_context(|| format!("read {}", path.display()))?;
        data.truncate(MAX_FAKE_LEN);
        sec.fake_custom_pkt = Bytes::from(data);
    } else if let Some(hex) = &a.fake_custom_payload {
        let mut data = decode_hex(hex).context("--fake-custom-payload")?;
        data.truncate(MAX_FAKE_LEN);
        sec.fake_custom_pkt = Bytes::from(data);
    }
    if sec.fake_sni_type == FakeSniType::Custom && sec.fake_custom_pkt.is_empty() {
        bail!("--fake-sni-type custom needs --fake-custom-payload or --fake-custom-payload-file");
    }

    // strategy bitset semantics: repeats collapse
    let off = a.fake_seq_offset.max(0) as u32;
    let mut seen = Vec::new();
    for s in &a.faking_strategy {
        if seen.contains(s) {
            continue;
        }
        seen.push(*s);
        sec.faking.push(match s {
            FakingStrategyArg::Randseq => FakeStrategy::RandSeq { max_off: off },
            FakingStrategyArg::Pastseq => FakeStrategy::PastSeq { off },
            FakingStrategyArg::Ttl => FakeStrategy::Ttl(a.faking_ttl),
            FakingStrategyArg::TcpCheck => FakeStrategy::BadTcpChecksum,
            FakingStrategyArg::Md5sum => FakeStrategy::Md5Option,
        });
    }

    if !a.udp_faking_strategy.contains(&UdpFakingArg::None) {
        let mut seen = Vec::new();
        for s in &a.udp_faking_strategy {
            if seen.contains(s) {
                continue;
            }
            seen.push(*s);
            sec.udp_faking.push(match s {
                UdpFakingArg::Ttl => UdpFakeStrategy::Ttl(a.faking_ttl),
                UdpFakingArg::Checksum => UdpFakeStrategy::BadChecksum,
                UdpFakingArg::None => unreachable!("filtered above"),
            });
        }
    }

    if let Some(ranges) = &a.udp_dport_filter {
        sec.udp_dport_ranges = parse_port_ranges(ranges)?;
    }

    // domain lists
    let all = a.sni_domains.trim().eq_ignore_ascii_case("all");
    let mut include = if all {
        Vec::new()
    } else {
        domains::parse_list(&a.sni_domains)
    };
    if let Some(path) = &a.sni_domains_file {
        include.extend(domains::load_file(path)?);
    }
    let mut exclude = domains::parse_list(&a.exclude_domains);
    if let Some(path) = &a.exclude_domains_file {
        exclude.extend(domains::load_file(path)?);
    }
    if !all && include.is_empty() {
        bail!("--sni-domains is empty; pass suffixes or \"all\"");
    }
    sec.matcher = DomainMatcher::new(include, exclude, all);

    Ok(sec)
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        bail!("odd-length hex string");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).context("invalid hex digit"))
        .collect()
}

/// `A-B,C,D-E` port range grammar.
fn parse_port_ranges(ranges: &str) -> Result<Vec<(u16, u16)>> {
    let mut out = Vec::new();
    for item in ranges.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (lo, hi) = match item.split_once('-') {
            Some((a, b)) => (
                a.trim().parse::<u16>().context("range start")?,
                b.trim().parse::<u16>().context("range end")?,
            ),
            None => {
                let p = item.parse::<u16>().context("port")?;
                (p, p)
            }
        };
        if lo > hi {
            bail!("backwards port range {item}");
        }
        out.push((lo, hi));
    }
    if out.is_empty() {
        bail!("empty port range list");
    }
    Ok(out)
}
