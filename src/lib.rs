//! snisplit — userspace NFQUEUE mangler for TLS and QUIC ClientHellos.
//!
//! Firewall rules divert the first packets of outbound 443 flows into a
//! kernel queue. Workers reassemble enough of each flow to see the SNI,
//! and flows that match policy get their ClientHello replaced on the wire
//! by a split-and-decoy burst a middlebox cannot reassemble, while the
//! queued original is dropped. QUIC Initials are decrypted with the
//! public client-initial keys to make the same per-domain decision.
//!
//! The library exposes the whole pipeline so the pieces are testable
//! without a kernel: packet codecs ([`packet`]), TLS/QUIC parsing
//! ([`tls`], [`quic`]), flow state ([`flow`]), policy ([`config`]), the
//! mangler itself ([`mangle`]), and the queue/injection edges ([`queue`],
//! [`inject`]).

pub mod config;
pub mod flow;
pub mod inject;
pub mod mangle;
pub mod packet;
pub mod queue;
pub mod quic;
pub mod tls;

#[cfg(test)]
mod testutil;
