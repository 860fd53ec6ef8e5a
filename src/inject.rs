//! Forged-packet injection: two raw sockets behind the [`PacketSender`]
//! capability.
//!
//! The mangler only ever sees the trait, so unit tests drive it with
//! in-memory senders that record bytes. The production [`RawSender`] owns
//! `AF_INET`/`AF_INET6` `IPPROTO_RAW` sockets carrying the configured mark
//! (`SO_MARK`) so the firewall rules do not re-queue our own packets.
//!
//! Delayed sends ride on the tokio timer and are fire-and-forget: they must
//! not block the worker that scheduled them, and a pending send that fires
//! after shutdown is tolerated (the socket outlives the workers).

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::packet::ip_version;

/// Injection capability handed to the mangler.
pub trait PacketSender: Send + Sync {
    /// Immediate send, dispatched on the packet's version nibble.
    fn send(&self, pkt: &[u8]) -> io::Result<()>;

    /// Schedule `pkt` to be sent after `delay_ms`. Never blocks.
    fn send_delayed(&self, pkt: Vec<u8>, delay_ms: u32);
}

struct RawInner {
    v4: Option<Mutex<Socket>>,
    v6: Option<Mutex<Socket>>,
    handle: Handle,
}

/// Raw-socket sender. Cheap to clone; clones share the sockets.
#[derive(Clone)]
pub struct RawSender {
    inner: Arc<RawInner>,
}

fn open_raw(domain: Domain, mark: u32) -> Result<Socket> {
    let sock = Socket::new(domain, Type::RAW, Some(Protocol::from(libc::IPPROTO_RAW)))
        .context("raw socket")?;
    if domain == Domain::IPV4 {
        sock.set_header_included(true).context("IP_HDRINCL")?;
    }
    if mark != 0 {
        sock.set_mark(mark).context("SO_MARK")?;
    }
    Ok(sock)
}

impl RawSender {
    /// Open the raw sockets. A missing IPv6 stack is not fatal; a failing
    /// IPv4 socket is.
    pub fn new(mark: u32, use_ipv6: bool, handle: Handle) -> Result<Self> {
        let v4 = open_raw(Domain::IPV4, mark).context("AF_INET raw sender")?;
        let v6 = if use_ipv6 {
            match open_raw(Domain::IPV6, mark) {
                Ok(s) => Some(Mutex::new(s)),
                Err(e) => {
                    warn!("IPv6 raw sender unavailable: {e:#}");
                    None
                }
            }
        } else {
            None
        };
        Ok(Self {
            inner: Arc::new(RawInner {
                v4: Some(Mutex::new(v4)),
                v6,
                handle,
            }),
        })
    }
}

impl RawInner {
    fn send(&self, pkt: &[u8]) -> io::Result<()> {
        match ip_version(pkt) {
            4 => {
                if pkt.len() < 20 {
                    return Ok(());
                }
                let Some(sock) = &self.v4 else {
                    return Err(io::Error::new(io::ErrorKind::NotFound, "no v4 raw socket"));
                };
                let dst: [u8; 4] = pkt[16..20].try_into().expect("slice length checked");
                let addr = SocketAddrV4::new(Ipv4Addr::from(dst), 0);
                sock.lock().send_to(pkt, &SockAddr::from(addr))?;
                Ok(())
            }
            6 => {
                if pkt.len() < 40 {
                    return Ok(());
                }
                let Some(sock) = &self.v6 else {
                    return Err(io::Error::new(io::ErrorKind::NotFound, "no v6 raw socket"));
                };
                let dst: [u8; 16] = pkt[24..40].try_into().expect("slice length checked");
                let addr = SocketAddrV6::new(Ipv6Addr::from(dst), 0, 0, 0);
                sock.lock().send_to(pkt, &SockAddr::from(addr))?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl PacketSender for RawSender {
    fn send(&self, pkt: &[u8]) -> io::Result<()> {
        self.inner.send(pkt)
    }

    fn send_delayed(&self, pkt: Vec<u8>, delay_ms: u32) {
        let inner = self.inner.clone();
        self.inner.handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(u64::from(delay_ms))).await;
            match inner.send(&pkt) {
                Ok(()) => debug!(len = pkt.len(), delay_ms, "delayed segment sent"),
                Err(e) => warn!("delayed send failed: {e}"),
            }
        });
    }
}
