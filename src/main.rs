use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use snisplit::config::{self, Config};
use snisplit::inject::RawSender;
use snisplit::mangle::Mangler;
use snisplit::queue::netlink::{NfQueue, QueueFlags};
use snisplit::queue::run_worker;

const GC_TICK: Duration = Duration::from_secs(120);

/// The two sysctls the tool needs for the duration of the run: checksum
/// verification would discard our deliberately-broken decoys before they
/// reach the wire, and conntrack must stay liberal about the out-of-window
/// sequence numbers the bursts produce.
const SYSCTLS: [(&str, &str); 2] = [
    ("/proc/sys/net/netfilter/nf_conntrack_checksum", "0"),
    ("/proc/sys/net/netfilter/nf_conntrack_tcp_be_liberal", "1"),
];

struct SysctlGuard {
    saved: Vec<(&'static str, String)>,
}

impl SysctlGuard {
    fn apply() -> Self {
        let mut saved = Vec::new();
        for (path, value) in SYSCTLS {
            match std::fs::read_to_string(path) {
                Ok(old) => {
                    if let Err(e) = std::fs::write(path, value) {
                        warn!("sysctl {path}: {e}");
                    } else {
                        saved.push((path, old));
                    }
                }
                Err(e) => warn!("sysctl {path}: {e}"),
            }
        }
        Self { saved }
    }
}

impl Drop for SysctlGuard {
    fn drop(&mut self) {
        for (path, old) in &self.saved {
            if let Err(e) = std::fs::write(path, old) {
                warn!("restoring sysctl {path}: {e}");
            }
        }
    }
}

fn init_tracing(cfg: &Config) {
    let default = if cfg.logging.trace {
        "snisplit=trace"
    } else if cfg.logging.silent {
        "snisplit=warn"
    } else {
        "snisplit=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.logging.instaflush {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}

async fn run(cfg: Config) -> Result<()> {
    let cfg = Arc::new(cfg);
    info!(
        queue_start = cfg.queue_start,
        threads = cfg.threads,
        mark = cfg.mark,
        sections = cfg.sections.len(),
        "starting"
    );

    let _sysctls = SysctlGuard::apply();

    let sender = RawSender::new(cfg.mark, cfg.use_ipv6, tokio::runtime::Handle::current())
        .context("raw sender init")?;
    let mangler = Arc::new(Mangler::new(cfg.clone(), Arc::new(sender)));

    let flags = QueueFlags {
        fail_open: true,
        gso: cfg.use_gso,
        conntrack: cfg.use_conntrack,
    };
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::with_capacity(cfg.threads);
    for i in 0..cfg.threads {
        let queue_num = cfg.queue_start + i as u16;
        let mut queue = NfQueue::bind(queue_num, cfg.use_ipv6, flags)
            .with_context(|| format!("queue {queue_num} init"))?;
        let cfg = cfg.clone();
        let mangler = mangler.clone();
        let shutdown = shutdown.clone();
        workers.push(
            std::thread::Builder::new()
                .name(format!("nfq-{queue_num}"))
                .spawn(move || run_worker(&mut queue, &cfg, &mangler, &shutdown))
                .context("spawn worker")?,
        );
        info!(queue = queue_num, "worker started");
    }

    {
        let mangler = mangler.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(GC_TICK);
            tick.tick().await; // immediate first tick is a no-op
            loop {
                tick.tick().await;
                mangler.gc(Instant::now());
            }
        });
    }

    let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    shutdown.store(true, Ordering::Relaxed);
    for worker in workers {
        let _ = worker.join();
    }
    info!("bye");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cfg = match config::args::parse(std::env::args()) {
        Ok(cfg) => cfg,
        Err(e) => {
            if let Some(ce) = e.downcast_ref::<clap::Error>() {
                let _ = ce.print();
                return if ce.use_stderr() {
                    ExitCode::FAILURE
                } else {
                    ExitCode::SUCCESS // --help / --version
                };
            }
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&cfg);
    match run(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
