//! UDP demo client / packet generator: each worker thread opens one local
//! UDP socket and sends a repeating alphabetic-pattern frame to the remote
//! address at up to `pktrate` packets/second, respecting the bounded
//! transmit queue's backpressure.
//!
//! Grounded on `original_source/src/udp_clt/udp_clt.c`
//! (`thrclt_new`/`thrclt_ev_newconn_cb`/`thrsrv_comm_udp_write_cb`). The
//! original only ever sends one frame per one-second tick regardless of its
//! `pktrate`/`connrate` argument; this version actually paces sends to the
//! requested rate (spread over ten 100ms ticks/second) since a packet-rate
//! argument that's parsed but never used isn't something worth preserving --
//! see DESIGN.md.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::exit;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use reactor_comm::{udp_bind_reuseport, CommStatus};
use reactor_core::{EventFlags, EventKind};
use reactor_shm::NetBuf;
use reactor_threads::{ThreadGroup, ThreadGroupConfig};
use reactor_util::ThreadPriority;

struct ClientConfig {
    num_threads: usize,
    qdepth: usize,
    pktrate: usize,
    bufsize: usize,
    remote_addr: SocketAddr,
}

/// Positional demo client CLI: `numthreads qdepth pktrate bufsize remote_ip
/// remote_port`, parsed manually so a bad value exits 127 like the rest of
/// this workspace's demo CLIs.
#[derive(Parser)]
#[command(disable_help_flag = true)]
struct Cli {
    args: Vec<String>,
}

fn usage() -> ! {
    eprintln!("Usage: udp-clt <numthreads> <qdepth> <pktrate> <bufsize> <remote_ip> <remote_port>");
    exit(127);
}

fn parse_or_exit<T: std::str::FromStr>(what: &str, value: &str) -> T {
    value.parse().unwrap_or_else(|_| {
        eprintln!("udp-clt: invalid {what}: {value:?}");
        exit(127);
    })
}

fn parse_config(args: &[String]) -> ClientConfig {
    if args.len() < 6 {
        usage();
    }
    let num_threads = parse_or_exit("numthreads", &args[0]);
    let qdepth = parse_or_exit("qdepth", &args[1]);
    let pktrate = parse_or_exit("pktrate", &args[2]);
    let bufsize = parse_or_exit("bufsize", &args[3]);
    let remote_ip: IpAddr = parse_or_exit("remote_ip", &args[4]);
    let remote_port: u16 = parse_or_exit("remote_port", &args[5]);
    ClientConfig { num_threads, qdepth, pktrate, bufsize, remote_addr: SocketAddr::new(remote_ip, remote_port) }
}

#[derive(Default)]
struct Stats {
    total_pkt_written: AtomicU64,
    total_byte_written: AtomicU64,
    total_pkt_dropped: AtomicU64,
}

const TICKS_PER_SEC: usize = 10;

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let cfg = parse_config(&cli.args);

    if cfg.qdepth == 0 || cfg.bufsize == 0 {
        eprintln!("udp-clt: qdepth and bufsize must both be nonzero");
        exit(127);
    }

    let stats = Arc::new(Stats::default());
    let stats_setup = stats.clone();
    let remote_addr = cfg.remote_addr;
    let qdepth = cfg.qdepth;
    let bufsize = cfg.bufsize;
    let per_tick = (cfg.pktrate / TICKS_PER_SEC).max(1);

    let group = ThreadGroup::spawn(
        ThreadGroupConfig { n_threads: cfg.num_threads, priority: ThreadPriority::OSDefault, ..Default::default() },
        move |ctx| {
            let stats = stats_setup.clone();
            let comm = match udp_bind_reuseport(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)) {
                Ok(comm) => comm,
                Err(err) => {
                    tracing::error!(?err, worker = ctx.id, "failed to bind local UDP socket");
                    return;
                }
            };

            let stats_write = stats.clone();
            comm.borrow_mut().udp_write_setup(
                ctx.reactor,
                qdepth,
                Box::new(move |_comm, _reactor, frame, status| match status {
                    CommStatus::Completed => {
                        stats_write.total_pkt_written.fetch_add(1, Ordering::Relaxed);
                        stats_write.total_byte_written.fetch_add(frame.len() as u64, Ordering::Relaxed);
                    }
                    _ => {
                        stats_write.total_pkt_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }),
            );

            // Same keep-alive cycle as `udp_srv`: the send timer below
            // captures a strong clone of `comm` so the socket outlives this
            // setup closure for as long as the worker is running.
            let keepalive = comm.clone();
            let timer_id = ctx.reactor.create_event(
                None,
                EventKind::Timer,
                EventFlags::empty(),
                Box::new(move |reactor, self_id, _status| {
                    for _ in 0..per_tick {
                        let mut frame = NetBuf::heap(bufsize);
                        for (i, byte) in frame.as_mut_slice().iter_mut().enumerate() {
                            *byte = b'A' + (i % 26) as u8;
                        }
                        if keepalive.borrow_mut().udp_write(reactor, remote_addr, frame).is_err() {
                            stats.total_pkt_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    let _ = reactor.arm_after(self_id, Duration::from_millis(1000 / TICKS_PER_SEC as u64));
                }),
            );
            let _ = ctx.reactor.arm_after(timer_id, Duration::from_millis(0));
        },
        |_ctx, (), newfd| {
            tracing::debug!(fd = newfd.fd, flowid = newfd.flowid, "udp-clt ignoring unexpected steered fd");
            unsafe { libc::close(newfd.fd) };
        },
    )
    .expect("failed to start worker threads");

    let running = Arc::new(AtomicBool::new(true));
    let running_hdl = running.clone();
    ctrlc::set_handler(move || running_hdl.store(false, Ordering::SeqCst)).ok();

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));
        tracing::info!(
            written = stats.total_pkt_written.load(Ordering::Relaxed),
            bytes = stats.total_byte_written.load(Ordering::Relaxed),
            dropped = stats.total_pkt_dropped.load(Ordering::Relaxed),
            "udp-clt stats"
        );
    }

    group.stop();
    group.join();
}
