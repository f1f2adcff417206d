//! UDP demo server: every worker binds the same port with port-reuse and
//! drains datagrams off its own socket, discarding each frame after
//! accounting for it.
//!
//! Grounded on `original_source/src/udp_srv/udp_srv.c` (`thrsrv_listenfd`,
//! `thrsrv_new`, `conn_recvmsg`). The original shares a single listening fd
//! across all worker threads (legal, since they're all in one process); this
//! version gives each worker its own fd bound with `SO_REUSEPORT` instead, to
//! match the one-fd-per-reactor-registration shape every other listener in
//! this workspace uses.
//!
//! Takes no arguments, per the original's fixed `NUM_THREADS`/port.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reactor_comm::udp_bind_reuseport;
use reactor_threads::{ThreadGroup, ThreadGroupConfig};
use reactor_util::ThreadPriority;

const NUM_THREADS: usize = 16;
const PORT: u16 = 1667;
const MAX_FRAME_LEN: usize = 8192;

#[derive(Default)]
struct Stats {
    total_pkt_read: AtomicU64,
    total_byte_read: AtomicU64,
}

fn main() {
    tracing_subscriber::fmt::init();

    let stats = Arc::new(Stats::default());
    let stats_setup = stats.clone();

    let group = ThreadGroup::spawn(
        ThreadGroupConfig { n_threads: NUM_THREADS, priority: ThreadPriority::OSDefault, ..Default::default() },
        move |ctx| {
            let stats = stats_setup.clone();
            let comm = match udp_bind_reuseport(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), PORT)) {
                Ok(comm) => comm,
                Err(err) => {
                    tracing::error!(?err, worker = ctx.id, "failed to bind UDP listener");
                    return;
                }
            };
            comm.borrow_mut().mark_nonclose();
            // The udp-read callback captures a strong clone of its own Comm,
            // the same self-referential-cycle trick `tcp_srv` uses to keep a
            // never-closed listener alive via its accept callback: once this
            // setup closure returns and its own `comm` binding drops, the
            // cycle through the armed read event is the only thing keeping
            // the listener alive, for as long as the worker runs.
            let keepalive = comm.clone();
            comm.borrow_mut().udp_read(
                ctx.reactor,
                None,
                MAX_FRAME_LEN,
                Box::new(move |_comm, _reactor, frame, _peer, status| {
                    let _ = &keepalive;
                    if matches!(status, reactor_comm::CommStatus::Completed) {
                        stats.total_pkt_read.fetch_add(1, Ordering::Relaxed);
                        stats.total_byte_read.fetch_add(frame.len() as u64, Ordering::Relaxed);
                    }
                }),
            );
        },
        |_ctx, (), newfd| {
            tracing::debug!(fd = newfd.fd, flowid = newfd.flowid, "udp-srv ignoring unexpected steered fd");
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
            packets = stats.total_pkt_read.load(Ordering::Relaxed),
            bytes = stats.total_byte_read.load(Ordering::Relaxed),
            "udp-srv stats"
        );
    }

    group.stop();
    group.join();
}
