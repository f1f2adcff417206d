//! TCP demo client / load generator: each worker thread independently ramps
//! up to `numconns` outbound connections at up to `connrate` new connections
//! per 100ms tick, then drives a continuous read loop and a continuous
//! write loop (a repeating digit pattern) on every connection it opens.
//!
//! Grounded on `original_source/src/clt/clt.c` (`conn_new`/`conn_connect_cb`/
//! `conn_read_cb`/`conn_write_cb`/`thrclt_ev_newconn_cb`/`thrclt_new`). The
//! original leaves its `comm_write` call commented out, making the demo
//! read-only; a load generator that never sends anything isn't much of a
//! load generator, so this version drives both directions -- see DESIGN.md.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::process::exit;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use reactor_comm::{Comm, CommStatus};
use reactor_core::{EventFlags, EventKind, Reactor};
use reactor_threads::{ThreadGroup, ThreadGroupConfig, WorkerCtx};
use reactor_util::ThreadPriority;

#[derive(Default)]
struct ConnTable {
    next_id: u64,
    conns: HashMap<u64, Rc<RefCell<Comm>>>,
}

impl ConnTable {
    fn insert(&mut self, comm: Rc<RefCell<Comm>>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.conns.insert(id, comm);
        id
    }

    fn remove(&mut self, id: u64) {
        self.conns.remove(&id);
    }

    fn len(&self) -> usize {
        self.conns.len()
    }
}

struct ClientConfig {
    num_threads: usize,
    num_conns: usize,
    connrate: usize,
    bufsize: usize,
    remote_addr: SocketAddr,
}

/// Positional demo client CLI: `numthreads numconns connrate bufsize
/// remote_host remote_port`. Parsed manually (not via clap's typed
/// positionals) so that a malformed value exits 127 like the original's
/// `usage()` path, rather than clap's own usage-error exit code.
#[derive(Parser)]
#[command(disable_help_flag = true)]
struct Cli {
    args: Vec<String>,
}

fn usage() -> ! {
    eprintln!("Usage: tcp-clt <numthreads> <numconns> <connrate> <bufsize> <remote_host> <remote_port>");
    exit(127);
}

fn parse_or_exit<T: std::str::FromStr>(what: &str, value: &str) -> T {
    value.parse().unwrap_or_else(|_| {
        eprintln!("tcp-clt: invalid {what}: {value:?}");
        exit(127);
    })
}

fn parse_config(args: &[String]) -> ClientConfig {
    if args.len() < 6 {
        usage();
    }
    let num_threads = parse_or_exit("numthreads", &args[0]);
    let num_conns = parse_or_exit("numconns", &args[1]);
    let connrate = parse_or_exit("connrate", &args[2]);
    let bufsize = parse_or_exit("bufsize", &args[3]);
    let remote_ip: IpAddr = parse_or_exit("remote_host", &args[4]);
    let remote_port: u16 = parse_or_exit("remote_port", &args[5]);
    ClientConfig { num_threads, num_conns, connrate, bufsize, remote_addr: SocketAddr::new(remote_ip, remote_port) }
}

#[derive(Default)]
struct Stats {
    total_read: AtomicU64,
    total_written: AtomicU64,
    total_opened: AtomicU64,
    total_closed: AtomicU64,
    active: AtomicUsize,
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let cfg = parse_config(&cli.args);

    if cfg.num_conns == 0 || cfg.connrate == 0 || cfg.bufsize == 0 {
        eprintln!("tcp-clt: numconns, connrate and bufsize must all be nonzero");
        exit(127);
    }

    let stats = Arc::new(Stats::default());
    let stats_setup = stats.clone();
    let remote_addr = cfg.remote_addr;
    let num_conns = cfg.num_conns;
    let connrate = cfg.connrate;
    let bufsize = cfg.bufsize;

    let group = ThreadGroup::spawn(
        ThreadGroupConfig { n_threads: cfg.num_threads, priority: ThreadPriority::OSDefault, ..Default::default() },
        move |ctx| {
            let conn_table: Rc<RefCell<ConnTable>> = Rc::new(RefCell::new(ConnTable::default()));
            arm_newconn_timer(ctx, conn_table, stats_setup.clone(), remote_addr, num_conns, connrate, bufsize);
        },
        move |_ctx, (), newfd| {
            tracing::debug!(fd = newfd.fd, flowid = newfd.flowid, "tcp-clt ignoring unexpected steered fd");
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
            active = stats.active.load(Ordering::Relaxed),
            opened = stats.total_opened.load(Ordering::Relaxed),
            closed = stats.total_closed.load(Ordering::Relaxed),
            read = stats.total_read.load(Ordering::Relaxed),
            written = stats.total_written.load(Ordering::Relaxed),
            "tcp-clt stats"
        );
    }

    group.stop();
    group.join();
}

#[allow(clippy::too_many_arguments)]
fn arm_newconn_timer(
    ctx: &mut WorkerCtx,
    conn_table: Rc<RefCell<ConnTable>>,
    stats: Arc<Stats>,
    remote_addr: SocketAddr,
    num_conns: usize,
    connrate: usize,
    bufsize: usize,
) {
    let timer_id = ctx.reactor.create_event(
        None,
        EventKind::Timer,
        EventFlags::empty(),
        Box::new(move |reactor, self_id, _status| {
            let mut opened_this_tick = 0;
            while conn_table.borrow().len() < num_conns && opened_this_tick < connrate {
                open_one_conn(reactor, &conn_table, &stats, remote_addr, bufsize);
                opened_this_tick += 1;
            }
            let _ = reactor.arm_after(self_id, Duration::from_millis(100));
        }),
    );
    let _ = ctx.reactor.arm_after(timer_id, Duration::from_millis(0));
}

fn open_one_conn(reactor: &mut Reactor, conn_table: &Rc<RefCell<ConnTable>>, stats: &Arc<Stats>, remote_addr: SocketAddr, bufsize: usize) {
    let conn_table_cb = conn_table.clone();
    let stats_cb = stats.clone();
    let comm = match Comm::connect(
        reactor,
        remote_addr,
        Box::new(move |comm, reactor, status| match status {
            CommStatus::Completed => {
                stats_cb.total_opened.fetch_add(1, Ordering::Relaxed);
                start_read_loop(reactor, comm, stats_cb.clone(), bufsize);
                start_write_loop(reactor, comm, stats_cb.clone(), pattern_buf(bufsize));
            }
            _ => {
                comm.close(reactor);
            }
        }),
    ) {
        Ok(comm) => comm,
        Err(err) => {
            tracing::warn!(?err, "connect() setup failed");
            return;
        }
    };

    let conn_id = conn_table.borrow_mut().insert(comm.clone());
    stats.active.fetch_add(1, Ordering::Relaxed);
    let stats_close = stats.clone();
    comm.borrow_mut().set_close_callback(Box::new(move |_status| {
        stats_close.total_closed.fetch_add(1, Ordering::Relaxed);
        stats_close.active.fetch_sub(1, Ordering::Relaxed);
        conn_table_cb.borrow_mut().remove(conn_id);
    }));
}

fn pattern_buf(size: usize) -> Vec<u8> {
    (0..size).map(|i| b'0' + (i % 10) as u8).collect()
}

fn start_read_loop(reactor: &mut Reactor, comm: &mut Comm, stats: Arc<Stats>, bufsize: usize) {
    comm.read(
        reactor,
        vec![0u8; bufsize],
        Box::new(move |comm, reactor, _buf, n, status| match status {
            CommStatus::Completed => {
                stats.total_read.fetch_add(n as u64, Ordering::Relaxed);
                start_read_loop(reactor, comm, stats.clone(), bufsize);
            }
            CommStatus::Closing => {}
            _ => comm.close(reactor),
        }),
    );
}

fn start_write_loop(reactor: &mut Reactor, comm: &mut Comm, stats: Arc<Stats>, buf: Vec<u8>) {
    comm.write(
        reactor,
        buf,
        Box::new(move |comm, reactor, buf, n, status| match status {
            CommStatus::Completed => {
                stats.total_written.fetch_add(n as u64, Ordering::Relaxed);
                start_write_loop(reactor, comm, stats.clone(), buf);
            }
            CommStatus::Closing => {}
            _ => comm.close(reactor),
        }),
    );
}
