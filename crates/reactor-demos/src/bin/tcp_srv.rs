//! TCP demo server: one listener per worker thread (`SO_REUSEPORT`), each
//! accepted connection either echoes what it reads or writes continuously
//! for a throughput run, per the `mode` key.
//!
//! Grounded on `original_source/src/srv/srv.c` (thread pool, listener setup,
//! `key=value` CLI) and `conn.c` (`conn_new`/`conn_write_cb`/`client_read_cb`
//! continuous-write loop).

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::process::exit;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;

use reactor_comm::{listen, Comm, CommStatus};
use reactor_shm::{NetBuf, SharedBufferPool};
use reactor_threads::{flowid_to_bucket, get_flowid, NewFd, Steerer, ThreadGroup, ThreadGroupConfig};
use reactor_util::ThreadPriority;

/// Per-worker connection table, keeping each accepted `Comm` alive until its
/// close callback removes it. `Comm`'s own event handles only hold a `Weak`
/// reference back to it (see `reactor-comm`'s doc comment), so something has
/// to own the strong `Rc` -- this is that something, directly analogous to
/// `thr.h`'s `TAILQ_HEAD(, conn) conn_list`.
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
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AllocType {
    Malloc,
    PosixShm,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Mode {
    Echo,
    Throughput,
}

struct ServerConfig {
    num_threads: usize,
    io_size: usize,
    max_num_conns: usize,
    atype: AllocType,
    port: u16,
    do_thread_pin: bool,
    do_fd_affinity: bool,
    mode: Mode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            num_threads: 4,
            io_size: 4096,
            max_num_conns: 1024,
            atype: AllocType::Malloc,
            port: 1667,
            do_thread_pin: false,
            do_fd_affinity: false,
            mode: Mode::Throughput,
        }
    }
}

/// `key=value` demo TCP server.
///
/// Recognized keys: num_threads, io_size, max_num_conns,
/// atype (malloc|posixshm), port, do_thread_pin (0|1), do_fd_affinity (0|1),
/// mode (echo|throughput). Unknown keys abort with exit code 127.
#[derive(Parser)]
#[command(disable_help_flag = true)]
struct Cli {
    #[arg(value_name = "KEY=VALUE")]
    args: Vec<String>,
}

fn parse_config(pairs: &[String]) -> ServerConfig {
    let mut cfg = ServerConfig::default();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            eprintln!("tcp-srv: malformed argument {pair:?}, expected KEY=VALUE");
            exit(127);
        };
        match key {
            "num_threads" => cfg.num_threads = parse_or_exit(key, value),
            "io_size" => cfg.io_size = parse_or_exit(key, value),
            "max_num_conns" => cfg.max_num_conns = parse_or_exit(key, value),
            "port" => cfg.port = parse_or_exit(key, value),
            "do_thread_pin" => cfg.do_thread_pin = parse_or_exit::<u8>(key, value) != 0,
            "do_fd_affinity" => cfg.do_fd_affinity = parse_or_exit::<u8>(key, value) != 0,
            "atype" => {
                cfg.atype = match value {
                    "malloc" => AllocType::Malloc,
                    "posixshm" => AllocType::PosixShm,
                    _ => {
                        eprintln!("tcp-srv: atype must be 'malloc' or 'posixshm', got {value:?}");
                        exit(127);
                    }
                }
            }
            "mode" => {
                cfg.mode = match value {
                    "echo" => Mode::Echo,
                    "throughput" => Mode::Throughput,
                    _ => {
                        eprintln!("tcp-srv: mode must be 'echo' or 'throughput', got {value:?}");
                        exit(127);
                    }
                }
            }
            other => {
                eprintln!("tcp-srv: unknown key {other:?}");
                exit(127);
            }
        }
    }
    cfg
}

fn parse_or_exit<T: std::str::FromStr>(key: &str, value: &str) -> T {
    value.parse().unwrap_or_else(|_| {
        eprintln!("tcp-srv: invalid value for {key}: {value:?}");
        exit(127);
    })
}

#[derive(Default)]
struct Stats {
    total_read: AtomicU64,
    total_written: AtomicU64,
    total_opened: AtomicU64,
    total_closed: AtomicU64,
}

/// Resources a worker needs to finish constructing a connection, whether it
/// was accepted locally or steered in from a sibling's inbox.
struct WorkerState {
    stats: Arc<Stats>,
    pool: Arc<SharedBufferPool>,
    conn_table: Rc<RefCell<ConnTable>>,
    io_size: usize,
    mode: Mode,
    atype: AllocType,
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let cfg = parse_config(&cli.args);

    if cfg.max_num_conns == 0 {
        eprintln!("tcp-srv: max_num_conns must be nonzero");
        exit(127);
    }

    let stats = Arc::new(Stats::default());
    let pool = Arc::new(SharedBufferPool::new(cfg.max_num_conns * cfg.io_size, false).expect("shm pool init"));

    let io_size = cfg.io_size;
    let mode = cfg.mode;
    let atype = cfg.atype;
    let port = cfg.port;
    let do_fd_affinity = cfg.do_fd_affinity;
    let stats_setup = stats.clone();
    let pool_setup = pool.clone();

    let group = ThreadGroup::spawn(
        ThreadGroupConfig {
            n_threads: cfg.num_threads,
            core_ids: if cfg.do_thread_pin { (0..cfg.num_threads).collect() } else { Vec::new() },
            priority: ThreadPriority::OSDefault,
            drain_interval: std::time::Duration::from_millis(100),
        },
        move |ctx| {
            let stats = stats_setup.clone();
            let pool = pool_setup.clone();
            let conn_table: Rc<RefCell<ConnTable>> = Rc::new(RefCell::new(ConnTable::default()));
            let steerer = ctx.steerer();

            let v4_listen = listen(
                ctx.reactor,
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
                1024,
                make_accept_cb(
                    stats.clone(),
                    pool.clone(),
                    io_size,
                    mode,
                    atype,
                    conn_table.clone(),
                    do_fd_affinity,
                    steerer.clone(),
                ),
            );
            match v4_listen {
                Ok(comm) => {
                    comm.borrow_mut().mark_nonclose();
                    conn_table.borrow_mut().insert(comm);
                }
                Err(err) => tracing::error!(?err, "failed to bind IPv4 listener"),
            }

            let v6_listen = listen(
                ctx.reactor,
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
                1024,
                make_accept_cb(
                    stats.clone(),
                    pool.clone(),
                    io_size,
                    mode,
                    atype,
                    conn_table.clone(),
                    do_fd_affinity,
                    steerer,
                ),
            );
            match v6_listen {
                Ok(comm) => {
                    comm.borrow_mut().mark_nonclose();
                    conn_table.borrow_mut().insert(comm);
                }
                Err(err) => tracing::debug!(?err, "IPv6 listener unavailable"),
            }

            WorkerState { stats, pool, conn_table, io_size, mode, atype }
        },
        move |ctx, state, newfd| {
            // A sibling worker's accept callback steered this fd here because
            // its flow id mapped to this worker's bucket; finish constructing
            // the connection exactly as a local accept would have.
            tracing::debug!(fd = newfd.fd, flowid = newfd.flowid, worker = ctx.id, "steered connection arrived");
            accept_new_conn(ctx.reactor, newfd.fd, &state.stats, &state.pool, state.io_size, state.mode, state.atype, &state.conn_table);
        },
    )
    .expect("failed to start worker threads");

    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let running_hdl = running.clone();
    ctrlc::set_handler(move || running_hdl.store(false, Ordering::SeqCst)).ok();

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(500));
        tracing::info!(
            opened = stats.total_opened.load(Ordering::Relaxed),
            closed = stats.total_closed.load(Ordering::Relaxed),
            read = stats.total_read.load(Ordering::Relaxed),
            written = stats.total_written.load(Ordering::Relaxed),
            "tcp-srv stats"
        );
    }

    group.stop();
    group.join();
}

/// Builds an `AcceptCallback` for one listener. When `do_fd_affinity` is set,
/// the accepted fd's kernel flow id is read and mapped to a worker bucket; a
/// fd whose bucket isn't this worker is handed to `steerer` instead of being
/// served locally, matching `thrsrv_acceptfd`'s `thr_id != app_id` handoff.
#[allow(clippy::too_many_arguments)]
fn make_accept_cb(
    stats: Arc<Stats>,
    pool: Arc<SharedBufferPool>,
    io_size: usize,
    mode: Mode,
    atype: AllocType,
    conn_table: Rc<RefCell<ConnTable>>,
    do_fd_affinity: bool,
    steerer: Steerer,
) -> reactor_comm::AcceptCallback {
    Box::new(move |reactor, res| {
        let (fd, _peer) = match res {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(?err, "accept failed");
                return;
            }
        };

        if do_fd_affinity {
            match get_flowid(fd) {
                Ok(flowid) => {
                    if let Some(bucket) = flowid_to_bucket(flowid, steerer.n_workers()) {
                        if bucket != steerer.id() {
                            tracing::debug!(fd, flowid, bucket, "steering accepted connection to owning worker");
                            steerer.steer_to(bucket, NewFd { fd, flowid });
                            return;
                        }
                    }
                }
                Err(err) => tracing::debug!(?err, fd, "failed to read flow id, keeping connection local"),
            }
        }

        accept_new_conn(reactor, fd, &stats, &pool, io_size, mode, atype, &conn_table);
    })
}

/// Finishes constructing a connection from a freshly accepted (or steered-in)
/// fd: wires up the echo/throughput read loop, registers it in the worker's
/// connection table, and arms the stats-on-close callback.
#[allow(clippy::too_many_arguments)]
fn accept_new_conn(
    reactor: &mut reactor_core::Reactor,
    fd: RawFd,
    stats: &Arc<Stats>,
    pool: &Arc<SharedBufferPool>,
    io_size: usize,
    mode: Mode,
    atype: AllocType,
    conn_table: &Rc<RefCell<ConnTable>>,
) {
    stats.total_opened.fetch_add(1, Ordering::Relaxed);
    let comm = Comm::with_fd(fd);

    {
        let mut comm_ref = comm.borrow_mut();
        match mode {
            Mode::Echo => start_echo(reactor, &mut comm_ref, stats.clone(), io_size),
            Mode::Throughput => start_throughput(reactor, &mut comm_ref, stats.clone(), pool.clone(), io_size, atype),
        }
    }

    let conn_id = conn_table.borrow_mut().insert(comm.clone());
    let stats_close = stats.clone();
    let conn_table_close = conn_table.clone();
    comm.borrow_mut().set_close_callback(Box::new(move |_status| {
        stats_close.total_closed.fetch_add(1, Ordering::Relaxed);
        conn_table_close.borrow_mut().remove(conn_id);
    }));
}

// These helpers take `&mut Comm` rather than the owning `Rc<RefCell<Comm>>`
// and thread that same reference through every completion callback. Comm's
// callbacks are always invoked with a live `&mut Comm` already in hand;
// re-borrowing the `Rc` from inside one of its own callbacks would double-
// borrow the `RefCell` backing it and panic.

fn start_echo(reactor: &mut reactor_core::Reactor, comm: &mut Comm, stats: Arc<Stats>, io_size: usize) {
    comm.read(
        reactor,
        vec![0u8; io_size],
        Box::new(move |comm_inner, reactor, buf, n, status| match status {
            CommStatus::Completed => {
                stats.total_read.fetch_add(n as u64, Ordering::Relaxed);
                let stats_write = stats.clone();
                comm_inner.write(
                    reactor,
                    buf[..n].to_vec(),
                    Box::new(move |comm_inner2, reactor, _buf, n, status| {
                        if matches!(status, CommStatus::Completed) {
                            stats_write.total_written.fetch_add(n as u64, Ordering::Relaxed);
                            start_echo(reactor, comm_inner2, stats_write.clone(), io_size);
                        } else {
                            comm_inner2.close(reactor);
                        }
                    }),
                );
            }
            _ => {
                comm_inner.close(reactor);
            }
        }),
    );
}

fn start_throughput(
    reactor: &mut reactor_core::Reactor,
    comm: &mut Comm,
    stats: Arc<Stats>,
    pool: Arc<SharedBufferPool>,
    io_size: usize,
    atype: AllocType,
) {
    let mut nb = match atype {
        AllocType::PosixShm => NetBuf::shm(pool.clone(), io_size),
        AllocType::Malloc => NetBuf::heap(io_size),
    };
    for (i, byte) in nb.as_mut_slice().iter_mut().enumerate() {
        *byte = b'0' + (i % 10) as u8;
    }
    write_throughput_chunk(reactor, comm, stats, pool, io_size, atype, nb);
}

#[allow(clippy::too_many_arguments)]
fn write_throughput_chunk(
    reactor: &mut reactor_core::Reactor,
    comm: &mut Comm,
    stats: Arc<Stats>,
    pool: Arc<SharedBufferPool>,
    io_size: usize,
    atype: AllocType,
    nb: NetBuf,
) {
    comm.write(
        reactor,
        nb.as_slice().to_vec(),
        Box::new(move |comm_inner, reactor, _buf, n, status| {
            if matches!(status, CommStatus::Completed) {
                stats.total_written.fetch_add(n as u64, Ordering::Relaxed);
                let nb = match atype {
                    AllocType::PosixShm => NetBuf::shm(pool.clone(), io_size),
                    AllocType::Malloc => NetBuf::heap(io_size),
                };
                write_throughput_chunk(reactor, comm_inner, stats.clone(), pool.clone(), io_size, atype, nb);
            } else {
                comm_inner.close(reactor);
            }
        }),
    );
}
