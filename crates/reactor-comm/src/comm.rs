use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use reactor_core::{EventFlags, EventId, EventKind, Reactor};
use reactor_shm::{NetBuf, SharedBufferPool};
use reactor_util::safe_assert;

use crate::addr::{set_nonblocking, sockaddr_storage_to_socketaddr, socketaddr_to_sockaddr};

/// Outcome an in-flight comm operation's callback is invoked with.
///
/// Mirrors `fde_comm_cb_status`: `Completed` for an ordinary successful
/// syscall, `Eof` for a zero-length read, `Error` for anything else
/// `errno`-bearing, `Closing` when the comm was closed while the operation
/// was still pending (the buffer/frame is handed back so the caller can
/// reuse or drop it), `Aborted` for an op cancelled without ever reaching
/// the kernel.
#[derive(Debug)]
pub enum CommStatus {
    Completed,
    Eof,
    Error(io::Error),
    Closing,
    Aborted,
}

pub type ReadCallback = Box<dyn FnMut(&mut Comm, &mut Reactor, Vec<u8>, usize, CommStatus)>;
pub type WriteCallback = Box<dyn FnMut(&mut Comm, &mut Reactor, Vec<u8>, usize, CommStatus)>;
pub type AcceptCallback = Box<dyn FnMut(&mut Reactor, io::Result<(RawFd, SocketAddr)>)>;
pub type ConnectCallback = Box<dyn FnMut(&mut Comm, &mut Reactor, CommStatus)>;
pub type CloseCallback = Box<dyn FnOnce(CommStatus)>;
pub type UdpReadCallback = Box<dyn FnMut(&mut Comm, &mut Reactor, NetBuf, SocketAddr, CommStatus)>;
pub type UdpWriteCallback = Box<dyn FnMut(&mut Comm, &mut Reactor, NetBuf, CommStatus)>;

#[derive(Default)]
struct ReadSub {
    ready: bool,
    pending: Option<(Vec<u8>, ReadCallback)>,
}

#[derive(Default)]
struct WriteSub {
    ready: bool,
    pending: Option<(Vec<u8>, usize, WriteCallback)>,
}

struct AcceptState {
    cb: AcceptCallback,
}

struct ConnectState {
    addr: SocketAddr,
    cb: ConnectCallback,
}

struct UdpReadState {
    pool: Option<Arc<SharedBufferPool>>,
    frame_size: usize,
    cb: UdpReadCallback,
}

struct UdpWriteState {
    queue: VecDeque<(SocketAddr, NetBuf)>,
    max_qlen: usize,
    is_primed: bool,
    cb: UdpWriteCallback,
}

/// Socket state machine: one fd, any combination of the Read / Write /
/// Accept / Connect / UDP-Read / UDP-Write substates, and a two-latch
/// close/cleanup sequence.
///
/// Grounded on `comm.c`'s `struct fde_comm` and its `comm_cb_*` functions.
/// Always held as `Rc<RefCell<Comm>>` (see [`Comm::with_fd`]): the event
/// handles a `Comm` registers with the reactor close over a `Weak` reference
/// back to it so they can reach it again when the reactor fires them, without
/// creating a reference cycle that would keep it alive past `close`.
pub struct Comm {
    self_ref: Weak<RefCell<Comm>>,
    fd: RawFd,
    is_closing: bool,
    is_cleanup: bool,
    is_nonclose: bool,

    read: ReadSub,
    write: WriteSub,
    accept: Option<AcceptState>,
    connect: Option<ConnectState>,
    udp_read: Option<UdpReadState>,
    udp_write: Option<UdpWriteState>,

    ev_read: Option<EventId>,
    ev_read_cb: Option<EventId>,
    ev_write: Option<EventId>,
    ev_write_cb: Option<EventId>,
    ev_accept: Option<EventId>,
    ev_connect: Option<EventId>,
    ev_connect_start: Option<EventId>,
    ev_udp_read: Option<EventId>,
    ev_udp_write: Option<EventId>,
    ev_cleanup: Option<EventId>,

    close_cb: Option<CloseCallback>,
}

impl Comm {
    /// Wrap an already-open, already-nonblocking fd. Ownership of the fd
    /// passes to the returned `Comm`: it is closed during cleanup unless
    /// [`mark_nonclose`](Comm::mark_nonclose) was called first.
    pub fn with_fd(fd: RawFd) -> Rc<RefCell<Comm>> {
        Rc::new_cyclic(|weak| {
            RefCell::new(Comm {
                self_ref: weak.clone(),
                fd,
                is_closing: false,
                is_cleanup: false,
                is_nonclose: false,
                read: ReadSub::default(),
                write: WriteSub::default(),
                accept: None,
                connect: None,
                udp_read: None,
                udp_write: None,
                ev_read: None,
                ev_read_cb: None,
                ev_write: None,
                ev_write_cb: None,
                ev_accept: None,
                ev_connect: None,
                ev_connect_start: None,
                ev_udp_read: None,
                ev_udp_write: None,
                ev_cleanup: None,
                close_cb: None,
            })
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_closing(&self) -> bool {
        self.is_closing
    }

    /// Exempt this comm from `close()`. Used for listener sockets shared
    /// across workers, matching `comm_mark_nonclose`.
    pub fn mark_nonclose(&mut self) {
        self.is_nonclose = true;
    }

    pub fn set_close_callback(&mut self, cb: CloseCallback) {
        self.close_cb = Some(cb);
    }

    // ---- read -----------------------------------------------------------

    fn ensure_read_evs(&mut self, reactor: &mut Reactor) {
        if self.ev_read.is_none() {
            let w = self.self_ref.clone();
            let id = reactor.create_event(
                Some(self.fd),
                EventKind::Read,
                EventFlags::PERSIST,
                Box::new(move |reactor, _id, _status| {
                    if let Some(rc) = w.upgrade() {
                        rc.borrow_mut().on_read_readiness(reactor);
                    }
                }),
            );
            let _ = reactor.arm(id);
            self.ev_read = Some(id);
        }
        if self.ev_read_cb.is_none() {
            let w = self.self_ref.clone();
            let id = reactor.create_event(
                None,
                EventKind::Immediate,
                EventFlags::empty(),
                Box::new(move |reactor, _id, _status| {
                    if let Some(rc) = w.upgrade() {
                        rc.borrow_mut().do_read(reactor);
                    }
                }),
            );
            self.ev_read_cb = Some(id);
        }
    }

    fn on_read_readiness(&mut self, reactor: &mut Reactor) {
        self.read.ready = true;
        if self.read.pending.is_some() {
            if let Some(id) = self.ev_read_cb {
                let _ = reactor.arm(id);
            }
        }
    }

    /// Issue one `read(2)` against `buf` once the socket is next readable
    /// (immediately, if a readiness edge already arrived and no op was
    /// pending then). Returns `false` if a read is already in flight or the
    /// comm is closing, in which case `buf` and `cb` are dropped by the
    /// caller.
    pub fn read(&mut self, reactor: &mut Reactor, buf: Vec<u8>, cb: ReadCallback) -> bool {
        if self.read.pending.is_some() || self.is_closing {
            return false;
        }
        self.ensure_read_evs(reactor);
        self.read.pending = Some((buf, cb));
        if self.read.ready {
            if let Some(id) = self.ev_read_cb {
                let _ = reactor.arm(id);
            }
        }
        true
    }

    fn do_read(&mut self, reactor: &mut Reactor) {
        let Some((mut buf, mut cb)) = self.read.pending.take() else { return };
        let rc = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if rc > 0 {
            let n = rc as usize;
            cb(self, reactor, buf, n, CommStatus::Completed);
        } else if rc == 0 {
            cb(self, reactor, buf, 0, CommStatus::Eof);
        } else {
            let err = io::Error::last_os_error();
            if is_again(&err) {
                self.read.ready = false;
                self.read.pending = Some((buf, cb));
                return;
            }
            cb(self, reactor, buf, 0, CommStatus::Error(err));
        }
        self.maybe_finish_close(reactor);
    }

    // ---- write ------------------------------------------------------------

    fn ensure_write_evs(&mut self, reactor: &mut Reactor) {
        if self.ev_write.is_none() {
            let w = self.self_ref.clone();
            let id = reactor.create_event(
                Some(self.fd),
                EventKind::Write,
                EventFlags::PERSIST,
                Box::new(move |reactor, _id, _status| {
                    if let Some(rc) = w.upgrade() {
                        rc.borrow_mut().on_write_readiness(reactor);
                    }
                }),
            );
            let _ = reactor.arm(id);
            self.ev_write = Some(id);
        }
        if self.ev_write_cb.is_none() {
            let w = self.self_ref.clone();
            let id = reactor.create_event(
                None,
                EventKind::Immediate,
                EventFlags::empty(),
                Box::new(move |reactor, _id, _status| {
                    if let Some(rc) = w.upgrade() {
                        rc.borrow_mut().do_write(reactor);
                    }
                }),
            );
            self.ev_write_cb = Some(id);
        }
    }

    fn on_write_readiness(&mut self, reactor: &mut Reactor) {
        self.write.ready = true;
        if self.write.pending.is_some() {
            if let Some(id) = self.ev_write_cb {
                let _ = reactor.arm(id);
            }
        }
    }

    /// Issue one `write(2)` of `buf[0..]` once the socket is next writable.
    pub fn write(&mut self, reactor: &mut Reactor, buf: Vec<u8>, cb: WriteCallback) -> bool {
        if self.write.pending.is_some() || self.is_closing {
            return false;
        }
        self.ensure_write_evs(reactor);
        self.write.pending = Some((buf, 0, cb));
        if self.write.ready {
            if let Some(id) = self.ev_write_cb {
                let _ = reactor.arm(id);
            }
        }
        true
    }

    fn do_write(&mut self, reactor: &mut Reactor) {
        let Some((buf, mut offset, mut cb)) = self.write.pending.take() else { return };
        let rc = unsafe { libc::write(self.fd, buf.as_ptr().add(offset).cast(), buf.len() - offset) };
        if rc >= 0 {
            offset += rc as usize;
            if offset >= buf.len() {
                cb(self, reactor, buf, offset, CommStatus::Completed);
            } else {
                // Short write with no error: the kernel's send buffer filled
                // mid-write. Wait for the next writable edge instead of
                // retrying inline -- a busy peer can stay in this state for a
                // while and looping here would just spin.
                self.write.ready = false;
                self.write.pending = Some((buf, offset, cb));
            }
        } else {
            let err = io::Error::last_os_error();
            if is_again(&err) {
                self.write.ready = false;
                self.write.pending = Some((buf, offset, cb));
                return;
            }
            cb(self, reactor, buf, offset, CommStatus::Error(err));
        }
        self.maybe_finish_close(reactor);
    }

    // ---- accept -----------------------------------------------------------

    /// Arm continuous accept handling on a listening fd: drains `accept(2)`
    /// in a loop each time the fd becomes readable, invoking `cb` once per
    /// accepted connection (or once with an error on a hard accept failure),
    /// stopping at `EAGAIN`.
    pub fn listen(&mut self, reactor: &mut Reactor, cb: AcceptCallback) {
        self.accept = Some(AcceptState { cb });
        if self.ev_accept.is_none() {
            let w = self.self_ref.clone();
            let id = reactor.create_event(
                Some(self.fd),
                EventKind::Read,
                EventFlags::PERSIST,
                Box::new(move |reactor, _id, _status| {
                    if let Some(rc) = w.upgrade() {
                        rc.borrow_mut().do_accept_loop(reactor);
                    }
                }),
            );
            let _ = reactor.arm(id);
            self.ev_accept = Some(id);
        }
    }

    fn do_accept_loop(&mut self, reactor: &mut Reactor) {
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let rc = unsafe { libc::accept(self.fd, std::ptr::addr_of_mut!(storage).cast(), &mut len) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if is_again(&err) {
                    return;
                }
                if let Some(state) = self.accept.as_mut() {
                    (state.cb)(reactor, Err(err));
                }
                return;
            }
            let newfd = rc;
            if let Err(err) = set_nonblocking(newfd) {
                tracing::warn!(?err, fd = newfd, "couldn't set accepted socket nonblocking");
            }
            let peer = sockaddr_storage_to_socketaddr(&storage);
            if let Some(state) = self.accept.as_mut() {
                (state.cb)(reactor, Ok((newfd, peer)));
            }
        }
    }

    // ---- connect ------------------------------------------------------------

    /// Open an outbound TCP connection. The fd is created here (matching
    /// `comm_connect`'s ownership of socket creation); `cb` fires once the
    /// connect resolves, successfully or not.
    pub fn connect(reactor: &mut Reactor, addr: SocketAddr, cb: ConnectCallback) -> io::Result<Rc<RefCell<Comm>>> {
        let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
        let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        set_nonblocking(fd)?;

        let comm = Comm::with_fd(fd);
        comm.borrow_mut().connect = Some(ConnectState { addr, cb });

        let w = Rc::downgrade(&comm);
        let id = reactor.create_event(
            None,
            EventKind::Immediate,
            EventFlags::empty(),
            Box::new(move |reactor, _id, _status| {
                if let Some(rc) = w.upgrade() {
                    rc.borrow_mut().do_connect_start(reactor);
                }
            }),
        );
        let _ = reactor.arm(id);
        comm.borrow_mut().ev_connect_start = Some(id);
        Ok(comm)
    }

    fn do_connect_start(&mut self, reactor: &mut Reactor) {
        let Some(state) = self.connect.as_ref() else { return };
        let (sockaddr, len) = socketaddr_to_sockaddr(state.addr);
        let rc = unsafe { libc::connect(self.fd, std::ptr::addr_of!(sockaddr).cast(), len) };
        if rc == 0 {
            self.finish_connect(reactor, CommStatus::Completed);
            return;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            let w = self.self_ref.clone();
            let id = reactor.create_event(
                Some(self.fd),
                EventKind::Write,
                EventFlags::empty(),
                Box::new(move |reactor, _id, _status| {
                    if let Some(rc) = w.upgrade() {
                        rc.borrow_mut().do_connect_poll(reactor);
                    }
                }),
            );
            let _ = reactor.arm(id);
            self.ev_connect = Some(id);
            return;
        }
        self.finish_connect(reactor, CommStatus::Error(err));
    }

    fn do_connect_poll(&mut self, reactor: &mut Reactor) {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(self.fd, libc::SOL_SOCKET, libc::SO_ERROR, std::ptr::addr_of_mut!(err).cast(), &mut len)
        };
        if rc != 0 {
            self.finish_connect(reactor, CommStatus::Error(io::Error::last_os_error()));
        } else if err == 0 {
            self.finish_connect(reactor, CommStatus::Completed);
        } else {
            self.finish_connect(reactor, CommStatus::Error(io::Error::from_raw_os_error(err)));
        }
    }

    fn finish_connect(&mut self, reactor: &mut Reactor, status: CommStatus) {
        if let Some(id) = self.ev_connect.take() {
            reactor.free_event(id);
        }
        if let Some(mut state) = self.connect.take() {
            (state.cb)(self, reactor, status);
        }
    }

    // ---- udp read -----------------------------------------------------------

    /// Arm continuous UDP receiving: each readiness edge drains `recvfrom(2)`
    /// until `EAGAIN`, invoking `cb` once per datagram. `pool` supplies frame
    /// storage from a shared-memory pool; `None` falls back to heap buffers.
    pub fn udp_read(
        &mut self,
        reactor: &mut Reactor,
        pool: Option<Arc<SharedBufferPool>>,
        frame_size: usize,
        cb: UdpReadCallback,
    ) {
        self.udp_read = Some(UdpReadState { pool, frame_size, cb });
        if self.ev_udp_read.is_none() {
            let w = self.self_ref.clone();
            let id = reactor.create_event(
                Some(self.fd),
                EventKind::Read,
                EventFlags::PERSIST,
                Box::new(move |reactor, _id, _status| {
                    if let Some(rc) = w.upgrade() {
                        rc.borrow_mut().do_udp_read_loop(reactor);
                    }
                }),
            );
            let _ = reactor.arm(id);
            self.ev_udp_read = Some(id);
        }
    }

    fn do_udp_read_loop(&mut self, reactor: &mut Reactor) {
        let Some(mut state) = self.udp_read.take() else { return };
        loop {
            let mut nb = match &state.pool {
                Some(pool) => NetBuf::shm(pool.clone(), state.frame_size),
                None => NetBuf::heap(state.frame_size),
            };
            let mut src: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut srclen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let rc = unsafe {
                libc::recvfrom(
                    self.fd,
                    nb.as_mut_slice().as_mut_ptr().cast(),
                    state.frame_size,
                    0,
                    std::ptr::addr_of_mut!(src).cast(),
                    &mut srclen,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if !is_again(&err) {
                    let peer = sockaddr_storage_to_socketaddr(&src);
                    (state.cb)(self, reactor, nb, peer, CommStatus::Error(err));
                }
                break;
            }
            let peer = sockaddr_storage_to_socketaddr(&src);
            (state.cb)(self, reactor, nb, peer, CommStatus::Completed);
            if self.is_closing {
                break;
            }
        }
        if !self.is_closing {
            self.udp_read = Some(state);
        }
    }

    // ---- udp write ------------------------------------------------------------

    /// Register the callback and bound queue length used by every
    /// subsequent [`udp_write`](Comm::udp_write) call. Mirrors
    /// `comm_udp_write_setup`.
    pub fn udp_write_setup(&mut self, reactor: &mut Reactor, max_qlen: usize, cb: UdpWriteCallback) {
        self.udp_write = Some(UdpWriteState { queue: VecDeque::new(), max_qlen, is_primed: false, cb });
        if self.ev_udp_write.is_none() {
            let w = self.self_ref.clone();
            let id = reactor.create_event(
                Some(self.fd),
                EventKind::Write,
                EventFlags::empty(),
                Box::new(move |reactor, _id, _status| {
                    if let Some(rc) = w.upgrade() {
                        rc.borrow_mut().do_udp_write_drain(reactor);
                    }
                }),
            );
            self.ev_udp_write = Some(id);
        }
    }

    /// Queue `frame` for `dest`. On success ownership of `frame` transfers to
    /// the comm; it comes back through the `udp_write_setup` callback once
    /// sent (or failed). On backpressure (queue already at capacity) the
    /// frame is handed straight back in the `Err` -- no callback fires for
    /// it, matching the original's synchronous-failure contract.
    pub fn udp_write(&mut self, reactor: &mut Reactor, dest: SocketAddr, frame: NetBuf) -> Result<(), NetBuf> {
        if self.is_closing {
            return Err(frame);
        }
        let Some(state) = self.udp_write.as_mut() else { return Err(frame) };
        if state.queue.len() >= state.max_qlen {
            return Err(frame);
        }
        state.queue.push_back((dest, frame));
        if !state.is_primed {
            state.is_primed = true;
            if let Some(id) = self.ev_udp_write {
                let _ = reactor.arm(id);
            }
        }
        Ok(())
    }

    fn do_udp_write_drain(&mut self, reactor: &mut Reactor) {
        let Some(mut state) = self.udp_write.take() else { return };
        loop {
            let Some((dest, frame)) = state.queue.pop_front() else { break };
            let n = frame.len();
            let (sockaddr, len) = socketaddr_to_sockaddr(dest);
            let rc = unsafe { libc::sendto(self.fd, frame.as_slice().as_ptr().cast(), n, 0, std::ptr::addr_of!(sockaddr).cast(), len) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if is_again(&err) {
                    state.queue.push_front((dest, frame));
                    break;
                }
                (state.cb)(self, reactor, frame, CommStatus::Error(err));
            } else if rc as usize != n {
                // A short `sendto` isn't a syscall error, but success means the
                // full frame went out; report anything less as an error with
                // no particular `errno` to pin it on.
                (state.cb)(self, reactor, frame, CommStatus::Error(io::Error::from_raw_os_error(0)));
            } else {
                (state.cb)(self, reactor, frame, CommStatus::Completed);
            }
            if self.is_closing {
                break;
            }
        }

        // `close()` invoked from inside one of the callbacks above can't see
        // this drain's locally-held `state` (it was `take()`n at the top of
        // this function), so its own queue-draining pass above finds nothing
        // to do. Finish the job here: every frame still queued at this point
        // gets its callback fired with `Closing` rather than being dropped.
        if self.is_closing {
            while let Some((_, frame)) = state.queue.pop_front() {
                (state.cb)(self, reactor, frame, CommStatus::Closing);
            }
            state.is_primed = false;
            self.udp_write = Some(state);
            return;
        }

        let more_pending = !state.queue.is_empty();
        state.is_primed = more_pending;
        self.udp_write = Some(state);
        if more_pending {
            if let Some(id) = self.ev_udp_write {
                let _ = reactor.arm(id);
            }
        }
    }

    // ---- close / cleanup ------------------------------------------------------

    /// Begin closing the comm. Idempotent, and a no-op if
    /// [`mark_nonclose`](Comm::mark_nonclose) was set. In-flight read/write
    /// operations are told `Closing` immediately; cleanup (freeing every
    /// event handle and closing the fd) happens once nothing is left
    /// in-flight.
    pub fn close(&mut self, reactor: &mut Reactor) {
        if self.is_closing || self.is_nonclose {
            return;
        }
        self.is_closing = true;

        if let Some((buf, mut cb)) = self.read.pending.take() {
            cb(self, reactor, buf, 0, CommStatus::Closing);
        }
        if let Some((buf, offset, mut cb)) = self.write.pending.take() {
            cb(self, reactor, buf, offset, CommStatus::Closing);
        }
        if let Some(mut state) = self.udp_write.take() {
            while let Some((_, frame)) = state.queue.pop_front() {
                (state.cb)(self, reactor, frame, CommStatus::Closing);
            }
        }
        self.udp_read = None;

        self.maybe_finish_close(reactor);
    }

    fn maybe_finish_close(&mut self, reactor: &mut Reactor) {
        if !self.is_closing || self.is_cleanup {
            return;
        }
        if self.read.pending.is_some() || self.write.pending.is_some() {
            return;
        }
        self.start_cleanup(reactor);
    }

    fn start_cleanup(&mut self, reactor: &mut Reactor) {
        safe_assert!(self.ev_cleanup.is_none(), "cleanup must be armed at most once per comm");
        self.is_cleanup = true;
        let w = self.self_ref.clone();
        let id = reactor.create_event(
            None,
            EventKind::Immediate,
            EventFlags::empty(),
            Box::new(move |reactor, _id, _status| {
                if let Some(rc) = w.upgrade() {
                    rc.borrow_mut().do_cleanup(reactor);
                }
            }),
        );
        let _ = reactor.arm(id);
        self.ev_cleanup = Some(id);
    }

    fn do_cleanup(&mut self, reactor: &mut Reactor) {
        for id in [
            self.ev_read,
            self.ev_read_cb,
            self.ev_write,
            self.ev_write_cb,
            self.ev_accept,
            self.ev_connect,
            self.ev_connect_start,
            self.ev_udp_read,
            self.ev_udp_write,
            self.ev_cleanup,
        ] {
            if let Some(id) = id {
                reactor.free_event(id);
            }
        }
        unsafe {
            libc::close(self.fd);
        }
        if let Some(cb) = self.close_cb.take() {
            cb(CommStatus::Completed);
        }
    }
}

fn is_again(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK))
}

fn set_reuseaddr_reuseport(fd: RawFd) {
    unsafe {
        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::addr_of!(one).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            std::ptr::addr_of!(one).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Bind and listen on `addr`, wiring up accept handling through `cb`.
///
/// Sets both `SO_REUSEADDR` and `SO_REUSEPORT` before binding: per §6,
/// reuse-port is required on listeners so that every worker in a thread
/// group can bind the same port independently and let the kernel spread
/// incoming connections across them, rather than one worker owning the
/// fd and fanning accepts out by hand.
pub fn listen(reactor: &mut Reactor, addr: SocketAddr, backlog: i32, cb: AcceptCallback) -> io::Result<Rc<RefCell<Comm>>> {
    let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    set_reuseaddr_reuseport(fd);
    set_nonblocking(fd)?;

    let (sockaddr, len) = socketaddr_to_sockaddr(addr);
    let rc = unsafe { libc::bind(fd, std::ptr::addr_of!(sockaddr).cast(), len) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    let rc = unsafe { libc::listen(fd, backlog) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let comm = Comm::with_fd(fd);
    comm.borrow_mut().listen(reactor, cb);
    Ok(comm)
}

/// Bind a UDP socket for subsequent [`Comm::udp_read`]/[`Comm::udp_write`] use.
pub fn udp_bind(addr: SocketAddr) -> io::Result<Rc<RefCell<Comm>>> {
    udp_bind_inner(addr, false)
}

/// As [`udp_bind`], but sets `SO_REUSEADDR`/`SO_REUSEPORT` first so multiple
/// workers can each bind the same local port and let the kernel load-balance
/// incoming datagrams across them, mirroring the reuse-port requirement
/// `listen` applies to TCP listeners.
pub fn udp_bind_reuseport(addr: SocketAddr) -> io::Result<Rc<RefCell<Comm>>> {
    udp_bind_inner(addr, true)
}

fn udp_bind_inner(addr: SocketAddr, reuseport: bool) -> io::Result<Rc<RefCell<Comm>>> {
    let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let fd = unsafe { libc::socket(domain, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if reuseport {
        set_reuseaddr_reuseport(fd);
    }
    set_nonblocking(fd)?;

    let (sockaddr, len) = socketaddr_to_sockaddr(addr);
    let rc = unsafe { libc::bind(fd, std::ptr::addr_of!(sockaddr).cast(), len) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    Ok(Comm::with_fd(fd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    fn bind_loopback_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();
        (listener, addr)
    }

    #[test]
    fn close_invokes_close_callback_exactly_once() {
        let mut reactor = Reactor::new().unwrap();
        let (listener, _addr) = bind_loopback_listener();
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&listener);
        // Comm takes ownership of fd lifetime management from here; keep the
        // listener itself alive only to hold the OS resource open until Comm
        // closes its duplicate view of the same descriptor table entry.
        let dup_fd = unsafe { libc::dup(fd) };
        assert!(dup_fd >= 0);

        let comm = Comm::with_fd(dup_fd);
        let call_count = Rc::new(Cell::new(0u32));
        let counter = call_count.clone();
        comm.borrow_mut().set_close_callback(Box::new(move |_status| {
            counter.set(counter.get() + 1);
        }));

        comm.borrow_mut().close(&mut reactor);
        // Drain the immediate cleanup event.
        reactor.run_once(Duration::from_millis(10)).unwrap();
        comm.borrow_mut().close(&mut reactor);
        reactor.run_once(Duration::from_millis(10)).unwrap();

        assert_eq!(call_count.get(), 1);
    }

    #[test]
    fn loopback_tcp_echo_roundtrip_via_reactor() {
        let mut reactor = Reactor::new().unwrap();
        let (listener, addr) = bind_loopback_listener();
        let listener_fd = std::os::unix::io::AsRawFd::as_raw_fd(&listener);
        let listener_dup = unsafe { libc::dup(listener_fd) };

        let server_comm = Comm::with_fd(listener_dup);
        let echoed = Rc::new(Cell::new(false));

        let accepted_peer: Rc<RefCell<Option<Rc<RefCell<Comm>>>>> = Rc::new(RefCell::new(None));
        let accepted_peer_cb = accepted_peer.clone();
        let echoed_cb = echoed.clone();
        server_comm.borrow_mut().listen(
            &mut reactor,
            Box::new(move |reactor, res| {
                let (fd, _peer) = res.expect("accept should succeed");
                let peer_comm = Comm::with_fd(fd);
                let peer_for_read = peer_comm.clone();
                let echoed_inner = echoed_cb.clone();
                peer_comm.borrow_mut().read(
                    reactor,
                    vec![0u8; 64],
                    Box::new(move |comm, reactor, buf, n, status| {
                        assert!(matches!(status, CommStatus::Completed));
                        let peer2 = peer_for_read.clone();
                        let echoed_inner2 = echoed_inner.clone();
                        comm.write(
                            reactor,
                            buf[..n].to_vec(),
                            Box::new(move |_comm, _reactor, _buf, _n, status| {
                                assert!(matches!(status, CommStatus::Completed));
                                echoed_inner2.set(true);
                                let _ = &peer2;
                            }),
                        );
                    }),
                );
                *accepted_peer_cb.borrow_mut() = Some(peer_comm);
            }),
        );

        let mut client = TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            reactor.run_once(Duration::from_millis(20)).unwrap();
            use std::io::Write;
            if client.write(b"ping").is_ok() {
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("client never became writable");
            }
        }

        let mut got = [0u8; 64];
        let mut total = 0;
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            reactor.run_once(Duration::from_millis(20)).unwrap();
            use std::io::Read;
            match client.read(&mut got[total..]) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if total >= 4 {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("unexpected read error: {e}"),
            }
            if std::time::Instant::now() > deadline {
                panic!("never received echo");
            }
        }

        assert_eq!(&got[..4], b"ping");
        assert!(echoed.get());
    }
}
