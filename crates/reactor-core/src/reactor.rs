use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use reactor_util::safe_assert;

use crate::event::{CallbackStatus, EventCallback, EventFlags, EventHandle, EventId, EventKind};

const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("event handle is stale or already freed")]
    StaleHandle,
    #[error("wrong event kind for this operation")]
    WrongKind,
    #[error(transparent)]
    Io(#[from] io::Error),
}

enum Slot {
    /// `generation` here is the generation the *next* occupant of this slot
    /// will be stamped with, not the generation of whoever last vacated it.
    Empty { next_free: Option<u32>, generation: u32 },
    Occupied { generation: u32, handle: EventHandle },
}

#[derive(Default)]
struct FdState {
    read: Option<EventId>,
    write: Option<EventId>,
    interest: Option<Interest>,
}

/// Single-threaded event reactor: one [`mio::Poll`] plus three dispatch
/// queues (immediate callbacks, sorted timers, kernel readiness), run via
/// repeated calls to [`Reactor::run_once`].
///
/// Grounded on `fde_runloop()`: each `run_once` call drains due immediate
/// callbacks, then due timers, then blocks in `poll()` for however long is
/// left before the next timer (or forever, if none are armed and the caller
/// passed an unbounded wait).
pub struct Reactor {
    poll: Poll,
    events_buf: Events,
    slots: Vec<Slot>,
    free_head: Option<u32>,
    ready_callbacks: VecDeque<EventId>,
    timers: Vec<EventId>,
    fd_state: HashMap<RawFd, FdState>,
    generation: u64,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Reactor {
            poll: Poll::new()?,
            events_buf: Events::with_capacity(EVENTS_CAPACITY),
            slots: Vec::new(),
            free_head: None,
            ready_callbacks: VecDeque::new(),
            timers: Vec::new(),
            fd_state: HashMap::new(),
            generation: 0,
        })
    }

    /// Handle to the underlying registry, for owners that want to register a
    /// raw source themselves (e.g. to drive a second, reactor-unaware poller
    /// off the same fd set). Most callers never need this; `arm`/`disarm`
    /// cover the common path.
    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Allocate a new, inactive event handle. Must be armed with [`arm`] (for
    /// `Read`/`Write`/`Immediate`) or [`arm_after`] (for `Timer`) before it
    /// will ever fire.
    pub fn create_event(
        &mut self,
        fd: Option<RawFd>,
        kind: EventKind,
        flags: EventFlags,
        callback: EventCallback,
    ) -> EventId {
        let handle = EventHandle::new(fd, kind, flags, callback);
        match self.free_head {
            Some(index) => {
                let (next_free, generation) = match &self.slots[index as usize] {
                    Slot::Empty { next_free, generation } => (*next_free, *generation),
                    Slot::Occupied { .. } => unreachable!("free list pointed at occupied slot"),
                };
                self.free_head = next_free;
                self.slots[index as usize] = Slot::Occupied { generation, handle };
                EventId { index, generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied { generation: 0, handle });
                EventId { index, generation: 0 }
            }
        }
    }

    fn get_handle(&self, id: EventId) -> Option<&EventHandle> {
        match self.slots.get(id.index as usize) {
            Some(Slot::Occupied { generation, handle }) if *generation == id.generation => Some(handle),
            _ => None,
        }
    }

    fn get_handle_mut(&mut self, id: EventId) -> Option<&mut EventHandle> {
        match self.slots.get_mut(id.index as usize) {
            Some(Slot::Occupied { generation, handle }) if *generation == id.generation => Some(handle),
            _ => None,
        }
    }

    pub fn is_active(&self, id: EventId) -> bool {
        self.get_handle(id).is_some_and(|h| h.active)
    }

    /// Arm a `Read`, `Write`, or `Immediate` handle. Idempotent: arming an
    /// already-active handle is a no-op, matching `fde_rw_add`'s
    /// `if (f->is_active) return;` guard.
    pub fn arm(&mut self, id: EventId) -> Result<(), ReactorError> {
        let kind = self.get_handle(id).ok_or(ReactorError::StaleHandle)?.kind;
        match kind {
            EventKind::Read => self.arm_direction(id, true),
            EventKind::Write => self.arm_direction(id, false),
            EventKind::Immediate => {
                let handle = self.get_handle_mut(id).ok_or(ReactorError::StaleHandle)?;
                if handle.active {
                    return Ok(());
                }
                handle.active = true;
                handle.scheduled_generation = self.generation;
                self.ready_callbacks.push_back(id);
                Ok(())
            }
            EventKind::Timer => Err(ReactorError::WrongKind),
        }
    }

    /// Arm a `Timer` handle to fire no earlier than `delay` from now.
    /// Re-arming a still-armed timer repositions it, matching
    /// `fde_add_timeout`'s insertion-sort-on-each-call behavior. Ties are
    /// broken in arming order: a newly (re-)armed timer with the same
    /// deadline as existing ones is inserted after them.
    pub fn arm_after(&mut self, id: EventId, delay: Duration) -> Result<(), ReactorError> {
        let deadline = Instant::now() + delay;
        {
            let handle = self.get_handle_mut(id).ok_or(ReactorError::StaleHandle)?;
            if handle.kind != EventKind::Timer {
                return Err(ReactorError::WrongKind);
            }
            if handle.active {
                self.timers.retain(|&t| t != id);
            }
            handle.active = true;
            handle.deadline = Some(deadline);
        }
        let pos = self
            .timers
            .partition_point(|&t| self.get_handle(t).and_then(|h| h.deadline).unwrap_or(deadline) <= deadline);
        self.timers.insert(pos, id);
        Ok(())
    }

    fn arm_direction(&mut self, id: EventId, is_read: bool) -> Result<(), ReactorError> {
        let handle = self.get_handle(id).ok_or(ReactorError::StaleHandle)?;
        if handle.active {
            return Ok(());
        }
        let fd = handle.fd.expect("Read/Write event handles always carry an fd");

        let entry = self.fd_state.entry(fd).or_default();
        if is_read {
            entry.read = Some(id);
        } else {
            entry.write = Some(id);
        }
        let new_interest = Self::combined_interest(entry.read.is_some(), entry.write.is_some());
        self.reregister_fd(fd, new_interest)?;

        let handle = self.get_handle_mut(id).expect("checked above");
        handle.active = true;
        Ok(())
    }

    fn combined_interest(want_read: bool, want_write: bool) -> Option<Interest> {
        match (want_read, want_write) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn reregister_fd(&mut self, fd: RawFd, new_interest: Option<Interest>) -> Result<(), ReactorError> {
        let entry = self.fd_state.get_mut(&fd).expect("fd_state entry must exist");
        let mut source = SourceFd(&fd);
        match (entry.interest, new_interest) {
            (None, Some(want)) => {
                self.poll.registry().register(&mut source, Token(fd as usize), want)?;
            }
            (Some(had), Some(want)) if had != want => {
                self.poll.registry().reregister(&mut source, Token(fd as usize), want)?;
            }
            (Some(_), None) => {
                self.poll.registry().deregister(&mut source)?;
            }
            _ => {}
        }
        entry.interest = new_interest;
        if new_interest.is_none() {
            self.fd_state.remove(&fd);
        }
        Ok(())
    }

    /// Disarm a handle without freeing it. For `Read`/`Write` this drops the
    /// corresponding interest bit (deregistering the fd entirely if nothing
    /// else needs it); for `Immediate` it pulls the handle out of the ready
    /// queue if it hasn't fired yet; for `Timer` it pulls it out of the
    /// sorted timer list.
    pub fn disarm(&mut self, id: EventId) -> Result<(), ReactorError> {
        let kind = self.get_handle(id).ok_or(ReactorError::StaleHandle)?.kind;
        match kind {
            EventKind::Read => self.disarm_direction(id, true),
            EventKind::Write => self.disarm_direction(id, false),
            EventKind::Immediate => {
                self.ready_callbacks.retain(|&x| x != id);
                if let Some(handle) = self.get_handle_mut(id) {
                    handle.active = false;
                }
                Ok(())
            }
            EventKind::Timer => {
                self.timers.retain(|&x| x != id);
                if let Some(handle) = self.get_handle_mut(id) {
                    handle.active = false;
                    handle.deadline = None;
                }
                Ok(())
            }
        }
    }

    fn disarm_direction(&mut self, id: EventId, is_read: bool) -> Result<(), ReactorError> {
        let handle = self.get_handle(id).ok_or(ReactorError::StaleHandle)?;
        if !handle.active {
            return Ok(());
        }
        let fd = handle.fd.expect("Read/Write event handles always carry an fd");

        if let Some(entry) = self.fd_state.get_mut(&fd) {
            if is_read {
                entry.read = None;
            } else {
                entry.write = None;
            }
            let new_interest = Self::combined_interest(entry.read.is_some(), entry.write.is_some());
            self.reregister_fd(fd, new_interest)?;
        }

        let handle = self.get_handle_mut(id).expect("checked above");
        handle.active = false;
        Ok(())
    }

    /// Free an event handle, disarming it first if needed. Subsequent use of
    /// `id` (or any other handle aliasing the same slot index) is rejected
    /// once the slot's generation has moved on.
    pub fn free_event(&mut self, id: EventId) {
        if self.get_handle(id).is_none() {
            return;
        }
        let _ = self.disarm(id);
        safe_assert!(!self.is_active(id), "disarm must leave a handle inactive before its slot is freed");
        let next_generation = id.generation.wrapping_add(1);
        self.slots[id.index as usize] = Slot::Empty { next_free: self.free_head, generation: next_generation };
        self.free_head = Some(id.index);
    }

    fn dispatch(&mut self, id: EventId, status: CallbackStatus) {
        let Some(mut callback) = self.get_handle_mut(id).and_then(|h| h.callback.take()) else {
            return;
        };
        callback(self, id, status);
        if let Some(handle) = self.get_handle_mut(id) {
            handle.callback = Some(callback);
        }
    }

    /// Run one iteration of the reactor: drain due immediate callbacks, fire
    /// due timers in non-decreasing deadline order, then block in the
    /// kernel's readiness wait for at most `max_wait` (less, if a timer is
    /// due sooner; zero, if anything was scheduled during this very call).
    pub fn run_once(&mut self, max_wait: Duration) -> io::Result<()> {
        let cur_gen = self.generation;
        self.generation = self.generation.wrapping_add(1);

        while let Some(&id) = self.ready_callbacks.front() {
            let due = self.get_handle(id).is_some_and(|h| h.scheduled_generation <= cur_gen);
            if !due {
                break;
            }
            self.ready_callbacks.pop_front();
            if let Some(handle) = self.get_handle_mut(id) {
                handle.active = false;
            }
            self.dispatch(id, CallbackStatus::Completed);
        }

        let now = Instant::now();
        while let Some(&id) = self.timers.first() {
            let due = self.get_handle(id).and_then(|h| h.deadline).is_some_and(|d| d <= now);
            if !due {
                break;
            }
            self.timers.remove(0);
            if let Some(handle) = self.get_handle_mut(id) {
                handle.active = false;
                handle.deadline = None;
            }
            self.dispatch(id, CallbackStatus::Completed);
        }

        let wait_for = if !self.ready_callbacks.is_empty() {
            Duration::ZERO
        } else if let Some(&id) = self.timers.first() {
            let deadline = self.get_handle(id).and_then(|h| h.deadline).unwrap_or_else(|| Instant::now() + max_wait);
            let now = Instant::now();
            if deadline <= now { Duration::ZERO } else { (deadline - now).min(max_wait) }
        } else {
            max_wait
        };

        self.poll.poll(&mut self.events_buf, Some(wait_for))?;

        let mut ready = Vec::with_capacity(self.events_buf.iter().count());
        for ev in self.events_buf.iter() {
            let fd = ev.token().0 as RawFd;
            ready.push((fd, ev.is_readable(), ev.is_writable()));
        }

        for (fd, readable, writable) in ready {
            let Some(state) = self.fd_state.get(&fd) else { continue };
            let read_id = state.read;
            let write_id = state.write;
            if readable {
                if let Some(id) = read_id {
                    self.fire_fd_direction(id, true);
                }
            }
            if writable {
                if let Some(id) = write_id {
                    self.fire_fd_direction(id, false);
                }
            }
        }

        Ok(())
    }

    fn fire_fd_direction(&mut self, id: EventId, is_read: bool) {
        let Some(handle) = self.get_handle(id) else { return };
        if !handle.active {
            return;
        }
        if !handle.is_persist() {
            let _ = self.disarm_direction(id, is_read);
        }
        self.dispatch(id, CallbackStatus::Completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::TcpListener as StdTcpListener;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn immediate_callbacks_run_in_arm_order_and_are_one_shot() {
        let mut reactor = Reactor::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::<u32>::new()));

        let mut ids = Vec::new();
        for i in 0..3 {
            let order = order.clone();
            let id = reactor.create_event(None, EventKind::Immediate, EventFlags::empty(), Box::new(move |_, _, _| {
                order.borrow_mut().push(i);
            }));
            reactor.arm(id).unwrap();
            ids.push(id);
        }

        reactor.run_once(Duration::from_millis(0)).unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);

        // one-shot: a second run_once without re-arming fires nothing more.
        order.borrow_mut().clear();
        reactor.run_once(Duration::from_millis(0)).unwrap();
        assert!(order.borrow().is_empty());
    }

    #[test]
    fn callback_scheduled_during_drain_waits_for_next_run_once() {
        let mut reactor = Reactor::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::<&'static str>::new()));

        let order_for_second = order.clone();
        let second = reactor.create_event(None, EventKind::Immediate, EventFlags::empty(), Box::new(move |_, _, _| {
            order_for_second.borrow_mut().push("second");
        }));

        let order_for_first = order.clone();
        let first = reactor.create_event(None, EventKind::Immediate, EventFlags::empty(), Box::new(move |r, _, _| {
            order_for_first.borrow_mut().push("first");
            r.arm(second).unwrap();
        }));
        reactor.arm(first).unwrap();

        reactor.run_once(Duration::from_millis(0)).unwrap();
        assert_eq!(*order.borrow(), vec!["first"]);

        reactor.run_once(Duration::from_millis(0)).unwrap();
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn timers_fire_in_deadline_order_before_io_wait() {
        let mut reactor = Reactor::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::<u32>::new()));

        let order2 = order.clone();
        let late = reactor.create_event(None, EventKind::Timer, EventFlags::empty(), Box::new(move |_, _, _| {
            order2.borrow_mut().push(20);
        }));
        let order1 = order.clone();
        let early = reactor.create_event(None, EventKind::Timer, EventFlags::empty(), Box::new(move |_, _, _| {
            order1.borrow_mut().push(10);
        }));

        reactor.arm_after(late, Duration::from_millis(0)).unwrap();
        reactor.arm_after(early, Duration::from_millis(0)).unwrap();

        reactor.run_once(Duration::from_millis(5)).unwrap();
        assert_eq!(*order.borrow(), vec![20, 10]);
    }

    #[test]
    fn freed_handle_is_rejected_by_generation_check() {
        let mut reactor = Reactor::new().unwrap();
        let id = reactor.create_event(None, EventKind::Immediate, EventFlags::empty(), Box::new(|_, _, _| {}));
        reactor.free_event(id);
        assert!(!reactor.is_active(id));
        assert!(matches!(reactor.arm(id), Err(ReactorError::StaleHandle)));
    }

    #[test]
    fn read_readiness_fires_on_loopback_connect() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();

        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&listener);
        let id = reactor.create_event(
            Some(fd),
            EventKind::Read,
            EventFlags::empty(),
            Box::new(move |_, _, _| {
                *fired2.borrow_mut() = true;
            }),
        );
        reactor.arm(id).unwrap();

        for _ in 0..20 {
            reactor.run_once(Duration::from_millis(50)).unwrap();
            if *fired.borrow() {
                break;
            }
        }
        assert!(*fired.borrow(), "expected accept-readability to fire");
    }
}
