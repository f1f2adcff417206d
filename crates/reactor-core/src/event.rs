use std::os::unix::io::RawFd;
use std::time::Instant;

use crate::reactor::Reactor;

bitflags::bitflags! {
    /// Arming options for an [`EventHandle`].
    ///
    /// `PERSIST` mirrors `fde.c`'s distinction between `EV_CLEAR` (persist,
    /// re-armed implicitly by the kernel on the next edge) and `EV_ONESHOT`
    /// (fires once and is deactivated automatically). Only `Read`/`Write`
    /// handles honor it; `Immediate` and `Timer` handles are always one-shot.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventFlags: u8 {
        const PERSIST = 0b0000_0001;
    }
}

/// What kind of source an [`EventHandle`] is dispatched from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Read,
    Write,
    Immediate,
    Timer,
}

/// The status an event handle's callback is invoked with.
///
/// The original carried `NONE`/`COMPLETED`/`ABORTED`/`CLOSING` on `fde_cb_status`,
/// but at the reactor layer (as opposed to the socket state machine layered on
/// top in `reactor-comm`) the only status that is ever actually delivered is
/// `Completed` -- readiness, a fired timer, or a scheduled immediate callback
/// all "completed" in the sense that the reactor is done waiting for them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackStatus {
    Completed,
}

/// Opaque handle to a registered event, stable across arm/disarm cycles.
///
/// Backed by a generational slab index rather than an intrusive list node:
/// `index` names a slot in the reactor's slab and `generation` guards against
/// using a handle whose slot has since been freed and reused by a different
/// registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Callback invoked when an event handle fires.
///
/// Receives the reactor itself (so it can arm/disarm other handles, including
/// freeing its own), the id of the handle that fired, and the status it fired
/// with. Boxed `FnMut` replaces the `fn(fd, eh, void *arg, status)` C calling
/// convention; callers close over whatever state they'd otherwise have passed
/// as `arg`.
pub type EventCallback = Box<dyn FnMut(&mut Reactor, EventId, CallbackStatus)>;

pub(crate) struct EventHandle {
    pub fd: Option<RawFd>,
    pub kind: EventKind,
    pub flags: EventFlags,
    pub active: bool,
    pub deadline: Option<Instant>,
    /// Generation of the reactor's immediate-callback drain that this handle
    /// was scheduled in. A callback armed mid-drain gets stamped with the
    /// *next* generation so it cannot fire until the following `run_once`.
    pub scheduled_generation: u64,
    pub callback: Option<EventCallback>,
}

impl EventHandle {
    pub fn new(fd: Option<RawFd>, kind: EventKind, flags: EventFlags, callback: EventCallback) -> Self {
        EventHandle {
            fd,
            kind,
            flags,
            active: false,
            deadline: None,
            scheduled_generation: 0,
            callback: Some(callback),
        }
    }

    pub fn is_persist(&self) -> bool {
        self.flags.contains(EventFlags::PERSIST)
    }
}
