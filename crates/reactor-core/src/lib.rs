//! A small single-threaded-per-worker event reactor.
//!
//! [`Reactor`] owns one [`mio::Poll`] instance and dispatches three kinds of
//! work out of it: immediate (generation-fenced) callbacks, sorted timers,
//! and kernel I/O readiness. Callers register [`EventHandle`]s through
//! [`Reactor::create_event`] and arm/disarm them as their own state machines
//! require; the reactor never allocates or interprets socket state itself.

mod event;
mod reactor;

pub use event::{CallbackStatus, EventCallback, EventFlags, EventId, EventKind};
pub use reactor::{Reactor, ReactorError};
