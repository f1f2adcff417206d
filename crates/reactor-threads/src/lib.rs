//! Pinned worker-thread pool, each running its own [`reactor_core::Reactor`],
//! with a mutex-guarded inbox per worker for cross-thread connection handoff.
//!
//! Grounded on `libiapp_thr_group_*` (`lib/libiapp/thr.c`) for the pool
//! shape and `thrsrv_flowid_to_thread`/`thrsrv_acceptfd` (`src/srv/srv.c`)
//! for flow-id-based steering between workers.

mod flowid;
mod group;
mod inbox;

pub use flowid::{flowid_to_bucket, get_flowid, IP_FLOWID};
pub use group::{Steerer, ThreadGroup, ThreadGroupConfig, WorkerCtx};
pub use inbox::{Inbox, NewFd};
