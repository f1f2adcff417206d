use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use reactor_core::{EventFlags, EventId, EventKind, Reactor};
use reactor_util::{thread_boot, ThreadPriority};

use crate::inbox::{Inbox, NewFd};

/// Borrowed view a worker's setup/drain callbacks get of their own thread's
/// state: the reactor driving it, its own inbox, and a way to hand a
/// just-accepted connection off to a sibling worker.
pub struct WorkerCtx<'a> {
    pub id: usize,
    pub reactor: &'a mut Reactor,
    inboxes: &'a [Arc<Inbox>],
}

impl<'a> WorkerCtx<'a> {
    pub fn n_workers(&self) -> usize {
        self.inboxes.len()
    }

    /// Hand a connection to another worker's inbox. A no-op if `worker` names
    /// this same worker or is out of range.
    pub fn steer_to(&self, worker: usize, item: NewFd) {
        if worker == self.id {
            return;
        }
        if let Some(inbox) = self.inboxes.get(worker) {
            inbox.push(item);
        }
    }

    /// A clonable handle carrying just enough of this `WorkerCtx` to steer a
    /// connection from a callback that outlives the `WorkerCtx` borrow that
    /// created it -- a `Comm` accept callback fires later, from inside
    /// `Reactor::run_once`, long after `setup`'s `&mut WorkerCtx` has gone out
    /// of scope, so it can only reach the inbox list via a handle captured
    /// ahead of time.
    pub fn steerer(&self) -> Steerer {
        Steerer { id: self.id, inboxes: self.inboxes.into() }
    }
}

/// See [`WorkerCtx::steerer`].
#[derive(Clone)]
pub struct Steerer {
    id: usize,
    inboxes: Arc<[Arc<Inbox>]>,
}

impl Steerer {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn n_workers(&self) -> usize {
        self.inboxes.len()
    }

    /// Hand a connection to another worker's inbox. A no-op if `worker` names
    /// this same worker or is out of range.
    pub fn steer_to(&self, worker: usize, item: NewFd) {
        if worker == self.id {
            return;
        }
        if let Some(inbox) = self.inboxes.get(worker) {
            inbox.push(item);
        }
    }
}

type SetupFn<W> = dyn Fn(&mut WorkerCtx) -> W + Send + Sync;
type NewFdFn<W> = dyn Fn(&mut WorkerCtx, &mut W, NewFd) + Send + Sync;

pub struct ThreadGroupConfig {
    pub n_threads: usize,
    /// Core to pin worker `i` to, if any. Shorter than `n_threads` leaves the
    /// remaining workers unpinned.
    pub core_ids: Vec<usize>,
    pub priority: ThreadPriority,
    /// How often each worker drains its inbox when otherwise idle.
    pub drain_interval: Duration,
}

impl Default for ThreadGroupConfig {
    fn default() -> Self {
        ThreadGroupConfig {
            n_threads: 1,
            core_ids: Vec::new(),
            priority: ThreadPriority::OSDefault,
            drain_interval: Duration::from_millis(100),
        }
    }
}

/// A pool of pinned worker threads, each running its own [`Reactor`] and
/// reachable from the others through a per-worker [`Inbox`].
///
/// Grounded on `libiapp_thr_group_*`: one `fde_head`/`Reactor` per thread,
/// `pthread_create` per worker matched here by `std::thread::spawn`, and
/// `pthread_setaffinity_np` matched by `reactor-util`'s `thread_boot`.
pub struct ThreadGroup {
    inboxes: Vec<Arc<Inbox>>,
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl ThreadGroup {
    /// Spawn `config.n_threads` workers. `setup` runs once per worker before
    /// its run loop starts (register listeners, arm initial timers) and
    /// returns whatever per-worker state `on_newfd` needs later (a
    /// connection table, stats handles, ...); `on_newfd` runs once per item
    /// drained from that worker's inbox, with that same state passed back in.
    pub fn spawn<W, S, N>(config: ThreadGroupConfig, setup: S, on_newfd: N) -> io::Result<ThreadGroup>
    where
        W: 'static,
        S: Fn(&mut WorkerCtx) -> W + Send + Sync + 'static,
        N: Fn(&mut WorkerCtx, &mut W, NewFd) + Send + Sync + 'static,
    {
        let inboxes: Vec<Arc<Inbox>> = (0..config.n_threads).map(|_| Arc::new(Inbox::new())).collect();
        let stop = Arc::new(AtomicBool::new(false));
        let setup: Arc<SetupFn<W>> = Arc::new(setup);
        let on_newfd: Arc<NewFdFn<W>> = Arc::new(on_newfd);

        let mut handles = Vec::with_capacity(config.n_threads);
        for id in 0..config.n_threads {
            let inboxes = inboxes.clone();
            let stop = stop.clone();
            let setup = setup.clone();
            let on_newfd = on_newfd.clone();
            let core = config.core_ids.get(id).copied();
            let priority = config.priority;
            let drain_interval = config.drain_interval;

            let handle = std::thread::Builder::new()
                .name(format!("reactor-worker-{id}"))
                .spawn(move || worker_main(id, inboxes, stop, setup, on_newfd, core, priority, drain_interval))
                .map_err(io::Error::other)?;
            handles.push(handle);
        }

        Ok(ThreadGroup { inboxes, handles, stop })
    }

    pub fn inbox(&self, worker: usize) -> &Arc<Inbox> {
        &self.inboxes[worker]
    }

    pub fn n_workers(&self) -> usize {
        self.inboxes.len()
    }

    /// Ask every worker to stop at its next drain tick. Does not block; call
    /// [`join`](ThreadGroup::join) afterward to wait for them to exit.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_main<W: 'static>(
    id: usize,
    inboxes: Vec<Arc<Inbox>>,
    stop: Arc<AtomicBool>,
    setup: Arc<SetupFn<W>>,
    on_newfd: Arc<NewFdFn<W>>,
    core: Option<usize>,
    priority: ThreadPriority,
    drain_interval: Duration,
) {
    thread_boot(core, priority);

    let mut reactor = match Reactor::new() {
        Ok(r) => r,
        Err(err) => {
            tracing::error!(?err, worker = id, "failed to create reactor for worker thread");
            return;
        }
    };

    let state = {
        let mut ctx = WorkerCtx { id, reactor: &mut reactor, inboxes: &inboxes };
        setup(&mut ctx)
    };
    let state = Rc::new(RefCell::new(state));

    let drain_timer =
        arm_drain_timer(&mut reactor, id, inboxes.clone(), on_newfd.clone(), stop.clone(), drain_interval, state);

    while !stop.load(Ordering::SeqCst) {
        if let Err(err) = reactor.run_once(drain_interval) {
            tracing::error!(?err, worker = id, "reactor run_once failed");
            break;
        }
    }

    reactor.free_event(drain_timer);
}

/// Drains the worker's inbox from a periodic timer rather than a blocking
/// read, so a worker idle on I/O still picks up steered connections within
/// one `drain_interval`. `Reactor`'s own callback type carries no `Send`
/// bound (it only ever runs on the thread that owns the reactor), so `state`
/// can live behind a plain `Rc<RefCell<_>>` rather than needing its own
/// synchronization.
fn arm_drain_timer<W: 'static>(
    reactor: &mut Reactor,
    id: usize,
    inboxes: Vec<Arc<Inbox>>,
    on_newfd: Arc<NewFdFn<W>>,
    stop: Arc<AtomicBool>,
    drain_interval: Duration,
    state: Rc<RefCell<W>>,
) -> EventId {
    let timer_id = reactor.create_event(
        None,
        EventKind::Timer,
        EventFlags::empty(),
        Box::new(move |reactor, self_id, _status| {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            let inbox = &inboxes[id];
            for item in inbox.drain() {
                let mut ctx = WorkerCtx { id, reactor, inboxes: &inboxes };
                on_newfd(&mut ctx, &mut state.borrow_mut(), item);
            }
            let _ = reactor.arm_after(self_id, drain_interval);
        }),
    );
    let _ = reactor.arm_after(timer_id, drain_interval);
    timer_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn cross_thread_steer_delivers_to_target_inbox() {
        let delivered = Arc::new(StdMutex::new(Vec::<(usize, i32)>::new()));
        let delivered_cb = delivered.clone();
        let setup_runs = Arc::new(AtomicUsize::new(0));
        let setup_runs_cb = setup_runs.clone();

        let group = ThreadGroup::spawn(
            ThreadGroupConfig { n_threads: 2, drain_interval: Duration::from_millis(10), ..Default::default() },
            move |ctx| {
                setup_runs_cb.fetch_add(1, Ordering::SeqCst);
                if ctx.id == 0 {
                    ctx.steer_to(1, NewFd { fd: 42, flowid: 7 });
                }
            },
            move |ctx, (), item| {
                delivered_cb.lock().unwrap().push((ctx.id, item.fd));
            },
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(150));
        group.stop();
        group.join();

        assert_eq!(setup_runs.load(Ordering::SeqCst), 2);
        let got = delivered.lock().unwrap();
        assert!(got.contains(&(1, 42)));
    }

    #[test]
    fn steerer_survives_beyond_setup_borrow_and_still_steers() {
        let delivered = Arc::new(StdMutex::new(Vec::<(usize, i32)>::new()));
        let delivered_cb = delivered.clone();

        let group = ThreadGroup::spawn(
            ThreadGroupConfig { n_threads: 2, drain_interval: Duration::from_millis(10), ..Default::default() },
            move |ctx| {
                let steerer = ctx.steerer();
                if ctx.id == 0 {
                    let steerer_fire = steerer.clone();
                    let ev = ctx.reactor.create_event(
                        None,
                        EventKind::Immediate,
                        EventFlags::empty(),
                        Box::new(move |_reactor, _id, _status| {
                            steerer_fire.steer_to(1, NewFd { fd: 99, flowid: 3 });
                        }),
                    );
                    let _ = ctx.reactor.arm(ev);
                }
                steerer
            },
            move |ctx, _steerer, item| {
                delivered_cb.lock().unwrap().push((ctx.id, item.fd));
            },
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(150));
        group.stop();
        group.join();

        let got = delivered.lock().unwrap();
        assert!(got.contains(&(1, 99)));
    }
}
