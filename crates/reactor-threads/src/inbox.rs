use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

/// A newly-accepted connection handed from one worker to another, along with
/// the flow id that decided the handoff.
#[derive(Debug)]
pub struct NewFd {
    pub fd: RawFd,
    pub flowid: u32,
}

/// Mutex-guarded cross-thread handoff queue, one per worker.
///
/// Grounded on `thrsrv_newfd_enqueue`'s `TAILQ` protected by
/// `newfd_lock`: a worker that decides a just-accepted connection belongs on
/// a different thread pushes it here instead of finishing setup itself; the
/// owning worker drains it on its own schedule.
#[derive(Default)]
pub struct Inbox {
    queue: Mutex<VecDeque<NewFd>>,
}

impl Inbox {
    pub fn new() -> Self {
        Inbox { queue: Mutex::new(VecDeque::new()) }
    }

    pub fn push(&self, item: NewFd) {
        self.queue.lock().unwrap().push_back(item);
    }

    /// Drain everything currently queued. Called from the owning worker's
    /// own thread on its periodic drain tick.
    pub fn drain(&self) -> Vec<NewFd> {
        let mut q = self.queue.lock().unwrap();
        q.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_items_in_push_order_and_empties_queue() {
        let inbox = Inbox::new();
        inbox.push(NewFd { fd: 3, flowid: 1 });
        inbox.push(NewFd { fd: 4, flowid: 2 });

        let drained = inbox.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].fd, 3);
        assert_eq!(drained[1].fd, 4);
        assert!(inbox.drain().is_empty());
    }
}
