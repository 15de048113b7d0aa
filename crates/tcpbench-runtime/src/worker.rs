//! The per-thread worker loop, grounded on `app/server/worker.hpp`/`.cpp`: one reactor, one
//! connection slab, one bounded task inbox. Generic over the reactor backend so the same
//! loop drives both `tcpbench-uring` and `tcpbench-epoll`.

use crossbeam_queue::ArrayQueue;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tcpbench_core::{Reactor, Result};

use crate::conn_slab::ConnSlab;
use crate::connection::Connection;

/// Connections are reference-counted and interior-mutable because completion handlers
/// registered against the reactor (which runs outside `Worker`'s own borrow) need to reach
/// the same connection the slab tracks for iteration/lifecycle bookkeeping.
pub type SharedConnection = Rc<RefCell<Connection>>;

/// A unit of cross-thread work posted into a worker's inbox. Boxed `FnOnce` rather than an
/// enum of concrete variants, since the acceptor thread, the HUD thread, and signal-driven
/// shutdown all need to post fundamentally different closures.
pub type WorkerTask<R, C = Connection> = Box<dyn FnOnce(&mut Worker<R, C>) + Send>;

/// Amortises wakeup overhead in busy-spin mode: `poll()` runs this many times per loop
/// iteration before checking the shutdown flag and draining tasks again.
const BUSY_SPIN_BATCH: usize = 1000;

/// `C` defaults to the server-side framing `Connection`; the client pacer instantiates
/// `Worker<R, ClientConn>` instead, reusing the same reactor/inbox/slab plumbing for a
/// connection type with no framing state at all.
pub struct Worker<R, C = Connection> {
    pub reactor: R,
    pub connections: ConnSlab<Rc<RefCell<C>>>,
    tasks: Arc<ArrayQueue<WorkerTask<R, C>>>,
    shutdown: Arc<AtomicBool>,
    busy_spin: bool,
}

impl<R: Reactor, C> Worker<R, C> {
    pub fn new(reactor: R, task_capacity: usize, shutdown: Arc<AtomicBool>, busy_spin: bool) -> Self {
        Self {
            reactor,
            connections: ConnSlab::new(),
            tasks: Arc::new(ArrayQueue::new(task_capacity)),
            shutdown,
            busy_spin,
        }
    }

    /// A cloneable, `Send` handle other threads use to post tasks into this worker. Posting
    /// alone does not wake the reactor — pair with a `waker` closure captured at construction
    /// by the caller (e.g. the raw wakeup-fd write), since the reactor types themselves are
    /// `!Send` and cannot be shared across threads directly.
    pub fn inbox(&self) -> WorkerInbox<R, C> {
        WorkerInbox {
            tasks: self.tasks.clone(),
        }
    }

    fn drain_tasks(&mut self) {
        while let Some(task) = self.tasks.pop() {
            task(self);
        }
    }

    /// Runs until the shared shutdown flag is observed. Exits within one `poll_wait` timeout
    /// of the flag being set and the reactor being woken (§5 shutdown liveness).
    pub fn run(&mut self) -> Result<()> {
        while !self.shutdown.load(Ordering::Relaxed) {
            if self.busy_spin {
                for _ in 0..BUSY_SPIN_BATCH {
                    self.reactor.poll()?;
                }
            } else {
                self.reactor.poll_wait()?;
            }
            self.drain_tasks();
        }
        // One last drain: a task posted right before shutdown still deserves to run (e.g. a
        // pending metrics request whose requester is blocked on the reply channel).
        self.drain_tasks();
        Ok(())
    }
}

/// Cross-thread handle into one worker's task inbox. `Clone`s share the same bounded queue.
pub struct WorkerInbox<R, C = Connection> {
    tasks: Arc<ArrayQueue<WorkerTask<R, C>>>,
}

impl<R, C> Clone for WorkerInbox<R, C> {
    fn clone(&self) -> Self {
        Self {
            tasks: self.tasks.clone(),
        }
    }
}

impl<R, C> WorkerInbox<R, C> {
    /// Returns the task back to the caller on failure (full inbox) so it can be surfaced as
    /// backpressure rather than silently dropped (§7 error taxonomy).
    pub fn post(&self, task: WorkerTask<R, C>) -> std::result::Result<(), WorkerTask<R, C>> {
        self.tasks.push(task)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct NoopReactor;

    impl Reactor for NoopReactor {
        fn poll(&mut self) -> Result<()> {
            Ok(())
        }
        fn poll_wait(&mut self) -> Result<()> {
            Ok(())
        }
        fn run_for(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
        fn wakeup(&self) {}
    }

    #[test]
    fn run_exits_once_shutdown_flag_is_set() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut worker = Worker::new(NoopReactor, 8, shutdown.clone(), false);
        shutdown.store(true, Ordering::Relaxed);
        assert!(worker.run().is_ok());
    }

    #[test]
    fn posted_task_runs_on_next_drain() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut worker = Worker::new(NoopReactor, 8, shutdown.clone(), false);
        let inbox = worker.inbox();

        inbox
            .post(Box::new(|w: &mut Worker<NoopReactor>| {
                w.connections.insert(Rc::new(RefCell::new(Connection::new(
                    0,
                    Arc::new(tcpbench_core::Counters::default()),
                    1,
                    Box::new(|_| {}),
                ))));
            }))
            .ok()
            .unwrap();

        shutdown.store(true, Ordering::Relaxed);
        worker.run().unwrap();
        assert_eq!(worker.connections.len(), 1);
    }
}
