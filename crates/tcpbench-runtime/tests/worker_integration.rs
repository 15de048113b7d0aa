//! End-to-end exercise of `Worker` + `ConnSlab` + `Connection` wired together the way a real
//! backend wires them, minus the actual reactor: a task posted from "another thread" inserts
//! a connection, feeds it a framed message, and the worker thread observes the counters move.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tcpbench_core::{Counters, Reactor, Result, Sample};
use tcpbench_runtime::{Connection, Worker};

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
fn posted_connection_processes_a_framed_message_and_counts_it() {
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut worker = Worker::new(NoopReactor, 8, shutdown.clone(), false);
    let inbox = worker.inbox();

    let counters = Arc::new(Counters::default());
    let samples: Arc<Mutex<Vec<Sample>>> = Arc::new(Mutex::new(Vec::new()));

    let task_counters = counters.clone();
    let task_samples = samples.clone();
    inbox
        .post(Box::new(move |w: &mut Worker<NoopReactor>| {
            let conn = Connection::new(
                0,
                task_counters,
                1,
                Box::new(move |sample| task_samples.lock().unwrap().push(sample)),
            );
            let idx = w.connections.insert(std::rc::Rc::new(std::cell::RefCell::new(conn)));

            let mut conn_ref = w.connections.get(idx).unwrap().borrow_mut();
            conn_ref.on_bytes(&16u64.to_le_bytes()).unwrap();
            let mut msg = vec![0u8; 16];
            msg[..8].copy_from_slice(&123u64.to_le_bytes());
            let completed = conn_ref.on_bytes(&msg).unwrap();
            assert_eq!(completed, vec![msg]);
        }))
        .ok()
        .unwrap();

    shutdown.store(true, Ordering::Relaxed);
    worker.run().unwrap();

    assert_eq!(worker.connections.len(), 1);
    assert_eq!(counters.snapshot().ops, 2);
    assert_eq!(samples.lock().unwrap().len(), 1);
    assert_eq!(samples.lock().unwrap()[0].send_ts, 123);
}
