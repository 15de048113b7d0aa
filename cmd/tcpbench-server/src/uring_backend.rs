//! Wires the io_uring backend together: one `ProvidedBufferPool` and one reactor per worker
//! thread, a dedicated acceptor thread driving a multishot accept, and round-robin dispatch
//! of accepted sockets into worker inboxes.

use std::cell::RefCell;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tcpbench_core::{BenchError, Counters, GroupId, Reactor, Result, Socket};
use tcpbench_metrics::affinity;
use tcpbench_runtime::{Connection, SampleConduit, SampleProducer, Worker, WorkerInbox, WorkerTask};
use tcpbench_uring::{
    Acceptor, BundleSender, ProvidedBufferPool, Receiver, RegisteredBufferPool, UringReactor, UringReactorConfig,
};

use crate::cli::{Cli, Mode};
use crate::waker::make_waker;

/// Records the bundle sender's write-list depth regardless of `--buffer-count`; the registered
/// pool backing sends is sized off the same CLI knob, but the in-flight write list itself is
/// bounded separately since it tracks submissions, not raw buffer slots.
const WRITE_LIST_CAPACITY: usize = 64;

struct WorkerExtras {
    pool: Rc<RefCell<ProvidedBufferPool>>,
    registered_pool: Rc<RefCell<RegisteredBufferPool>>,
    group: GroupId,
    mode: Mode,
    bundle_mode: bool,
    zerocopy: bool,
    read_limit: Option<usize>,
    collect_every_n: u64,
    sample_producer: SampleProducer,
    counters: Arc<Counters>,
    next_conn_id: usize,
    so_rcvbuf: Option<i32>,
    so_sndbuf: Option<i32>,
    active_connections: Arc<AtomicUsize>,
    shutdown_on_disconnect: bool,
    shutdown: Arc<AtomicBool>,
}

/// Marks a connection closed exactly once and, once every connection this process has ever
/// accepted has disconnected, trips the shared shutdown flag if `--shutdown-on-disconnect`
/// was requested (§6 exit codes, §7 remote close).
fn close_connection(
    conn: &Rc<RefCell<Connection>>,
    active_connections: &Arc<AtomicUsize>,
    shutdown_on_disconnect: bool,
    shutdown: &Arc<AtomicBool>,
) {
    if conn.borrow().is_closed() {
        return;
    }
    conn.borrow_mut().mark_closed();
    let remaining = active_connections.fetch_sub(1, Ordering::SeqCst) - 1;
    if shutdown_on_disconnect && remaining == 0 {
        shutdown.store(true, Ordering::Relaxed);
    }
}

thread_local! {
    static EXTRAS: RefCell<Option<WorkerExtras>> = RefCell::new(None);
}

pub struct WorkerHandle {
    pub join: JoinHandle<()>,
    pub counters: Arc<Counters>,
    pub sample_conduit: SampleConduit,
    pub waker: Arc<dyn Fn() + Send + Sync>,
}

pub struct RunHandles {
    pub workers: Vec<WorkerHandle>,
    pub acceptor_join: JoinHandle<()>,
    pub acceptor_waker: Arc<dyn Fn() + Send + Sync>,
}

pub fn run(cli: &Cli, shutdown: Arc<AtomicBool>) -> Result<RunHandles> {
    let (host, port) = super::split_address(&cli.address)?;

    let listener = Socket::new(libc::AF_INET, libc::SOCK_STREAM, 0)?;
    listener.set_reuseaddr(true)?;
    listener.bind(&host, &port)?;
    listener.listen(1024)?;

    let mut worker_inboxes: Vec<WorkerInbox<UringReactor>> = Vec::new();
    let mut worker_wakers: Vec<Arc<dyn Fn() + Send + Sync>> = Vec::new();
    let mut workers = Vec::new();
    let active_connections = Arc::new(AtomicUsize::new(0));

    for idx in 0..cli.workers {
        let thread_shutdown = shutdown.clone();
        let shutdown_for_extras = shutdown.clone();
        let mode = cli.mode;
        let buffer_size = cli.buffer_size;
        let buffer_count = cli.buffer_count.next_power_of_two();
        let busy_spin = cli.busy_spin;
        let uring_depth = cli.uring_depth;
        let collect_every_n = cli.collect_latency_every_n_samples;
        let cpu_id = cli.cpu_id_base + idx;
        let so_rcvbuf = cli.so_rcvbuf;
        let so_sndbuf = cli.so_sndbuf;
        let zerocopy = cli.zerocopy;
        let read_limit = cli.read_limit;
        let shutdown_on_disconnect = cli.shutdown_on_disconnect;
        let active_connections = active_connections.clone();

        let counters = Arc::new(Counters::default());
        let sample_conduit = SampleConduit::new(1 << 16);
        let sample_producer = sample_conduit.producer();
        let worker_counters = counters.clone();

        let (inbox_tx, inbox_rx) = std::sync::mpsc::channel();
        let (waker_tx, waker_rx) = std::sync::mpsc::channel();

        let join = std::thread::Builder::new()
            .name(format!("tcpbench-worker-{idx}"))
            .spawn(move || {
                if let Err(e) = affinity::pin_current_thread(cpu_id) {
                    tracing::warn!(error = %e, "failed to pin worker {idx} to cpu {cpu_id}");
                }

                let reactor = match UringReactor::new(UringReactorConfig {
                    sq_entries: uring_depth,
                    ..Default::default()
                }) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::error!(error = %e, "worker {idx} failed to create reactor");
                        return;
                    }
                };
                let _ = waker_tx.send(make_waker(reactor.wakeup_fd()));
                let bundle_mode = reactor.bundle_supported;

                let pool = match ProvidedBufferPool::new(reactor.raw(), GroupId::new(0), buffer_count, buffer_size) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!(error = %e, "worker {idx} failed to create buffer pool");
                        return;
                    }
                };
                let registered_pool = match RegisteredBufferPool::new(reactor.raw(), buffer_count, buffer_size) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!(error = %e, "worker {idx} failed to create registered buffer pool");
                        return;
                    }
                };

                EXTRAS.with(|cell| {
                    *cell.borrow_mut() = Some(WorkerExtras {
                        pool: Rc::new(RefCell::new(pool)),
                        registered_pool: Rc::new(RefCell::new(registered_pool)),
                        group: GroupId::new(0),
                        mode,
                        bundle_mode,
                        zerocopy,
                        read_limit,
                        collect_every_n,
                        sample_producer,
                        counters: worker_counters,
                        next_conn_id: 0,
                        so_rcvbuf,
                        so_sndbuf,
                        active_connections,
                        shutdown_on_disconnect,
                        shutdown: shutdown_for_extras,
                    });
                });

                let mut worker = Worker::new(reactor, 4096, thread_shutdown, busy_spin);
                let _ = inbox_tx.send(worker.inbox());

                if let Err(e) = worker.run() {
                    tracing::error!(error = %e, "worker {idx} exited with error");
                }
            })
            .expect("spawn worker thread");

        let inbox = inbox_rx
            .recv()
            .map_err(|_| BenchError::Setup("worker inbox handoff failed".into()))?;
        let waker = waker_rx
            .recv()
            .map_err(|_| BenchError::Setup("worker waker handoff failed".into()))?;

        worker_inboxes.push(inbox);
        worker_wakers.push(waker.clone());
        workers.push(WorkerHandle {
            join,
            counters,
            sample_conduit,
            waker,
        });
    }

    let (acceptor_join, acceptor_waker) =
        spawn_acceptor(listener, worker_inboxes, worker_wakers, shutdown)?;

    Ok(RunHandles {
        workers,
        acceptor_join,
        acceptor_waker,
    })
}

fn spawn_acceptor(
    listener: Socket,
    worker_inboxes: Vec<WorkerInbox<UringReactor>>,
    worker_wakers: Vec<Arc<dyn Fn() + Send + Sync>>,
    shutdown: Arc<AtomicBool>,
) -> Result<(JoinHandle<()>, Arc<dyn Fn() + Send + Sync>)> {
    let (waker_tx, waker_rx) = std::sync::mpsc::channel();
    let join = std::thread::Builder::new()
        .name("tcpbench-acceptor".into())
        .spawn(move || {
            let mut reactor = match UringReactor::new(UringReactorConfig::default()) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, "acceptor failed to create reactor");
                    return;
                }
            };
            let _ = waker_tx.send(make_waker(reactor.wakeup_fd()));

            let next_idx = Rc::new(RefCell::new(0usize));
            let dispatch_idx = next_idx.clone();
            let worker_count = worker_inboxes.len();

            let _acceptor = Acceptor::start(
                &mut reactor,
                listener,
                Box::new(move |socket: Socket, _reactor| {
                    let mut idx = dispatch_idx.borrow_mut();
                    let target = *idx % worker_count;
                    *idx += 1;

                    let task: WorkerTask<UringReactor> = add_connection_task(socket);
                    match worker_inboxes[target].post(task) {
                        Ok(()) => worker_wakers[target](),
                        Err(_) => tracing::warn!("worker {target} inbox full, dropping connection"),
                    }
                }),
            );

            while !shutdown.load(Ordering::Relaxed) {
                if let Err(e) = reactor.poll_wait() {
                    tracing::error!(error = %e, "acceptor reactor error");
                    break;
                }
            }
        })
        .expect("spawn acceptor thread");

    let waker = waker_rx
        .recv()
        .map_err(|_| BenchError::Setup("acceptor reactor failed to start".into()))?;

    Ok((join, waker))
}

fn add_connection_task(socket: Socket) -> WorkerTask<UringReactor> {
    Box::new(move |worker: &mut Worker<UringReactor>| {
        EXTRAS.with(|cell| {
            let mut extras_ref = cell.borrow_mut();
            let Some(extras) = extras_ref.as_mut() else {
                return;
            };

            let conn_id = extras.next_conn_id;
            extras.next_conn_id += 1;

            if let Some(size) = extras.so_rcvbuf {
                if let Err(e) = socket.set_recv_buffer_size(size) {
                    tracing::warn!(error = %e, "failed to set SO_RCVBUF");
                }
            }
            if let Some(size) = extras.so_sndbuf {
                if let Err(e) = socket.set_send_buffer_size(size) {
                    tracing::warn!(error = %e, "failed to set SO_SNDBUF");
                }
            }

            let sample_producer = extras.sample_producer.clone();
            let conn = Rc::new(RefCell::new(Connection::new(
                conn_id,
                extras.counters.clone(),
                extras.collect_every_n,
                Box::new(move |sample| {
                    sample_producer.push(sample);
                }),
            )));
            worker.connections.insert(conn.clone());

            let raw_fd = socket.as_raw_fd();
            let registered_pool = extras.registered_pool.clone();
            let zerocopy = extras.zerocopy;
            let sender: Option<Rc<BundleSender>> = if extras.mode == Mode::Echo {
                let dup_fd = unsafe { libc::dup(raw_fd) };
                if dup_fd < 0 {
                    tracing::warn!("dup() failed while wiring echo sender");
                    None
                } else {
                    let send_socket = unsafe { Socket::from_raw_fd(dup_fd) };
                    Some(Rc::new(BundleSender::new(
                        send_socket,
                        registered_pool,
                        zerocopy,
                        WRITE_LIST_CAPACITY,
                        Box::new(|err, _reactor| {
                            tracing::warn!(error = %err, "echo send failed");
                        }),
                    )))
                }
            } else {
                None
            };

            let pool = extras.pool.clone();
            let group = extras.group;
            let bundle_mode = extras.bundle_mode;
            let buf_len = pool.borrow().buf_len();
            let buf_count = pool.borrow().buf_count();
            let read_limit = extras.read_limit;
            let active_connections = extras.active_connections.clone();
            let shutdown_on_disconnect = extras.shutdown_on_disconnect;
            let shutdown = extras.shutdown.clone();
            let conn_for_cb = conn;
            let backlog: Rc<RefCell<std::collections::VecDeque<u8>>> =
                Rc::new(RefCell::new(std::collections::VecDeque::new()));

            extras.active_connections.fetch_add(1, Ordering::SeqCst);

            Receiver::start(
                &mut worker.reactor,
                socket,
                group,
                bundle_mode,
                buf_len,
                buf_count,
                Box::new(move |result, reactor| {
                    let dispatch = |reactor: &mut UringReactor, bytes: &[u8], conn: &Rc<RefCell<Connection>>| {
                        match conn.borrow_mut().on_bytes(bytes) {
                            Ok(messages) => {
                                if let Some(sender) = &sender {
                                    for msg in messages {
                                        if let Err(e) = sender.enqueue(reactor, &msg) {
                                            tracing::warn!(error = %e, "echo reply dropped");
                                        }
                                    }
                                }
                                true
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "framing error, closing connection");
                                false
                            }
                        }
                    };

                    match result {
                        Ok(pairs) if pairs.is_empty() => {
                            close_connection(&conn_for_cb, &active_connections, shutdown_on_disconnect, &shutdown);
                        }
                        Ok(pairs) => {
                            let mut budget = read_limit.unwrap_or(usize::MAX);
                            let mut ok = true;

                            {
                                let mut backlog_ref = backlog.borrow_mut();
                                if !backlog_ref.is_empty() && budget > 0 {
                                    let take = backlog_ref.len().min(budget);
                                    let chunk: Vec<u8> = backlog_ref.drain(..take).collect();
                                    budget -= take;
                                    drop(backlog_ref);
                                    if !chunk.is_empty() {
                                        ok = dispatch(reactor, &chunk, &conn_for_cb);
                                    }
                                }
                            }

                            for (bid, len) in &pairs {
                                if !ok {
                                    pool.borrow_mut().push_buffer(*bid);
                                    continue;
                                }
                                let bytes = {
                                    let pool_ref = pool.borrow();
                                    unsafe { pool_ref.view(*bid, *len) }.to_vec()
                                };
                                pool.borrow_mut().push_buffer(*bid);

                                if bytes.len() > budget {
                                    let (now, later) = bytes.split_at(budget);
                                    if !now.is_empty() {
                                        ok = dispatch(reactor, now, &conn_for_cb);
                                    }
                                    backlog.borrow_mut().extend(later.iter().copied());
                                    budget = 0;
                                } else {
                                    budget -= bytes.len();
                                    ok = dispatch(reactor, &bytes, &conn_for_cb);
                                }
                            }
                            pool.borrow_mut().commit();

                            if !ok {
                                close_connection(&conn_for_cb, &active_connections, shutdown_on_disconnect, &shutdown);
                            }
                        }
                        Err(BenchError::Transient) => {}
                        Err(e) => {
                            tracing::debug!(error = %e, "receive error, closing connection");
                            close_connection(&conn_for_cb, &active_connections, shutdown_on_disconnect, &shutdown);
                        }
                    }
                }),
            );
        });
    })
}
