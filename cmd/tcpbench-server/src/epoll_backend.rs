//! Wires the epoll backend together. Same worker/acceptor-thread shape as the io_uring
//! backend, minus provided-buffer bookkeeping: each connection gets a plain owned receive
//! buffer and a coalescing sender.

use std::cell::RefCell;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tcpbench_core::{BenchError, Counters, Reactor, Result, Socket};
use tcpbench_metrics::affinity;
use tcpbench_epoll::{Acceptor, EpollReactor, Receiver, Sender};
use tcpbench_runtime::{Connection, SampleConduit, SampleProducer, Worker, WorkerInbox, WorkerTask};

use crate::cli::{Cli, Mode};
use crate::waker::make_waker;

struct WorkerExtras {
    mode: Mode,
    buffer_size: usize,
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

/// Mirrors `uring_backend`'s close accounting: marks a connection closed exactly once and
/// trips the shared shutdown flag once every accepted connection has disconnected, if
/// `--shutdown-on-disconnect` was requested.
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

    let mut worker_inboxes: Vec<WorkerInbox<EpollReactor>> = Vec::new();
    let mut worker_wakers: Vec<Arc<dyn Fn() + Send + Sync>> = Vec::new();
    let mut workers = Vec::new();
    let active_connections = Arc::new(AtomicUsize::new(0));

    for idx in 0..cli.workers {
        let thread_shutdown = shutdown.clone();
        let shutdown_for_extras = shutdown.clone();
        let mode = cli.mode;
        let buffer_size = cli.buffer_size;
        let busy_spin = cli.busy_spin;
        let collect_every_n = cli.collect_latency_every_n_samples;
        let cpu_id = cli.cpu_id_base + idx;
        let so_rcvbuf = cli.so_rcvbuf;
        let so_sndbuf = cli.so_sndbuf;
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

                let reactor = match EpollReactor::new() {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::error!(error = %e, "worker {idx} failed to create reactor");
                        return;
                    }
                };
                let _ = waker_tx.send(make_waker(reactor.wakeup_fd()));

                EXTRAS.with(|cell| {
                    *cell.borrow_mut() = Some(WorkerExtras {
                        mode,
                        buffer_size,
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
    worker_inboxes: Vec<WorkerInbox<EpollReactor>>,
    worker_wakers: Vec<Arc<dyn Fn() + Send + Sync>>,
    shutdown: Arc<AtomicBool>,
) -> Result<(JoinHandle<()>, Arc<dyn Fn() + Send + Sync>)> {
    let (waker_tx, waker_rx) = std::sync::mpsc::channel();
    let join = std::thread::Builder::new()
        .name("tcpbench-acceptor".into())
        .spawn(move || {
            let mut reactor = match EpollReactor::new() {
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

                    let task: WorkerTask<EpollReactor> = add_connection_task(socket);
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

fn add_connection_task(socket: Socket) -> WorkerTask<EpollReactor> {
    Box::new(move |worker: &mut Worker<EpollReactor>| {
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
            let sender: Option<Sender> = if extras.mode == Mode::Echo {
                let dup_fd = unsafe { libc::dup(raw_fd) };
                if dup_fd < 0 {
                    tracing::warn!("dup() failed while wiring echo sender");
                    None
                } else {
                    let send_socket = unsafe { Socket::from_raw_fd(dup_fd) };
                    Some(Sender::start(
                        &mut worker.reactor,
                        send_socket,
                        Box::new(|err, _reactor| {
                            tracing::warn!(error = %err, "echo send failed");
                        }),
                    ))
                }
            } else {
                None
            };

            let buffer_size = extras.buffer_size;
            let active_connections = extras.active_connections.clone();
            let shutdown_on_disconnect = extras.shutdown_on_disconnect;
            let shutdown = extras.shutdown.clone();
            let conn_for_cb = conn;

            extras.active_connections.fetch_add(1, Ordering::SeqCst);

            Receiver::start(
                &mut worker.reactor,
                socket,
                buffer_size,
                Box::new(move |result, reactor| match result {
                    Ok(bytes) if bytes.is_empty() => {
                        close_connection(&conn_for_cb, &active_connections, shutdown_on_disconnect, &shutdown);
                    }
                    Ok(bytes) => match conn_for_cb.borrow_mut().on_bytes(bytes) {
                        Ok(messages) => {
                            if let Some(sender) = &sender {
                                for msg in messages {
                                    sender.enqueue(reactor, &msg);
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "framing error, closing connection");
                            close_connection(&conn_for_cb, &active_connections, shutdown_on_disconnect, &shutdown);
                        }
                    },
                    Err(BenchError::Transient) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "receive error, closing connection");
                        close_connection(&conn_for_cb, &active_connections, shutdown_on_disconnect, &shutdown);
                    }
                }),
            );
        });
    })
}
