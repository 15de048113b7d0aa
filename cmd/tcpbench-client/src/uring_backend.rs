//! Wires the io_uring backend together for the client: one reactor, one registered buffer
//! pool backing zero-copy/fixed sends, and (when `--drain` is set) one provided buffer pool
//! counting bytes echoed back, all per sender thread. Pacing rides `run_paced`'s `run_for`
//! tick, the same bounded-wait primitive the server's worker loop uses for everything else.

use std::cell::RefCell;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tcpbench_core::{BenchError, Counters, GroupId, Reactor, Result, Socket};
use tcpbench_metrics::affinity;
use tcpbench_runtime::{client::SenderConfig, fill_payload, now_ns, run_paced, Worker};
use tcpbench_uring::{BundleSender, ProvidedBufferPool, Receiver, RegisteredBufferPool, UringReactor, UringReactorConfig};

const WRITE_LIST_CAPACITY: usize = 64;
const PACING_TICK: Duration = Duration::from_micros(200);

pub struct ShardConfig {
    pub id_base: usize,
    pub count: usize,
    pub host: String,
    pub port: String,
    pub msg_size: usize,
    pub buffer_count: u16,
    pub uring_depth: u32,
    pub zerocopy: bool,
    pub cpu_id: usize,
    pub sender: SenderConfig,
}

struct ClientConn {
    sender: Rc<BundleSender>,
    payload: Vec<u8>,
    recv_bytes: Rc<AtomicU64>,
    sent_bytes: u64,
}

/// Runs one sender thread's full shard: connect, wire each connection's sender (and, if
/// `drain` is requested, receiver), pace sends against the target rate, then optionally
/// drain. Blocking within the calling thread until the shard's work is done.
pub fn run_shard(cfg: ShardConfig, shutdown: Arc<AtomicBool>, counters: Arc<Counters>) -> Result<()> {
    if let Err(e) = affinity::pin_current_thread(cfg.cpu_id) {
        tracing::warn!(error = %e, "failed to pin sender thread to cpu {}", cfg.cpu_id);
    }
    if cfg.msg_size < 8 {
        return Err(BenchError::Protocol("msg_size below minimum frame"));
    }

    let reactor = UringReactor::new(UringReactorConfig {
        sq_entries: cfg.uring_depth,
        ..Default::default()
    })?;
    let bundle_mode = reactor.bundle_supported;

    let registered_pool = Rc::new(RefCell::new(RegisteredBufferPool::new(
        reactor.raw(),
        cfg.buffer_count,
        cfg.msg_size,
    )?));
    let recv_pool = if cfg.sender.drain {
        Some(Rc::new(RefCell::new(ProvidedBufferPool::new(
            reactor.raw(),
            GroupId::new(0),
            cfg.buffer_count,
            cfg.msg_size,
        )?)))
    } else {
        None
    };

    let mut worker: Worker<UringReactor, ClientConn> = Worker::new(reactor, 1, shutdown.clone(), false);

    for i in 0..cfg.count {
        let id = cfg.id_base + i;
        let send_socket = Socket::new(libc::AF_INET, libc::SOCK_STREAM, 0)?;
        send_socket.set_nodelay(true)?;
        send_socket.connect(&cfg.host, &cfg.port)?;
        write_header_blocking(&send_socket, cfg.msg_size)?;

        let recv_bytes = Rc::new(AtomicU64::new(0));

        if let Some(pool) = &recv_pool {
            let dup_fd = unsafe { libc::dup(send_socket.as_raw_fd()) };
            if dup_fd < 0 {
                return Err(BenchError::Setup("dup() failed while wiring client receiver".into()));
            }
            let recv_socket = unsafe { Socket::from_raw_fd(dup_fd) };
            let pool = pool.clone();
            let buf_len = pool.borrow().buf_len();
            let buf_count = pool.borrow().buf_count();
            let recv_bytes_cb = recv_bytes.clone();
            Receiver::start(
                &mut worker.reactor,
                recv_socket,
                GroupId::new(0),
                bundle_mode,
                buf_len,
                buf_count,
                Box::new(move |result, _reactor| match result {
                    Ok(pairs) => {
                        let mut total = 0u64;
                        for (bid, len) in &pairs {
                            total += *len as u64;
                            pool.borrow_mut().push_buffer(*bid);
                        }
                        pool.borrow_mut().commit();
                        recv_bytes_cb.fetch_add(total, Ordering::Relaxed);
                    }
                    Err(BenchError::Transient) => {}
                    Err(e) => tracing::debug!(error = %e, "client receive error"),
                }),
            );
        }

        let sender = Rc::new(BundleSender::new(
            send_socket,
            registered_pool.clone(),
            cfg.zerocopy,
            WRITE_LIST_CAPACITY,
            Box::new(|err, _reactor| tracing::warn!(error = %err, "client send failed")),
        ));

        worker.connections.insert(Rc::new(RefCell::new(ClientConn {
            sender,
            payload: fill_payload(id, cfg.msg_size),
            recv_bytes,
            sent_bytes: 0,
        })));
    }

    run_paced(
        &mut worker,
        &cfg.sender,
        &shutdown,
        &counters,
        cfg.msg_size as u64,
        PACING_TICK,
        |conn, reactor| {
            conn.payload[..8].copy_from_slice(&now_ns().to_le_bytes());
            match conn.sender.enqueue(reactor, &conn.payload) {
                Ok(()) => {
                    conn.sent_bytes += conn.payload.len() as u64;
                    Ok(true)
                }
                Err(BenchError::Backpressure(_)) => Ok(false),
                Err(e) => Err(e),
            }
        },
    )?;

    if cfg.sender.drain {
        let deadline = Instant::now() + cfg.sender.drain_timeout;
        loop {
            let caught_up = worker
                .connections
                .iter_mut()
                .all(|(_, c)| c.borrow().recv_bytes.load(Ordering::Relaxed) >= c.borrow().sent_bytes);
            if caught_up || Instant::now() >= deadline {
                break;
            }
            worker.reactor.run_for(Duration::from_millis(20))?;
        }
    }

    Ok(())
}

fn write_header_blocking(socket: &Socket, msg_size: usize) -> Result<()> {
    let mut buf = &(msg_size as u64).to_le_bytes()[..];
    while !buf.is_empty() {
        match socket.send(buf) {
            Ok(n) => buf = &buf[n..],
            Err(BenchError::Transient) => std::thread::sleep(Duration::from_micros(100)),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
