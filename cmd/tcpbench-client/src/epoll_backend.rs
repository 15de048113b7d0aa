//! Wires the epoll backend together for the client: same shard-per-thread shape as
//! `uring_backend`, minus registered/provided buffer pools — sends go through the plain
//! coalescing `Sender`, and `--drain` counts bytes off the plain `Receiver`.

use std::cell::RefCell;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tcpbench_core::{BenchError, Counters, Reactor, Result, Socket};
use tcpbench_metrics::affinity;
use tcpbench_runtime::{client::SenderConfig, fill_payload, now_ns, run_paced, Worker};
use tcpbench_epoll::{EpollReactor, Receiver, Sender};

const PACING_TICK: Duration = Duration::from_micros(200);

pub struct ShardConfig {
    pub id_base: usize,
    pub count: usize,
    pub host: String,
    pub port: String,
    pub msg_size: usize,
    pub cpu_id: usize,
    pub sender: SenderConfig,
}

struct ClientConn {
    sender: Sender,
    payload: Vec<u8>,
    recv_bytes: Rc<AtomicU64>,
    sent_bytes: u64,
}

pub fn run_shard(cfg: ShardConfig, shutdown: Arc<AtomicBool>, counters: Arc<Counters>) -> Result<()> {
    if let Err(e) = affinity::pin_current_thread(cfg.cpu_id) {
        tracing::warn!(error = %e, "failed to pin sender thread to cpu {}", cfg.cpu_id);
    }
    if cfg.msg_size < 8 {
        return Err(BenchError::Protocol("msg_size below minimum frame"));
    }

    let reactor = EpollReactor::new()?;
    let mut worker: Worker<EpollReactor, ClientConn> = Worker::new(reactor, 1, shutdown.clone(), false);

    for i in 0..cfg.count {
        let id = cfg.id_base + i;
        let send_socket = Socket::new(libc::AF_INET, libc::SOCK_STREAM, 0)?;
        send_socket.set_nodelay(true)?;
        send_socket.connect(&cfg.host, &cfg.port)?;
        write_header_blocking(&send_socket, cfg.msg_size)?;

        let recv_bytes = Rc::new(AtomicU64::new(0));

        if cfg.sender.drain {
            let dup_fd = unsafe { libc::dup(send_socket.as_raw_fd()) };
            if dup_fd < 0 {
                return Err(BenchError::Setup("dup() failed while wiring client receiver".into()));
            }
            let recv_socket = unsafe { Socket::from_raw_fd(dup_fd) };
            let recv_bytes_cb = recv_bytes.clone();
            Receiver::start(
                &mut worker.reactor,
                recv_socket,
                cfg.msg_size,
                Box::new(move |result, _reactor| match result {
                    Ok(bytes) if bytes.is_empty() => {}
                    Ok(bytes) => {
                        recv_bytes_cb.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    }
                    Err(BenchError::Transient) => {}
                    Err(e) => tracing::debug!(error = %e, "client receive error"),
                }),
            );
        }

        let sender = Sender::start(
            &mut worker.reactor,
            send_socket,
            Box::new(|err, _reactor| tracing::warn!(error = %err, "client send failed")),
        );

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
            conn.sender.enqueue(reactor, &conn.payload);
            conn.sent_bytes += conn.payload.len() as u64;
            Ok(true)
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
