//! Client-side paced load generator, grounded on `app/client/{connection,sender}.cpp`: each
//! connection owns a pre-stamped message buffer whose first 8 bytes are a send timestamp
//! re-stamped only at a message boundary, and a single pacer drives a pool of connections
//! against a target aggregate rate by riding the reactor's own bounded wait (`run_for`) as
//! the pacing tick instead of a free-running `thread::sleep`. The actual send/receive
//! mechanics (`BundleSender` vs the epoll coalescing `Sender`) are backend-specific and live
//! in `cmd/tcpbench-client`'s `uring_backend`/`epoll_backend`, mirroring the server's split.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tcpbench_core::{Counters, Reactor, Result};

use crate::worker::Worker;

pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Repeating diagnostic fill pattern identical to the source's connection buffer init; the
/// first 8 bytes are overwritten with a send timestamp on every send, the rest never changes.
pub fn fill_payload(id: usize, msg_size: usize) -> Vec<u8> {
    let mut payload = vec![0u8; msg_size];
    for (i, byte) in payload.iter_mut().enumerate().skip(8) {
        *byte = b'a' + ((i + id) % 26) as u8;
    }
    payload
}

/// How many sends should have gone out by `elapsed`, at a steady `msgs_per_sec` aggregate
/// rate. A pure function of wall time rather than a per-tick increment so a slow tick (GC
/// pause, scheduler hiccup) doesn't permanently lose throughput — the next tick catches up.
pub fn expected_sends(elapsed: Duration, msgs_per_sec: u64) -> u64 {
    let interval_ns = 1_000_000_000u64 / msgs_per_sec.max(1);
    elapsed.as_nanos() as u64 / interval_ns
}

pub struct SenderConfig {
    pub msgs_per_sec: u64,
    pub duration: Option<Duration>,
    pub stop_after_n_messages: Option<u64>,
    pub drain: bool,
    /// Fixed at 30s in the source regardless of run length; kept as an explicit field rather
    /// than a constant so tests can shrink it.
    pub drain_timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            msgs_per_sec: 1,
            duration: None,
            stop_after_n_messages: None,
            drain: false,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Drives `worker`'s reactor one pacing tick at a time via `run_for`, which both services
/// whatever I/O the backend-specific connections need (zero-copy notifications, drain
/// receives) and bounds how long a tick can run — so the same call serves as the pacing
/// clock the old code got from `thread::sleep`. `try_send` attempts one message on one
/// connection and returns `Ok(true)` if it went out, `Ok(false)` on backpressure (this tick
/// skips that connection and the pacer retries it once `total_sent` falls behind again).
pub fn run_paced<R: Reactor, C>(
    worker: &mut Worker<R, C>,
    config: &SenderConfig,
    shutdown: &AtomicBool,
    counters: &Counters,
    msg_size: u64,
    tick: Duration,
    mut try_send: impl FnMut(&mut C, &mut R) -> Result<bool>,
) -> Result<()> {
    let ids: Vec<usize> = worker.connections.iter_mut().map(|(idx, _)| idx).collect();
    if ids.is_empty() {
        return Ok(());
    }

    let start = Instant::now();
    let mut total_sent = 0u64;
    let mut rr = 0usize;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if let Some(d) = config.duration {
            if start.elapsed() >= d {
                break;
            }
        }
        if let Some(n) = config.stop_after_n_messages {
            if total_sent >= n {
                break;
            }
        }

        let expected = expected_sends(start.elapsed(), config.msgs_per_sec);
        while total_sent < expected {
            if let Some(n) = config.stop_after_n_messages {
                if total_sent >= n {
                    break;
                }
            }
            let idx = ids[rr % ids.len()];
            rr += 1;
            let Some(conn) = worker.connections.get_mut(idx) else {
                continue;
            };
            let mut conn_ref = conn.borrow_mut();
            match try_send(&mut *conn_ref, &mut worker.reactor) {
                Ok(true) => {
                    total_sent += 1;
                    counters.add_op();
                    counters.add_message(msg_size);
                }
                Ok(false) => break, // backpressure: skip this tick, retry next
                Err(e) => {
                    tracing::warn!(error = %e, "client send failed, dropping connection");
                    break;
                }
            }
        }

        worker.reactor.run_for(tick)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_fill_pattern_matches_source_formula() {
        let id = 3usize;
        let msg_size = 16usize;
        let payload = fill_payload(id, msg_size);
        assert_eq!(payload[8], b'a' + ((8 + 3) % 26) as u8);
        assert_eq!(payload.len(), msg_size);
    }

    #[test]
    fn expected_sends_is_monotone_in_elapsed_time() {
        let rate = 1000u64;
        let a = expected_sends(Duration::from_millis(10), rate);
        let b = expected_sends(Duration::from_millis(20), rate);
        assert!(b >= a);
        assert_eq!(expected_sends(Duration::from_secs(1), rate), rate);
    }

    #[test]
    fn expected_sends_never_divides_by_zero_rate() {
        assert_eq!(expected_sends(Duration::from_secs(1), 0), 1);
    }
}
