use std::sync::atomic::{AtomicU64, Ordering};

/// One-way latency sample: nanoseconds-since-epoch `send_ts`, embedded in the first 8 bytes
/// of a message, paired with the monotonic-epoch `recv_ts` taken at framing time.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub send_ts: u64,
    pub recv_ts: u64,
}

impl Sample {
    /// Saturating: a clock skew between sender and receiver host must never panic the HUD.
    pub fn latency_ns(&self) -> u64 {
        self.recv_ts.saturating_sub(self.send_ts)
    }
}

/// Per-connection monotonic counters. `Relaxed` throughout: these are read by the HUD via a
/// posted snapshot request from the owning worker thread, never raced against a writer that
/// needs ordering guarantees beyond "eventually visible".
#[derive(Debug, Default)]
pub struct Counters {
    ops: AtomicU64,
    msgs: AtomicU64,
    bytes: AtomicU64,
}

impl Counters {
    pub fn add_op(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_message(&self, bytes: u64) {
        self.msgs.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            ops: self.ops.load(Ordering::Relaxed),
            msgs: self.msgs.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub ops: u64,
    pub msgs: u64,
    pub bytes: u64,
}

impl std::ops::Add for CounterSnapshot {
    type Output = CounterSnapshot;

    fn add(self, rhs: CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            ops: self.ops + rhs.ops,
            msgs: self.msgs + rhs.msgs,
            bytes: self.bytes + rhs.bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotone() {
        let c = Counters::default();
        c.add_op();
        c.add_message(64);
        c.add_message(64);
        let snap = c.snapshot();
        assert_eq!(snap.ops, 1);
        assert_eq!(snap.msgs, 2);
        assert_eq!(snap.bytes, 128);
    }

    #[test]
    fn latency_never_panics_on_clock_skew() {
        let s = Sample {
            send_ts: 100,
            recv_ts: 50,
        };
        assert_eq!(s.latency_ns(), 0);
    }
}
