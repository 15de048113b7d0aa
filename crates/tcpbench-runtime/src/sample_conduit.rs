//! Cross-thread sample and metrics plumbing, grounded on `app/common/sample_conduit.hpp` and
//! the promise/future request-reply pattern in `app/pingpong/main.cpp`.

use crossbeam_queue::ArrayQueue;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use tcpbench_core::{CounterSnapshot, Sample};

/// Bounded SPSC-ish queue a worker's connections push `Sample`s into; the HUD drains it on a
/// timer. A full push is dropped and surfaced as a backpressure event, never blocks.
pub struct SampleConduit {
    queue: Arc<ArrayQueue<Sample>>,
}

impl SampleConduit {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity)),
        }
    }

    pub fn producer(&self) -> SampleProducer {
        SampleProducer {
            queue: self.queue.clone(),
        }
    }

    /// Drains everything currently queued into `record`. Called from the HUD's thread.
    pub fn drain_into(&self, mut record: impl FnMut(Sample)) -> usize {
        let mut n = 0;
        while let Some(sample) = self.queue.pop() {
            record(sample);
            n += 1;
        }
        n
    }
}

#[derive(Clone)]
pub struct SampleProducer {
    queue: Arc<ArrayQueue<Sample>>,
}

impl SampleProducer {
    /// Returns `false` (dropped the sample) if the queue is full; callers count this as
    /// backpressure, never block the hot path on it.
    pub fn push(&self, sample: Sample) -> bool {
        self.queue.push(sample).is_ok()
    }
}

/// The reply half of a cross-thread metrics request: a worker receives one of these via its
/// task queue, computes a snapshot, and replies.
pub struct MetricsRequest {
    reply_tx: SyncSender<CounterSnapshot>,
}

impl MetricsRequest {
    pub fn reply(self, snapshot: CounterSnapshot) {
        let _ = self.reply_tx.send(snapshot);
    }
}

/// Builds a fresh request/reply pair. The requester posts `MetricsRequest` to the worker's
/// task queue, wakes the reactor, then blocks on `rx.recv()`.
pub fn metrics_request() -> (MetricsRequest, Receiver<CounterSnapshot>) {
    let (tx, rx) = sync_channel(1);
    (MetricsRequest { reply_tx: tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_pushes_and_drain_consumes() {
        let conduit = SampleConduit::new(4);
        let producer = conduit.producer();
        assert!(producer.push(Sample {
            send_ts: 1,
            recv_ts: 2
        }));

        let mut collected = Vec::new();
        let n = conduit.drain_into(|s| collected.push(s));
        assert_eq!(n, 1);
        assert_eq!(collected[0].recv_ts, 2);
    }

    #[test]
    fn push_fails_when_full_instead_of_blocking() {
        let conduit = SampleConduit::new(1);
        let producer = conduit.producer();
        assert!(producer.push(Sample {
            send_ts: 0,
            recv_ts: 0
        }));
        assert!(!producer.push(Sample {
            send_ts: 0,
            recv_ts: 0
        }));
    }

    #[test]
    fn metrics_request_round_trips() {
        let (req, rx) = metrics_request();
        req.reply(CounterSnapshot {
            ops: 1,
            msgs: 2,
            bytes: 3,
        });
        let snap = rx.recv().unwrap();
        assert_eq!(snap.ops, 1);
    }
}
