//! Server-side message framing, grounded on `app/server/connection.hpp`/`.cpp`: a small state
//! machine that never hands a partial message to the application, reassembling fixed-size
//! frames out of however the reactor chooses to chunk delivery.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tcpbench_core::{BenchError, Counters, Result, Sample};

pub type SampleFn = Box<dyn FnMut(Sample)>;

enum FrameState {
    /// Accumulating the 8-byte little-endian `msg_size` handshake header.
    Header(Vec<u8>),
    /// Accumulating one fixed-size message.
    Message(Vec<u8>),
}

/// One accepted connection's framing state, independent of which reactor backend delivered
/// the bytes. Stored at a stable slot in a `ConnSlab` so callback contexts can carry an index.
///
/// Deliberately mode-agnostic: `on_bytes` hands completed messages back to the caller rather
/// than echoing them directly, since echoing needs reactor access (`BundleSender::enqueue`
/// takes `&mut UringReactor`) that this backend-independent type doesn't have. Sink-mode
/// callers simply drop the returned messages instead of forwarding them to a sender.
pub struct Connection {
    id: usize,
    msg_size: usize,
    state: FrameState,
    counters: Arc<Counters>,
    sample_every_n: u64,
    samples_seen: u64,
    on_sample: SampleFn,
    closed: bool,
}

impl Connection {
    pub fn new(id: usize, counters: Arc<Counters>, sample_every_n: u64, on_sample: SampleFn) -> Self {
        Self {
            id,
            msg_size: 0,
            state: FrameState::Header(Vec::with_capacity(8)),
            counters,
            sample_every_n: sample_every_n.max(1),
            samples_seen: 0,
            on_sample,
            closed: false,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Feeds newly-received bytes through the framing state machine, returning every message
    /// that completed as a result (zero, one, or several for a large chunk). Never passes a
    /// partial message out (the receiver-delivery invariant).
    pub fn on_bytes(&mut self, mut bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.counters.add_op();
        let mut completed = Vec::new();
        while !bytes.is_empty() {
            match &mut self.state {
                FrameState::Header(buf) => {
                    let need = 8 - buf.len();
                    let take = need.min(bytes.len());
                    buf.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if buf.len() == 8 {
                        if self.msg_size == 0 {
                            let mut raw = [0u8; 8];
                            raw.copy_from_slice(buf);
                            self.msg_size = u64::from_le_bytes(raw) as usize;
                            if self.msg_size < 8 {
                                return Err(BenchError::Protocol("msg_size below minimum frame"));
                            }
                        }
                        self.state = FrameState::Message(Vec::with_capacity(self.msg_size));
                    }
                }
                FrameState::Message(buf) => {
                    let need = self.msg_size - buf.len();
                    let take = need.min(bytes.len());
                    buf.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if buf.len() == self.msg_size {
                        completed.push(self.deliver_message());
                    }
                }
            }
        }
        Ok(completed)
    }

    fn deliver_message(&mut self) -> Vec<u8> {
        let buf = match std::mem::replace(&mut self.state, FrameState::Message(Vec::with_capacity(self.msg_size))) {
            FrameState::Message(buf) => buf,
            FrameState::Header(_) => unreachable!("message state only entered after header"),
        };

        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[..8]);
        let send_ts = u64::from_le_bytes(raw);

        self.counters.add_message(buf.len() as u64);
        self.samples_seen += 1;
        if self.samples_seen % self.sample_every_n == 0 {
            (self.on_sample)(Sample {
                send_ts,
                recv_ts: now_ns(),
            });
        }

        buf
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn test_connection() -> (Connection, Arc<Mutex<Vec<Sample>>>) {
        let samples = Arc::new(Mutex::new(Vec::new()));
        let samples_cb = samples.clone();

        let conn = Connection::new(
            0,
            Arc::new(Counters::default()),
            1,
            Box::new(move |sample: Sample| samples_cb.lock().unwrap().push(sample)),
        );
        (conn, samples)
    }

    #[test]
    fn reassembles_header_and_single_message() {
        let (mut conn, samples) = test_connection();
        let msg_size = 16u64;
        conn.on_bytes(&msg_size.to_le_bytes()).unwrap();

        let mut msg = vec![0u8; 16];
        msg[0..8].copy_from_slice(&42u64.to_le_bytes());
        let completed = conn.on_bytes(&msg).unwrap();

        assert_eq!(completed, vec![msg]);
        assert_eq!(samples.lock().unwrap().len(), 1);
        assert_eq!(samples.lock().unwrap()[0].send_ts, 42);
    }

    #[test]
    fn never_delivers_partial_message() {
        let (mut conn, _) = test_connection();
        conn.on_bytes(&16u64.to_le_bytes()).unwrap();

        let msg = vec![0u8; 16];
        let completed = conn.on_bytes(&msg[..10]).unwrap();
        assert!(completed.is_empty());
        let completed = conn.on_bytes(&msg[10..]).unwrap();
        assert_eq!(completed.len(), 1);
    }

    #[test]
    fn handles_multiple_messages_in_one_chunk() {
        let (mut conn, _) = test_connection();
        conn.on_bytes(&16u64.to_le_bytes()).unwrap();

        let mut chunk = Vec::new();
        chunk.extend_from_slice(&vec![0u8; 16]);
        chunk.extend_from_slice(&vec![0u8; 16]);
        let completed = conn.on_bytes(&chunk).unwrap();
        assert_eq!(completed.len(), 2);
    }

    #[test]
    fn rejects_undersized_msg_size_header() {
        let (mut conn, _) = test_connection();
        let err = conn.on_bytes(&4u64.to_le_bytes());
        assert!(matches!(err, Err(BenchError::Protocol(_))));
    }
}
