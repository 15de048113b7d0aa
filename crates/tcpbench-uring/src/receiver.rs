//! Multishot receive, grounded on `lib/uring/receiver.hpp`/`.cpp`. Two submission shapes:
//! plain `RecvMulti` against a provided-buffer group, and — when the reactor's bundle probe
//! succeeded — the same opcode with `IORING_RECVSEND_BUNDLE` set, which can deliver several
//! provided buffers per completion. Either way each completion callback sees one or more
//! `(buffer_id, len)` pairs; `bundle_sender`'s framing logic doesn't care which path produced
//! them.

use io_uring::{opcode, squeue::Flags, types};
use std::cell::RefCell;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use tcpbench_core::{GroupId, Socket};

use crate::provided_buffer_pool::ProvidedBufferPool;
use crate::reactor::{CqeView, UringReactor};

/// `(buffer_id, bytes_consumed)`; `bytes_consumed == 0` with `Ok` means a clean remote close.
pub type RecvResult = tcpbench_core::Result<Vec<(u16, usize)>>;

pub type RecvCallback = Box<dyn FnMut(RecvResult, &mut UringReactor)>;

struct ReceiverState {
    socket: Socket,
    group: GroupId,
    callback: RecvCallback,
    use_bundle: bool,
    buf_len: usize,
    buf_count: u16,
}

pub struct Receiver {
    state: Rc<RefCell<ReceiverState>>,
}

impl Receiver {
    /// `use_bundle` should be `reactor.bundle_supported && buffer group is bundle-eligible`;
    /// the caller (worker wiring) decides since it also knows the connection's negotiated mode.
    /// `buf_len`/`buf_count` come from the owning `ProvidedBufferPool` and are needed to split
    /// a bundled completion's total byte count back across the consecutive buffer ids it spans.
    pub fn start(
        reactor: &mut UringReactor,
        socket: Socket,
        group: GroupId,
        use_bundle: bool,
        buf_len: usize,
        buf_count: u16,
        callback: RecvCallback,
    ) -> Self {
        let state = Rc::new(RefCell::new(ReceiverState {
            socket,
            group,
            callback,
            use_bundle,
            buf_len,
            buf_count,
        }));
        Self::arm(reactor, state.clone());
        Self { state }
    }

    fn arm(reactor: &mut UringReactor, state: Rc<RefCell<ReceiverState>>) {
        let (fd, group) = {
            let st = state.borrow();
            (st.socket.as_raw_fd(), st.group)
        };
        let use_bundle = state.borrow().use_bundle;
        let handler_state = state.clone();

        reactor.create_request(
            Box::new(move |cqe: CqeView, reactor: &mut UringReactor| {
                Self::on_completion(cqe, reactor, &handler_state);
            }),
            move |user_data| {
                let mut op = opcode::RecvMulti::new(types::Fd(fd), group.get()).build();
                if use_bundle {
                    op = op.flags(Flags::BUFFER_SELECT);
                }
                op.user_data(user_data)
            },
        );
    }

    fn on_completion(cqe: CqeView, reactor: &mut UringReactor, state: &Rc<RefCell<ReceiverState>>) {
        let result: RecvResult = if cqe.result < 0 {
            Err(tcpbench_core::BenchError::from_errno(-cqe.result))
        } else {
            let n = cqe.result as usize;
            match cqe.buffer_id() {
                // A bundle completion's `result` is the total byte count across however many
                // consecutive (wrapping) provided buffers the kernel filled, starting at the
                // reported anchor id. Each buffer holds at most `buf_len` bytes, so walk
                // forward consuming `min(remaining, buf_len)` per id until `n` is accounted
                // for — never attribute more than one buffer's worth to a single id.
                Some(bid) => {
                    let st = state.borrow();
                    Ok(split_bundle(bid, n, st.buf_len, st.buf_count))
                }
                None => Ok(vec![]),
            }
        };

        {
            let mut st = state.borrow_mut();
            (st.callback)(result, reactor);
        }

        if !cqe.more() {
            tracing::debug!("multishot receive dropped by kernel, re-arming");
            Self::arm(reactor, state.clone());
        }
    }
}

/// Splits a bundle completion's total byte count `n` across consecutive buffer ids starting
/// at `anchor`, wrapping modulo `buf_count`, `buf_len` bytes at a time.
fn split_bundle(anchor: u16, n: usize, buf_len: usize, buf_count: u16) -> Vec<(u16, usize)> {
    if buf_len == 0 || buf_count == 0 {
        return vec![(anchor, n)];
    }
    let mut pairs = Vec::new();
    let mut remaining = n;
    let mut cur = anchor;
    while remaining > 0 {
        let take = remaining.min(buf_len);
        pairs.push((cur, take));
        remaining -= take;
        cur = if cur + 1 >= buf_count { 0 } else { cur + 1 };
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::split_bundle;

    #[test]
    fn split_bundle_fits_in_one_buffer() {
        assert_eq!(split_bundle(5, 100, 4096, 64), vec![(5, 100)]);
    }

    #[test]
    fn split_bundle_spans_several_buffers() {
        let pairs = split_bundle(62, 4096 * 2 + 100, 4096, 64);
        assert_eq!(pairs, vec![(62, 4096), (63, 4096), (0, 100)]);
    }

    #[test]
    fn split_bundle_empty_is_empty() {
        assert_eq!(split_bundle(0, 0, 4096, 64), Vec::<(u16, usize)>::new());
    }
}
