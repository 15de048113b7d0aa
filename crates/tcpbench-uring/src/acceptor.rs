//! Multishot-accept connection source, grounded on `app/server/acceptor.hpp`/`.cpp`: one
//! `AcceptMulti` submission per listening socket, re-armed by the kernel automatically; this
//! side only needs to watch for the rare case where the kernel drops the multishot (no
//! `CQE_F_MORE`) and re-submit it.

use io_uring::{opcode, types};
use std::cell::RefCell;
use std::rc::Rc;
use tcpbench_core::Socket;

use crate::reactor::{CqeView, UringReactor};

/// Invoked once per accepted connection with the new socket's raw fd. Errors are logged and
/// do not tear down the acceptor; see `state.consecutive_errors` for the give-up threshold.
pub type AcceptCallback = Box<dyn FnMut(Socket, &mut UringReactor)>;

struct AcceptorState {
    listener: Socket,
    callback: AcceptCallback,
    consecutive_errors: u32,
}

/// Owns the listening socket for its whole lifetime; dropping the `Acceptor` does not
/// cancel the in-flight multishot accept (the reactor's slot slab still holds a strong
/// `Rc` to the state), matching the source's "acceptor outlives a connection drought".
pub struct Acceptor {
    state: Rc<RefCell<AcceptorState>>,
}

const MAX_CONSECUTIVE_ERRORS: u32 = 16;

impl Acceptor {
    pub fn start(reactor: &mut UringReactor, listener: Socket, callback: AcceptCallback) -> Self {
        let state = Rc::new(RefCell::new(AcceptorState {
            listener,
            callback,
            consecutive_errors: 0,
        }));
        Self::arm(reactor, state.clone());
        Self { state }
    }

    fn arm(reactor: &mut UringReactor, state: Rc<RefCell<AcceptorState>>) {
        let fd = state.borrow().listener.as_raw_fd();
        let handler_state = state.clone();
        reactor.create_request(
            Box::new(move |cqe: CqeView, reactor: &mut UringReactor| {
                Self::on_completion(cqe, reactor, &handler_state);
            }),
            move |user_data| {
                opcode::AcceptMulti::new(types::Fd(fd))
                    .build()
                    .user_data(user_data)
            },
        );
    }

    fn on_completion(cqe: CqeView, reactor: &mut UringReactor, state: &Rc<RefCell<AcceptorState>>) {
        if cqe.result >= 0 {
            let fd = cqe.result;
            let sock = unsafe { Socket::from_raw_fd(fd) };
            let mut st = state.borrow_mut();
            st.consecutive_errors = 0;
            (st.callback)(sock, reactor);
        } else {
            let errno = -cqe.result;
            tracing::warn!(errno, "accept completion failed");
            let mut st = state.borrow_mut();
            st.consecutive_errors += 1;
            if st.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                tracing::error!("acceptor giving up after repeated accept failures");
                return;
            }
        }

        // `AcceptMulti` normally keeps itself armed (CQE_F_MORE); if the kernel ever drops
        // it (e.g. after an error storm), re-submit explicitly.
        if !cqe.more() {
            tracing::debug!("multishot accept dropped by kernel, re-arming");
            Self::arm(reactor, state.clone());
        }
    }
}

use std::os::fd::AsRawFd;

#[cfg(test)]
mod tests {
    // Acceptor needs a live IoUring to exercise meaningfully; covered by the
    // tcpbench-runtime integration tests that exercise the whole accept->worker path.
}
