//! Plain coalescing sender for the epoll backend, grounded on `lib/bsd/sender.hpp`/`.cpp`:
//! no zero-copy, no registered buffers — just a write list flushed with `send()` and
//! continued on `EPOLLOUT` when the socket's send buffer is full.

use tcpbench_core::{BenchError, Socket};

use crate::reactor::{EpollEvent, EpollReactor, Interest};

pub type ErrorCallback = Box<dyn FnMut(BenchError, &mut EpollReactor)>;

struct SenderInner {
    socket: Socket,
    write_list: Vec<u8>,
    cursor: usize,
    writable: bool,
    on_error: ErrorCallback,
}

pub struct Sender {
    token: u64,
    inner: std::rc::Rc<std::cell::RefCell<SenderInner>>,
}

impl Sender {
    pub fn start(reactor: &mut EpollReactor, socket: Socket, on_error: ErrorCallback) -> Self {
        let fd = {
            use std::os::fd::AsRawFd;
            socket.as_raw_fd()
        };
        let inner = std::rc::Rc::new(std::cell::RefCell::new(SenderInner {
            socket,
            write_list: Vec::new(),
            cursor: 0,
            writable: true,
            on_error,
        }));

        let handler_inner = inner.clone();
        let token = reactor.register(
            fd,
            Interest::Write,
            Box::new(move |event: EpollEvent, reactor: &mut EpollReactor| {
                if event.error {
                    let mut st = handler_inner.borrow_mut();
                    let errno = st.socket.take_error().unwrap_or(0);
                    (st.on_error)(BenchError::Connection(errno), reactor);
                    return;
                }
                if event.writable {
                    let mut st = handler_inner.borrow_mut();
                    st.writable = true;
                    drain(&mut st, reactor);
                }
            }),
        );

        Self { token, inner }
    }

    pub fn enqueue(&self, reactor: &mut EpollReactor, bytes: &[u8]) {
        let mut st = self.inner.borrow_mut();
        st.write_list.extend_from_slice(bytes);
        if st.writable {
            drain(&mut st, reactor);
        }
    }

    pub fn pending_bytes(&self) -> usize {
        let st = self.inner.borrow();
        st.write_list.len() - st.cursor
    }

    pub fn token(&self) -> u64 {
        self.token
    }
}

fn drain(st: &mut SenderInner, _reactor: &mut EpollReactor) {
    while st.cursor < st.write_list.len() {
        match st.socket.send(&st.write_list[st.cursor..]) {
            Ok(n) => st.cursor += n,
            Err(BenchError::Transient) => {
                st.writable = false;
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "send() failed");
                st.write_list.clear();
                st.cursor = 0;
                return;
            }
        }
    }
    st.write_list.clear();
    st.cursor = 0;
}

#[cfg(test)]
mod tests {
    // Covered end-to-end by tcpbench-runtime's epoll loopback test.
}
