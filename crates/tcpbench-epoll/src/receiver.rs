//! Plain receiver for the epoll backend, grounded on `lib/bsd/receiver.hpp`/`.cpp`: one owned
//! buffer per connection (no provided-buffer ring or bundle support on this backend — see
//! the epoll-backend note in the design docs), read-until-EAGAIN on every edge.

use tcpbench_core::{BenchError, Result, Socket};

use crate::reactor::{EpollEvent, EpollReactor, Interest};

/// `Ok(0)` is a clean remote close; `Err` is a hard failure the caller should tear the
/// connection down on.
pub type RecvCallback = Box<dyn FnMut(Result<&[u8]>, &mut EpollReactor)>;

pub struct Receiver {
    token: u64,
}

impl Receiver {
    pub fn start(
        reactor: &mut EpollReactor,
        socket: Socket,
        buf_len: usize,
        mut callback: RecvCallback,
    ) -> Self {
        let fd = {
            use std::os::fd::AsRawFd;
            socket.as_raw_fd()
        };
        let socket = socket;
        let mut buf = vec![0u8; buf_len];

        let token = reactor.register(
            fd,
            Interest::Read,
            Box::new(move |event: EpollEvent, reactor: &mut EpollReactor| {
                if event.error {
                    let errno = socket.take_error().unwrap_or(0);
                    callback(Err(BenchError::Connection(errno)), reactor);
                    return;
                }
                loop {
                    match socket.recv(&mut buf) {
                        Ok(0) => {
                            callback(Ok(&[]), reactor);
                            break;
                        }
                        Ok(n) => callback(Ok(&buf[..n]), reactor),
                        Err(BenchError::Transient) => break,
                        Err(e) => {
                            callback(Err(e), reactor);
                            break;
                        }
                    }
                }
            }),
        );

        Self { token }
    }

    pub fn token(&self) -> u64 {
        self.token
    }
}

#[cfg(test)]
mod tests {
    // Covered end-to-end by tcpbench-runtime's epoll loopback test.
}
