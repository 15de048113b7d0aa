//! Plain accept-loop acceptor for the epoll backend, grounded on `lib/bsd/acceptor.hpp`/`.cpp`:
//! edge-triggered readability on the listening socket means "one or more connections are
//! ready", so every wakeup drains with `accept()` until `EAGAIN`.

use tcpbench_core::{BenchError, Socket};

use crate::reactor::{EpollEvent, EpollReactor, Interest};

pub type AcceptCallback = Box<dyn FnMut(Socket, &mut EpollReactor)>;

pub struct Acceptor {
    token: u64,
}

impl Acceptor {
    pub fn start(reactor: &mut EpollReactor, listener: Socket, mut callback: AcceptCallback) -> Self {
        let fd = {
            use std::os::fd::AsRawFd;
            listener.as_raw_fd()
        };
        let mut listener = Some(listener);

        let token = reactor.register(
            fd,
            Interest::Read,
            Box::new(move |event: EpollEvent, reactor: &mut EpollReactor| {
                if event.error || event.hangup {
                    tracing::error!("listening socket reported error/hangup");
                    return;
                }
                let Some(l) = listener.as_ref() else { return };
                loop {
                    match l.accept() {
                        Ok(sock) => callback(sock, reactor),
                        Err(BenchError::Transient) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept() failed");
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
