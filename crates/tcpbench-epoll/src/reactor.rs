//! Edge-triggered epoll reactor, grounded on `lib/bsd/io_context.hpp`/`.cpp`: one epoll
//! instance, a slot slab keyed the same way as the uring reactor (so `tcpbench-runtime` can
//! treat both backends identically), and a self-pipe wakeup fd since epoll has no built-in
//! cross-thread nudge.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::Duration;
use tcpbench_core::{BenchError, Reactor, Result};

/// What a registered fd is waiting for; matches the source's `interest` enum used to decide
/// whether a readiness edge should be drained once or read-until-EAGAIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

pub type EventHandler = Box<dyn FnMut(EpollEvent, &mut EpollReactor)>;

#[derive(Debug, Clone, Copy)]
pub struct EpollEvent {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

struct Registration {
    fd: RawFd,
    handler: EventHandler,
}

const WAKEUP_TOKEN: u64 = u64::MAX;
const MAX_EVENTS: usize = 256;

pub struct EpollReactor {
    epoll_fd: RawFd,
    registrations: HashMap<u64, Registration>,
    next_token: u64,
    wakeup_read_fd: RawFd,
    wakeup_write_fd: RawFd,
}

impl EpollReactor {
    pub fn new() -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(BenchError::Setup("epoll_create1() failed".into()));
        }

        let mut pipe_fds = [0i32; 2];
        if unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
            return Err(BenchError::Setup("pipe2() failed".into()));
        }
        let (wakeup_read_fd, wakeup_write_fd) = (pipe_fds[0], pipe_fds[1]);

        let mut reactor = Self {
            epoll_fd,
            registrations: HashMap::new(),
            next_token: 0,
            wakeup_read_fd,
            wakeup_write_fd,
        };
        reactor.register_wakeup_fd()?;
        Ok(reactor)
    }

    /// The wakeup pipe's write end, for building a `Send` waker independent of the (`!Send`)
    /// reactor itself — see `tcpbench_uring::UringReactor::wakeup_fd` for the same pattern.
    pub fn wakeup_fd(&self) -> RawFd {
        self.wakeup_write_fd
    }

    fn register_wakeup_fd(&mut self) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKEUP_TOKEN,
        };
        if unsafe {
            libc::epoll_ctl(
                self.epoll_fd,
                libc::EPOLL_CTL_ADD,
                self.wakeup_read_fd,
                &mut ev,
            )
        } < 0
        {
            return Err(BenchError::Setup("epoll_ctl(wakeup fd) failed".into()));
        }
        Ok(())
    }

    /// Registers `fd` edge-triggered for `interest`; returns a token to later `deregister`.
    pub fn register(&mut self, fd: RawFd, interest: Interest, handler: EventHandler) -> u64 {
        let token = self.next_token;
        self.next_token += 1;

        let mut mask = libc::EPOLLET as u32;
        mask |= match interest {
            Interest::Read => libc::EPOLLIN as u32,
            Interest::Write => libc::EPOLLOUT as u32,
            Interest::ReadWrite => (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        };

        let mut ev = libc::epoll_event { events: mask, u64: token };
        unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };

        self.registrations.insert(token, Registration { fd, handler });
        token
    }

    pub fn modify(&mut self, token: u64, interest: Interest) {
        let Some(reg) = self.registrations.get(&token) else {
            return;
        };
        let mut mask = libc::EPOLLET as u32;
        mask |= match interest {
            Interest::Read => libc::EPOLLIN as u32,
            Interest::Write => libc::EPOLLOUT as u32,
            Interest::ReadWrite => (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        };
        let mut ev = libc::epoll_event { events: mask, u64: token };
        unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, reg.fd, &mut ev) };
    }

    pub fn deregister(&mut self, token: u64) {
        if let Some(reg) = self.registrations.remove(&token) {
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, reg.fd, std::ptr::null_mut()) };
        }
    }

    fn wait(&mut self, timeout_ms: i32) -> Result<()> {
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        if n < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                return Ok(());
            }
            return Err(BenchError::FatalReactor(errno));
        }

        let mut fired: Vec<(u64, libc::epoll_event)> = Vec::with_capacity(n as usize);
        for ev in events.iter().take(n as usize) {
            fired.push((ev.u64, *ev));
        }

        for (token, ev) in fired {
            if token == WAKEUP_TOKEN {
                self.drain_wakeup_pipe();
                continue;
            }
            let Some(mut reg) = self.registrations.remove(&token) else {
                continue;
            };
            let event = EpollEvent {
                readable: ev.events & (libc::EPOLLIN as u32) != 0,
                writable: ev.events & (libc::EPOLLOUT as u32) != 0,
                error: ev.events & (libc::EPOLLERR as u32) != 0,
                hangup: ev.events & (libc::EPOLLHUP as u32) != 0,
            };
            (reg.handler)(event, self);
            // Handlers that want to keep listening re-register themselves (mirrors the
            // uring reactor's re-arm-on-completion pattern); default is one-shot delivery.
            self.registrations.entry(token).or_insert(reg);
        }
        Ok(())
    }

    fn drain_wakeup_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.wakeup_read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Reactor for EpollReactor {
    fn poll(&mut self) -> Result<()> {
        self.wait(0)
    }

    fn poll_wait(&mut self) -> Result<()> {
        self.wait(-1)
    }

    fn run_for(&mut self, timeout: Duration) -> Result<()> {
        self.wait(timeout.as_millis().min(i32::MAX as u128) as i32)
    }

    fn wakeup(&self) {
        let byte = [1u8];
        let ret = unsafe {
            libc::write(self.wakeup_write_fd, byte.as_ptr() as *const libc::c_void, 1)
        };
        if ret < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EAGAIN {
                tracing::warn!(errno, "epoll wakeup pipe write failed");
            }
        }
    }
}

impl Drop for EpollReactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup_read_fd);
            libc::close(self.wakeup_write_fd);
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_and_wakeup_does_not_panic() {
        let reactor = EpollReactor::new().unwrap();
        reactor.wakeup();
    }

    #[test]
    fn poll_drains_wakeup_without_blocking() {
        let mut reactor = EpollReactor::new().unwrap();
        reactor.wakeup();
        reactor.poll().unwrap();
    }
}
