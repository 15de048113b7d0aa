//! Non-blocking BSD socket primitive. Grounded on `lib/bsd/socket.hpp`/`.cpp`: move-only RAII,
//! `getaddrinfo`-based connect/bind trying each resolved address in turn, throwing-style
//! send/recv replaced with `Result`.

use crate::error::{BenchError, Result};
use std::ffi::CString;
use std::mem;
use std::net::Shutdown as NetShutdown;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::ptr;

/// Owns exactly one kernel file descriptor; non-copyable (no `Clone`), movable, closes on drop.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
}

fn cvt(ret: libc::c_int) -> Result<libc::c_int> {
    if ret < 0 {
        Err(BenchError::from_errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(0)))
    } else {
        Ok(ret)
    }
}

impl Socket {
    pub fn new(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> Result<Self> {
        let fd = unsafe { libc::socket(domain, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, protocol) };
        if fd < 0 {
            return Err(BenchError::Setup(format!(
                "socket(): {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Wrap a fd obtained elsewhere (e.g. from an `accept()` completion). Takes ownership.
    ///
    /// # Safety
    /// `fd` must be a valid, open, otherwise-unowned file descriptor.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Consumes the wrapper, handing the fd to the caller (e.g. a fixed-file registration).
    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }

    fn resolve(host: &str, port: &str) -> Result<Vec<libc::sockaddr_in>> {
        let chost = CString::new(host).map_err(|_| BenchError::Setup("host contains NUL".into()))?;
        let cport = CString::new(port).map_err(|_| BenchError::Setup("port contains NUL".into()))?;

        let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
        hints.ai_family = libc::AF_INET;
        hints.ai_socktype = libc::SOCK_STREAM;

        let mut res: *mut libc::addrinfo = ptr::null_mut();
        let rc = unsafe { libc::getaddrinfo(chost.as_ptr(), cport.as_ptr(), &hints, &mut res) };
        if rc != 0 {
            return Err(BenchError::Setup(format!("getaddrinfo({host}:{port}): rc={rc}")));
        }

        let mut addrs = Vec::new();
        let mut cur = res;
        while !cur.is_null() {
            let ai = unsafe { &*cur };
            if ai.ai_family == libc::AF_INET {
                let sockaddr = unsafe { *(ai.ai_addr as *const libc::sockaddr_in) };
                addrs.push(sockaddr);
            }
            cur = ai.ai_next;
        }
        unsafe { libc::freeaddrinfo(res) };

        if addrs.is_empty() {
            return Err(BenchError::Setup(format!("no addresses resolved for {host}:{port}")));
        }
        Ok(addrs)
    }

    /// Tries every resolved address in order, as the source does via its `ai_next` loop.
    pub fn connect(&self, host: &str, port: &str) -> Result<()> {
        let addrs = Self::resolve(host, port)?;
        let mut last_err = None;
        for addr in addrs {
            let rc = unsafe {
                libc::connect(
                    self.as_raw_fd(),
                    &addr as *const _ as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINPROGRESS {
                // non-blocking connect in flight; caller polls writability via the reactor
                return Ok(());
            }
            last_err = Some(errno);
        }
        Err(BenchError::Setup(format!(
            "connect({host}:{port}) failed on every address: errno={:?}",
            last_err
        )))
    }

    pub fn bind(&self, host: &str, port: &str) -> Result<()> {
        let addrs = Self::resolve(host, port)?;
        let addr = addrs[0];
        cvt(unsafe {
            libc::bind(
                self.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        cvt(unsafe { libc::listen(self.as_raw_fd(), backlog) })?;
        Ok(())
    }

    /// Non-blocking accept. `Transient` on EAGAIN/EWOULDBLOCK, caller loops until drained
    /// for the epoll backend; the io_uring backend never calls this directly (multishot
    /// accept is driven by the reactor instead).
    pub fn accept(&self) -> Result<Socket> {
        let fd = unsafe { libc::accept4(self.as_raw_fd(), ptr::null_mut(), ptr::null_mut(), libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC) };
        if fd < 0 {
            return Err(BenchError::from_errno(
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            ));
        }
        Ok(unsafe { Socket::from_raw_fd(fd) })
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let n = unsafe { libc::recv(self.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(BenchError::from_errno(
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            ));
        }
        Ok(n as usize)
    }

    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        let n = unsafe { libc::send(self.as_raw_fd(), buf.as_ptr() as *const libc::c_void, buf.len(), libc::MSG_NOSIGNAL) };
        if n < 0 {
            return Err(BenchError::from_errno(
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            ));
        }
        Ok(n as usize)
    }

    pub fn shutdown(&self, how: NetShutdown) -> Result<()> {
        let how = match how {
            NetShutdown::Read => libc::SHUT_RD,
            NetShutdown::Write => libc::SHUT_WR,
            NetShutdown::Both => libc::SHUT_RDWR,
        };
        cvt(unsafe { libc::shutdown(self.as_raw_fd(), how) })?;
        Ok(())
    }

    fn set_option<T>(&self, level: libc::c_int, name: libc::c_int, value: T) -> Result<()> {
        cvt(unsafe {
            libc::setsockopt(
                self.as_raw_fd(),
                level,
                name,
                &value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    pub fn set_nodelay(&self, enable: bool) -> Result<()> {
        self.set_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, enable as libc::c_int)
    }

    pub fn set_reuseaddr(&self, enable: bool) -> Result<()> {
        self.set_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, enable as libc::c_int)
    }

    pub fn set_reuseport(&self, enable: bool) -> Result<()> {
        self.set_option(libc::SOL_SOCKET, libc::SO_REUSEPORT, enable as libc::c_int)
    }

    pub fn set_recv_buffer_size(&self, size: i32) -> Result<()> {
        self.set_option(libc::SOL_SOCKET, libc::SO_RCVBUF, size)
    }

    pub fn set_send_buffer_size(&self, size: i32) -> Result<()> {
        self.set_option(libc::SOL_SOCKET, libc::SO_SNDBUF, size)
    }

    /// `SO_ZEROCOPY`: required before `send_zc`/`sendmsg_zc` on a socket. Linux 4.14+.
    pub fn set_zerocopy(&self, enable: bool) -> Result<()> {
        self.set_option(libc::SOL_SOCKET, libc::SO_ZEROCOPY, enable as libc::c_int)
    }

    pub fn set_nonblocking(&self, enable: bool) -> Result<()> {
        let flags = unsafe { libc::fcntl(self.as_raw_fd(), libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(BenchError::from_errno(
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            ));
        }
        let flags = if enable {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        cvt(unsafe { libc::fcntl(self.as_raw_fd(), libc::F_SETFL, flags) })?;
        Ok(())
    }

    /// Reads the pending `SO_ERROR` on a socket that surfaced `EPOLLERR`.
    pub fn take_error(&self) -> Result<i32> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockopt(
                self.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        })?;
        Ok(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_listen_connect_accept_round_trip() {
        let listener = Socket::new(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        listener.set_reuseaddr(true).unwrap();
        listener.bind("127.0.0.1", "0").unwrap();
        listener.listen(16).unwrap();

        // Discover the ephemeral port the kernel picked.
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                listener.as_raw_fd(),
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        assert_eq!(rc, 0);
        let port = u16::from_be(addr.sin_port).to_string();

        let client = Socket::new(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        client.connect("127.0.0.1", &port).unwrap();

        // Give the kernel a moment to complete the non-blocking handshake.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let accepted = listener.accept();
        assert!(accepted.is_ok());
    }

    #[test]
    fn nonexistent_host_is_setup_error() {
        let s = Socket::new(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let err = s.connect("256.256.256.256", "80");
        assert!(err.is_err());
    }
}
