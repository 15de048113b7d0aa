use std::fmt;

/// Error taxonomy shared by every backend (io_uring, epoll) and by the
/// worker/runtime layer. Kinds, not exhaustive payloads: callers match on
/// the variant to decide whether to retry, close a connection, or abort.
#[derive(Debug)]
pub enum BenchError {
    /// Socket/bind/listen/getaddrinfo/ring-init/buffer-registration failure. Fatal at startup.
    Setup(String),
    /// A non-blocking syscall would need to wait. Never surfaced to application callbacks;
    /// internal loops retry or enqueue a wait.
    Transient,
    /// Peer closed the connection (EOF on recv, or `res == 0` from a CQE).
    RemoteClose,
    /// Any other recv/send error, or EPOLLERR/EPOLLHUP.
    Connection(i32),
    /// A bounded queue (task inbox, bundle sender write_list, registered-buffer pool) had no room.
    Backpressure(&'static str),
    /// Handshake metadata header was short or malformed.
    Protocol(&'static str),
    /// Unrecoverable `io_uring_submit`/`epoll_wait` failure; the owning thread exits.
    FatalReactor(i32),
    /// Wrapped raw OS errno not covered by a more specific kind above.
    Os(i32),
}

pub type Result<T> = std::result::Result<T, BenchError>;

impl fmt::Display for BenchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenchError::Setup(msg) => write!(f, "setup failed: {msg}"),
            BenchError::Transient => write!(f, "transient I/O (would block)"),
            BenchError::RemoteClose => write!(f, "remote closed the connection"),
            BenchError::Connection(errno) => write!(f, "connection error: {}", errno_str(*errno)),
            BenchError::Backpressure(what) => write!(f, "backpressure: {what} is full"),
            BenchError::Protocol(what) => write!(f, "protocol error: {what}"),
            BenchError::FatalReactor(errno) => {
                write!(f, "fatal reactor error: {}", errno_str(*errno))
            }
            BenchError::Os(errno) => write!(f, "os error: {}", errno_str(*errno)),
        }
    }
}

impl std::error::Error for BenchError {}

impl BenchError {
    /// True for EAGAIN/EWOULDBLOCK/EINTR-shaped negative results.
    pub fn is_transient_errno(errno: i32) -> bool {
        errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINTR
    }

    pub fn from_errno(errno: i32) -> Self {
        if Self::is_transient_errno(errno) {
            BenchError::Transient
        } else {
            BenchError::Os(errno)
        }
    }
}

fn errno_str(errno: i32) -> String {
    let msg = std::io::Error::from_raw_os_error(errno);
    format!("{msg} (errno {errno})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(BenchError::is_transient_errno(libc::EAGAIN));
        assert!(BenchError::is_transient_errno(libc::EINTR));
        assert!(!BenchError::is_transient_errno(libc::ECONNRESET));
    }

    #[test]
    fn from_errno_routes_transient() {
        assert!(matches!(
            BenchError::from_errno(libc::EAGAIN),
            BenchError::Transient
        ));
        assert!(matches!(
            BenchError::from_errno(libc::ECONNRESET),
            BenchError::Os(_)
        ));
    }
}
