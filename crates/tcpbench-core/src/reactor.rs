use crate::error::Result;
use std::time::Duration;

/// Common pump surface both the `io_uring` and `epoll` backends expose, so that
/// `tcpbench-runtime::Worker` can drive either one without caring which. Grounded on
/// `lib/uring/io_context.hpp`'s `poll`/`poll_wait`/`run_for` trio; the epoll backend
/// implements the same three entry points over `epoll_wait`.
pub trait Reactor {
    /// Finish any deferred preparations, submit non-blocking, drain up to a bounded batch
    /// of already-ready completions, and return immediately.
    fn poll(&mut self) -> Result<()>;

    /// Finish preparations, submit, and block until at least one completion is ready, then
    /// drain everything currently available.
    fn poll_wait(&mut self) -> Result<()>;

    /// Like `poll_wait` but bounded by `timeout`; a timeout or an interrupted wait is success
    /// with zero completions processed, never an error.
    fn run_for(&mut self, timeout: Duration) -> Result<()>;

    /// Unblocks a concurrent `poll_wait`/`run_for` call from another thread. Safe to call
    /// from any thread at any time.
    fn wakeup(&self);
}
