//! epoll backend: a fallback reactor for hosts without `io_uring`. No registered buffers, no
//! provided-buffer rings, no zero-copy — see the epoll-backend design note for the reasoning.

pub mod acceptor;
pub mod reactor;
pub mod receiver;
pub mod sender;

pub use acceptor::Acceptor;
pub use reactor::{EpollEvent, EpollReactor, Interest};
pub use receiver::Receiver;
pub use sender::Sender;
