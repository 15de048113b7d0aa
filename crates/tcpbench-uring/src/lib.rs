//! io_uring backend: a reactor implementing `tcpbench_core::Reactor`, provided/registered
//! buffer pools, a multishot acceptor, a multishot receiver, and a coalescing zero-copy
//! sender. Grounded throughout on `lib/uring/*` from the original source tree.

pub mod acceptor;
pub mod bundle_sender;
pub mod provided_buffer_pool;
pub mod reactor;
pub mod registered_buffer_pool;
pub mod receiver;

pub use acceptor::{AcceptCallback, Acceptor};
pub use bundle_sender::BundleSender;
pub use provided_buffer_pool::ProvidedBufferPool;
pub use reactor::{CqeView, FileHandle, UringReactor, UringReactorConfig};
pub use registered_buffer_pool::RegisteredBufferPool;
pub use receiver::{RecvCallback, RecvResult, Receiver};
