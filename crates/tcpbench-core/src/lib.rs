//! Shared primitives for the tcpbench load-generator / echo-sink harness.
//!
//! Program to the interface, not the implementation: this crate only defines the shapes
//! (`Socket`, id newtypes, `Counters`/`Sample`, the `Reactor` trait, the error taxonomy)
//! that both the `io_uring` and `epoll` backends, and the worker/runtime layer above them,
//! agree on. Nothing in here touches `io_uring` or `epoll` directly.

pub mod error;
pub mod ids;
pub mod ref_or_own;
pub mod reactor;
pub mod sample;
pub mod socket;

pub use error::{BenchError, Result};
pub use ids::{BufferId, BufferIndex, GroupId, WorkerId};
pub use reactor::Reactor;
pub use ref_or_own::RefOrOwn;
pub use sample::{CounterSnapshot, Counters, Sample};
pub use socket::Socket;
