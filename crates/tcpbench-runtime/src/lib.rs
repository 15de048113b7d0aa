//! Backend-agnostic connection framing, worker dispatch, and client pacing. Depends only on
//! `tcpbench-core` — nothing here mentions `io_uring` or `epoll` directly, so the same
//! `Worker<R>` drives either backend.

pub mod client;
pub mod conn_slab;
pub mod connection;
pub mod sample_conduit;
pub mod worker;

pub use client::{expected_sends, fill_payload, now_ns, run_paced, SenderConfig};
pub use conn_slab::ConnSlab;
pub use connection::{Connection, SampleFn};
pub use sample_conduit::{metrics_request, MetricsRequest, SampleConduit, SampleProducer};
pub use worker::{SharedConnection, Worker, WorkerInbox, WorkerTask};
