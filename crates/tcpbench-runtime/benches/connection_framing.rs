//! Throughput of `Connection::on_bytes` across a range of chunk shapes: one message per
//! call, several messages coalesced into one call, and a message split across two calls.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tcpbench_core::Counters;
use tcpbench_runtime::Connection;

fn framed_message(msg_size: usize, send_ts: u64) -> Vec<u8> {
    let mut msg = vec![0u8; msg_size];
    msg[..8].copy_from_slice(&send_ts.to_le_bytes());
    msg
}

fn bench_single_message(c: &mut Criterion) {
    let mut group = c.benchmark_group("on_bytes_single_message");
    for msg_size in [64usize, 1024, 8192] {
        group.bench_with_input(BenchmarkId::from_parameter(msg_size), &msg_size, |b, &msg_size| {
            let mut conn = Connection::new(0, Arc::new(Counters::default()), 1, Box::new(|_| {}));
            conn.on_bytes(&(msg_size as u64).to_le_bytes()).unwrap();
            let msg = framed_message(msg_size, 0);
            b.iter(|| conn.on_bytes(std::hint::black_box(&msg)).unwrap());
        });
    }
    group.finish();
}

fn bench_coalesced_messages(c: &mut Criterion) {
    let msg_size = 256usize;
    let mut conn = Connection::new(0, Arc::new(Counters::default()), 1, Box::new(|_| {}));
    conn.on_bytes(&(msg_size as u64).to_le_bytes()).unwrap();

    let mut chunk = Vec::new();
    for _ in 0..32 {
        chunk.extend_from_slice(&framed_message(msg_size, 0));
    }

    c.bench_function("on_bytes_32_messages_one_chunk", |b| {
        b.iter(|| conn.on_bytes(std::hint::black_box(&chunk)).unwrap());
    });
}

criterion_group!(benches, bench_single_message, bench_coalesced_messages);
criterion_main!(benches);
