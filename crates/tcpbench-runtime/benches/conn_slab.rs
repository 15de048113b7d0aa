//! `ConnSlab` insert/remove churn — the hot path every accept and disconnect runs through
//! on the worker thread.

use criterion::{criterion_group, criterion_main, Criterion};
use tcpbench_runtime::ConnSlab;

fn bench_insert_remove_churn(c: &mut Criterion) {
    c.bench_function("conn_slab_insert_remove_1000", |b| {
        b.iter(|| {
            let mut slab: ConnSlab<usize> = ConnSlab::new();
            let ids: Vec<usize> = (0..1000).map(|i| slab.insert(i)).collect();
            for id in &ids {
                slab.remove(*id);
            }
        });
    });
}

fn bench_steady_state_reuse(c: &mut Criterion) {
    let mut slab: ConnSlab<usize> = ConnSlab::new();
    let warm: Vec<usize> = (0..256).map(|i| slab.insert(i)).collect();
    for id in &warm {
        slab.remove(*id);
    }

    c.bench_function("conn_slab_steady_state_reuse", |b| {
        b.iter(|| {
            let id = slab.insert(std::hint::black_box(1));
            slab.remove(id)
        });
    });
}

criterion_group!(benches, bench_insert_remove_churn, bench_steady_state_reuse);
criterion_main!(benches);
