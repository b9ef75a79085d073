#[macro_use]
extern crate criterion;

use std::sync::Arc;

use criterion::{black_box, Criterion};

use ktrace_core::prelude::*;

fn bench_emit(c: &mut Criterion) {
    let mut group = c.benchmark_group("emit_throughput");

    for payload_len in [16, 256, 4096] {
        group.throughput(criterion::Throughput::Bytes(payload_len as u64));
        group.bench_function(format!("payload_{}", payload_len), |b| {
            let tree = Arc::new(ContextTree::new());
            let ctx = TraceContext::new(ContextId::new(1, 1), "bench", 0);
            tree.insert(ctx.clone(), None);
            let tracer = Tracer::builder(tree).build().unwrap();
            tracer
                .start_tracing(&ctx, ctx.id(), false, MemorySink::new(), Facilities::USER)
                .unwrap();
            let payload = vec![0xa5u8; payload_len];

            b.iter(|| {
                // Overflow is a valid outcome when the writer falls behind.
                let _ = tracer.emit(&ctx, EventKind::USER, b"", black_box(&payload), false);
            });
        });
    }
    group.finish();
}

fn bench_allocate(c: &mut Criterion) {
    let tree = Arc::new(ContextTree::new());
    let ctx = TraceContext::new(ContextId::new(1, 1), "bench", 0);
    tree.insert(ctx.clone(), None);
    let tracer = Tracer::builder(tree).build().unwrap();

    c.bench_function("allocate_small_entry", |b| {
        b.iter(|| {
            let mut entry = tracer
                .allocate(&ctx, EventKind::SYSCALL, &[0; 8], 32)
                .unwrap();
            entry.put_payload(black_box(&[1; 32])).unwrap();
            black_box(entry.body_len())
        });
    });
}

criterion_group!(benches, bench_emit, bench_allocate);
criterion_main!(benches);
