//! Benchmarks for the block bitmap hot path

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use updraft_agent::BlockBitmap;

fn bench_mark_all(c: &mut Criterion) {
    c.bench_function("bitmap_mark_16k_blocks", |b| {
        b.iter(|| {
            let mut bitmap = BlockBitmap::with_capacity(16_384);
            bitmap.init(16_384).expect("init");
            for index in 0..16_384u32 {
                bitmap.mark_received(index).expect("mark");
            }
            black_box(bitmap.received_count())
        });
    });
}

fn bench_next_missing(c: &mut Criterion) {
    let mut bitmap = BlockBitmap::with_capacity(16_384);
    bitmap.init(16_384).expect("init");
    for index in (0..16_384u32).step_by(2) {
        bitmap.mark_received(index).expect("mark");
    }
    c.bench_function("bitmap_next_missing_batch_64", |b| {
        b.iter(|| black_box(bitmap.next_missing(64).collect::<Vec<_>>()));
    });
}

criterion_group!(benches, bench_mark_all, bench_next_missing);
criterion_main!(benches);
