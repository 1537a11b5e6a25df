use criterion::{black_box, criterion_group, criterion_main, Criterion};
use streamplex_core::{BufferSource, Pool, PoolConfig};

fn bench_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool");

    let pool = Pool::new(PoolConfig::new(2048).with_max_buffers(64)).unwrap();
    group.bench_function("request_release", |b| {
        b.iter(|| black_box(pool.request_buffer(None).unwrap()));
    });

    group.bench_function("frame_8_buffers", |b| {
        b.iter(|| black_box(pool.accept_req(8 * 2048, false, None).unwrap()));
    });

    group.bench_function("heap_alloc", |b| {
        b.iter(|| black_box(streamplex_core::Buffer::new(2048)));
    });

    group.finish();
}

criterion_group!(benches, bench_pool);
criterion_main!(benches);
