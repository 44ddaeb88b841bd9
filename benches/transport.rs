//! Transport layer performance benchmarks
//!
//! Measures transport primitives performance.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

/// Benchmark buffer pool operations
fn bench_buffer_pool(c: &mut Criterion) {
    use helix::MAX_PACKET_SIZE;
    use helix::transport::BufferPool;

    let mut group = c.benchmark_group("buffer_pool");

    group.bench_function("acquire", |b| {
        let pool = BufferPool::new(MAX_PACKET_SIZE, 1024);
        b.iter(|| {
            let buffer = black_box(pool.acquire());
            black_box(buffer);
        });
    });

    // Freeze then share, as a resent gene does
    group.bench_function("rent_share_release", |b| {
        let pool = BufferPool::new(MAX_PACKET_SIZE, 1024);
        let packet = vec![0u8; MAX_PACKET_SIZE];
        b.iter(|| {
            let rent = pool.rent_from(&packet);
            let shared = rent.increment_and_share();
            drop(rent);
            black_box(shared.len());
        });
    });

    group.finish();
}

/// Benchmark congestion control
fn bench_congestion_control(c: &mut Criterion) {
    use helix::transport::{CongestionConfig, CongestionControl, CubicCongestion, GeneKey};

    let mut group = c.benchmark_group("congestion_control");

    group.bench_function("add_remove_in_flight", |b| {
        let cubic = CubicCongestion::new(CongestionConfig::default());
        let mut position = 0i32;
        let mut now = 0i64;
        b.iter(|| {
            let key = GeneKey {
                transmission_id: 1,
                position,
            };
            cubic.add_in_flight(key, 1400, now);
            now += 10;
            cubic.remove_in_flight(black_box(key), true, now);
            position = position.wrapping_add(1) & 0x00FF_FFFF;
        });
    });

    group.bench_function("loss_detected", |b| {
        let cubic = CubicCongestion::new(CongestionConfig::default());
        let mut now = 0i64;
        b.iter(|| {
            let key = GeneKey {
                transmission_id: 1,
                position: 0,
            };
            cubic.add_in_flight(key, 1400, now);
            now += 1_000;
            cubic.loss_detected(black_box(key), now);
        });
    });

    group.finish();
}

/// Benchmark ack coalescing
fn bench_coalesce(c: &mut Criterion) {
    use helix::transport::{AckRange, coalesce};

    let mut group = c.benchmark_group("coalesce");

    for pending in [16usize, 256, 4096] {
        // Positions arrive scrambled with every seventh one missing
        let positions: Vec<i32> = (0..i32::try_from(pending).unwrap())
            .rev()
            .filter(|position| position % 7 != 0)
            .collect();
        group.throughput(Throughput::Elements(pending as u64));
        group.bench_with_input(
            BenchmarkId::new("positions", pending),
            &positions,
            |b, positions| {
                let mut scratch = Vec::with_capacity(positions.len());
                let mut ranges: Vec<AckRange> = Vec::new();
                b.iter(|| {
                    scratch.clear();
                    scratch.extend_from_slice(positions);
                    ranges.clear();
                    coalesce(&mut scratch, 0, &mut ranges);
                    black_box(ranges.len());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark the positional gene window
fn bench_gene_window(c: &mut Criterion) {
    use helix::transport::GeneWindow;

    let mut group = c.benchmark_group("gene_window");

    for capacity in [64usize, 1024] {
        group.bench_with_input(
            BenchmarkId::new("insert_advance", capacity),
            &capacity,
            |b, &capacity| {
                let mut window: GeneWindow<u64> = GeneWindow::new(capacity);
                let span = i32::try_from(capacity).unwrap();
                b.iter(|| {
                    let base = window.base();
                    for position in base..base + span {
                        let _ = window.insert(position, 0);
                    }
                    window.advance_to(base + span);
                    black_box(window.len());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_buffer_pool,
    bench_congestion_control,
    bench_coalesce,
    bench_gene_window
);
criterion_main!(benches);
