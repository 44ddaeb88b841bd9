//! Helix transport performance smoke benchmarks.
//!
//! Run with `cargo run --example perf_baseline --release` (optionally set
//! `HELIX_BENCH_ITERS` to control the iteration count).

use std::env;
use std::time::{Duration, Instant};

use helix::protocol::{MAX_FRAME_SIZE, read_frame_type};
use helix::transport::{
    AEAD_KEY_LEN, AEAD_NONCE_LEN, Aead, AckFrameWriter, AckRange, AesGcmAead, BufferPool,
    CongestionConfig, CongestionControl, CubicCongestion, GeneKey, GeneWindow, coalesce,
    decode_ack_entries,
};

const DEFAULT_ITERATIONS: usize = 100_000;

fn main() {
    let iterations = iterations_from_env();
    println!("Helix perf baseline - iterations: {iterations}");
    println!("-----------------------------------------------------------------");

    bench_packet_path(iterations);
    bench_ack_path(iterations);
    bench_congestion(iterations);
    bench_gene_window(iterations);
}

fn iterations_from_env() -> usize {
    env::var("HELIX_BENCH_ITERS")
        .ok()
        .and_then(|raw| raw.parse::<usize>().ok())
        .filter(|iters| *iters > 0)
        .unwrap_or(DEFAULT_ITERATIONS)
}

fn run_bench<F>(label: &str, iterations: usize, mut body: F)
where
    F: FnMut(),
{
    const WARMUP: usize = 1_000;
    for _ in 0..WARMUP {
        body();
    }

    let start = Instant::now();
    for _ in 0..iterations {
        body();
    }
    let elapsed = start.elapsed();

    report(label, iterations, elapsed);
}

#[allow(clippy::cast_precision_loss)]
fn report(label: &str, iterations: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::MIN_POSITIVE);
    let ns_per_op = elapsed.as_nanos() as f64 / iterations as f64;
    let throughput = iterations as f64 / secs;
    let mops = throughput / 1_000_000.0;
    println!("{label:<32} total={elapsed:?} | {ns_per_op:>8.1} ns/op | {mops:>7.2} Mops/s");
}

fn bench_packet_path(iterations: usize) {
    let pool = BufferPool::new(2048, 2);
    let aead = AesGcmAead::new(&[0x11; AEAD_KEY_LEN]);
    let payload = vec![0u8; 512];
    let aad = [0x5Au8; 18];
    let mut counter = 0u64;

    run_bench("gene_seal+open", iterations, || {
        counter += 1;
        let mut nonce = [0u8; AEAD_NONCE_LEN];
        nonce[4..].copy_from_slice(&counter.to_le_bytes());

        let mut buffer = pool.acquire();
        buffer.data_mut().extend_from_slice(&payload);
        let tag = aead
            .seal_in_place(&nonce, &aad, buffer.data_mut())
            .expect("seal gene");
        aead.open_in_place(&nonce, &aad, buffer.data_mut(), &tag)
            .expect("open gene");
        debug_assert_eq!(buffer.len(), payload.len());
    });
}

fn bench_ack_path(iterations: usize) {
    let arrived: Vec<i32> = (0..256).rev().filter(|position| position % 5 != 0).collect();
    let mut positions = Vec::with_capacity(arrived.len());
    let mut ranges: Vec<AckRange> = Vec::new();

    run_bench("ack_coalesce+write+decode", iterations, || {
        positions.clear();
        positions.extend_from_slice(&arrived);
        ranges.clear();
        coalesce(&mut positions, 0, &mut ranges);

        let mut writer = AckFrameWriter::new(MAX_FRAME_SIZE);
        writer.write_burst(1);
        writer.write_block(2, 256, 0, &ranges);
        for frame in writer.finish() {
            let mut buf = frame.as_slice();
            read_frame_type(&mut buf).expect("frame type");
            let entries = decode_ack_entries(buf).expect("decode acks");
            debug_assert!(!entries.is_empty());
        }
    });
}

fn bench_congestion(iterations: usize) {
    let cubic = CubicCongestion::new(CongestionConfig::default());
    let mut now = 0i64;
    let mut position = 0i32;

    run_bench("cubic_in_flight_cycle", iterations, || {
        let key = GeneKey {
            transmission_id: 7,
            position,
        };
        cubic.add_in_flight(key, 1400, now);
        now += 25;
        cubic.remove_in_flight(key, true, now);
        position = position.wrapping_add(1) & 0x00FF_FFFF;
    });
}

fn bench_gene_window(iterations: usize) {
    let mut window: GeneWindow<u32> = GeneWindow::new(256);

    run_bench("gene_window_insert_advance", iterations, || {
        let base = window.base();
        window.insert(base, 0).expect("slot free");
        window.advance_to(base + 1);
    });
}
