//! Benchmarks for the RTP video payloader and its Reed-Solomon FEC step,
//! the hot path on every encoded frame.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use moonlight_host::fec;
use moonlight_host::rtp::video::{payload_frame, VideoStreamState};

fn synthetic_frame(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn bench_payload_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_frame");
    for &frame_size in &[4 * 1024usize, 64 * 1024, 512 * 1024] {
        let frame = synthetic_frame(frame_size);
        group.bench_with_input(BenchmarkId::from_parameter(frame_size), &frame, |b, frame| {
            let mut state = VideoStreamState { cur_seq_number: 0, frame_num: 0 };
            b.iter(|| {
                let packets = payload_frame(
                    black_box(frame),
                    true,
                    1008,
                    20,
                    0,
                    &mut state,
                )
                .unwrap();
                black_box(packets.len())
            });
        });
    }
    group.finish();
}

fn bench_fec_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_encode");
    for &data_shards in &[16usize, 64, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(data_shards), &data_shards, |b, &data_shards| {
            let parity_shards = data_shards / 5;
            b.iter(|| {
                let mut shards: Vec<Vec<u8>> = (0..data_shards + parity_shards)
                    .map(|_| vec![0u8; 1008])
                    .collect();
                fec::encode(black_box(&mut shards), data_shards, parity_shards).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_payload_frame, bench_fec_encode);
criterion_main!(benches);
