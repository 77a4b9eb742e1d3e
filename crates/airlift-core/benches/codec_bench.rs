//! Criterion benchmarks for the frame and wire-message codecs.
//!
//! Run with: `cargo bench --package airlift-core`

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use airlift_core::protocol::frame::{encode_frame, FrameDecoder};
use airlift_core::protocol::messages::{decode_message, encode_message, WireMessage};

fn bench_frame_encode(c: &mut Criterion) {
    let payload = vec![0xA5u8; 64 * 1024];
    let mut group = c.benchmark_group("frame_encode");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("64KiB", |b| {
        b.iter(|| encode_frame(black_box(&payload)));
    });
    group.finish();
}

fn bench_frame_decode_chunked(c: &mut Criterion) {
    let payload = vec![0xA5u8; 64 * 1024];
    let wire = encode_frame(&payload);

    let mut group = c.benchmark_group("frame_decode");
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("64KiB_in_1500B_chunks", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            let mut frames = 0usize;
            for chunk in wire.chunks(1500) {
                for item in decoder.feed(black_box(chunk)) {
                    item.unwrap();
                    frames += 1;
                }
            }
            assert_eq!(frames, 1);
        });
    });
    group.finish();
}

fn bench_message_round_trip(c: &mut Criterion) {
    let msg = WireMessage::Blob(vec![0x5Au8; 4 * 1024]);
    c.bench_function("message_round_trip_4KiB_blob", |b| {
        b.iter(|| {
            let bytes = encode_message(black_box(&msg));
            decode_message(black_box(&bytes)).unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode_chunked,
    bench_message_round_trip
);
criterion_main!(benches);
