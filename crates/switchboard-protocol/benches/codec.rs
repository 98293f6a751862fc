//! Codec benchmarks for switchboard-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;
use switchboard_protocol::{codec, Envelope};

fn small_envelope() -> Envelope {
    Envelope::room_message("chat:lobby", json!({ "text": "x".repeat(64) }))
}

fn bench_encode_small(c: &mut Criterion) {
    let envelope = small_envelope();

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("small_64B", |b| {
        b.iter(|| codec::encode(black_box(&envelope)))
    });
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let encoded = codec::encode(&small_envelope()).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("small_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_room_request(c: &mut Criterion) {
    let envelope = Envelope::join("chat:lobby");

    c.bench_function("room_request", |b| {
        b.iter(|| black_box(&envelope).room_request())
    });
}

criterion_group!(
    benches,
    bench_encode_small,
    bench_decode_small,
    bench_room_request
);
criterion_main!(benches);
