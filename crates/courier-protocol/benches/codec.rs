//! Codec benchmarks for courier-protocol.

use courier_protocol::codec::{self, DEFAULT_MAX_BODY_SIZE};
use courier_protocol::{CorrelationId, Frame, MessageBody};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn bench_encode_small(c: &mut Criterion) {
    let frame = Frame::message(CorrelationId(1), "orders/eu", vec![0u8; 64]).unwrap();

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("message_64B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let frame = Frame::message(CorrelationId(1), "orders/eu", vec![0u8; 64]).unwrap();
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("message_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded), DEFAULT_MAX_BODY_SIZE))
    });
    group.finish();
}

fn bench_body_roundtrip(c: &mut Criterion) {
    let frame = Frame::message(CorrelationId(1), "orders/eu/created", vec![0u8; 256]).unwrap();

    c.bench_function("message_body_roundtrip_256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            let decoded = codec::decode(black_box(&encoded), DEFAULT_MAX_BODY_SIZE).unwrap();
            decoded.decode_body::<MessageBody>().unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_small,
    bench_decode_small,
    bench_body_roundtrip
);
criterion_main!(benches);
