//! Benchmarks for frame encoding and decoding.
//!
//! These measure the client-side cost of turning typed requests into wire
//! bytes and wire bytes back into typed responses.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ember_core::protocol::{
    encode_collection_key, FrameCodec, LookupInSpec, Opcode, Request, Response, ResponseBody,
    StoreMode, DATATYPE_JSON, FLAGS_JSON,
};
use ember_core::{vbucket_for_key, DurabilityLevel};
use tokio_util::codec::{Decoder, Encoder};

fn benchmark_store_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_encode");
    group.throughput(Throughput::Elements(1));

    for value_size in [16, 256, 4096] {
        let value = Bytes::from("x".repeat(value_size));
        group.bench_with_input(BenchmarkId::new("value_size", value_size), &value, |b, v| {
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::with_capacity(8192);
            b.iter(|| {
                let key = encode_collection_key(8, b"benchmark-key");
                let vbucket = vbucket_for_key(b"benchmark-key", 1024);
                let request = Request::Store {
                    mode: StoreMode::Upsert,
                    key,
                    value: v.clone(),
                    flags: FLAGS_JSON,
                    expiry: 0,
                    cas: 0,
                    datatype: DATATYPE_JSON,
                    durability: DurabilityLevel::None,
                };
                let frame = request.encode(vbucket, 1).unwrap();
                buf.clear();
                codec.encode(frame, &mut buf).unwrap();
                black_box(buf.len())
            })
        });
    }
    group.finish();
}

fn benchmark_get_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_decode");
    group.throughput(Throughput::Elements(1));

    for value_size in [16, 256, 4096] {
        let response = Response::success(
            Opcode::Get,
            7,
            42,
            ResponseBody::Document {
                flags: FLAGS_JSON,
                value: Bytes::from("y".repeat(value_size)),
            },
        );
        let mut wire = BytesMut::new();
        FrameCodec::new()
            .encode(response.to_frame(), &mut wire)
            .unwrap();

        group.bench_with_input(BenchmarkId::new("value_size", value_size), &wire, |b, w| {
            let mut codec = FrameCodec::new();
            b.iter(|| {
                let mut src = w.clone();
                let frame = codec.decode(&mut src).unwrap().unwrap();
                black_box(Response::decode(&frame))
            })
        });
    }
    group.finish();
}

fn benchmark_lookup_in_encode(c: &mut Criterion) {
    let specs: Vec<LookupInSpec> = (0..8).map(|i| LookupInSpec::get(format!("field{}", i))).collect();
    c.bench_function("lookup_in_encode_8_specs", |b| {
        b.iter(|| {
            let request = Request::LookupIn {
                key: Bytes::from_static(b"\x00profile"),
                specs: specs.clone(),
                access_deleted: false,
            };
            black_box(request.encode(3, 9).unwrap())
        })
    });
}

fn benchmark_vbucket_hash(c: &mut Criterion) {
    let keys: Vec<String> = (0..1000).map(|i| format!("user::{}", i)).collect();
    c.bench_function("vbucket_for_key_1000", |b| {
        b.iter(|| {
            let mut acc = 0u32;
            for key in &keys {
                acc += vbucket_for_key(key.as_bytes(), 1024) as u32;
            }
            black_box(acc)
        })
    });
}

criterion_group!(
    benches,
    benchmark_store_encode,
    benchmark_get_decode,
    benchmark_lookup_in_encode,
    benchmark_vbucket_hash
);
criterion_main!(benches);
