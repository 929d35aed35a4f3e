// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Benchmarks for frame encoding, decoding and reassembly

use clen::{decode, encode, measurement::parse_payload, FrameAccumulator, MessageType, NodeId};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn generate_wire(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let sender = NodeId::new(format!("{:03X}", 0x00A + (i % 30))).unwrap();
            let data = format!("TE{}:HU{}:BV{}", 700 + i % 50, 40 + i % 20, 3300 - i % 100);
            encode(&sender, &NodeId::control(), &MessageType::Other("MSRVAL".into()), &data)
        })
        .collect()
}

fn bench_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("encoding");
    let node = NodeId::new("00A").unwrap();
    group.throughput(Throughput::Elements(1000));

    group.bench_function("encode_1000_queries", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                black_box(encode(&NodeId::control(), &node, &MessageType::QryMsr, ""));
            }
        })
    });

    group.finish();
}

fn bench_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("decoding");
    let wires = generate_wire(1000);
    group.throughput(Throughput::Elements(1000));

    group.bench_function("decode_1000_responses", |b| {
        b.iter(|| {
            for wire in &wires {
                let frame = decode(wire).unwrap();
                black_box(parse_payload(&frame.data));
            }
        })
    });

    group.finish();
}

fn bench_accumulator(c: &mut Criterion) {
    let mut group = c.benchmark_group("accumulator");
    let stream: Vec<u8> = generate_wire(1000)
        .iter()
        .flat_map(|w| format!("{}\r\n", w).into_bytes())
        .collect();
    group.throughput(Throughput::Bytes(stream.len() as u64));

    group.bench_function("reassemble_in_16_byte_reads", |b| {
        b.iter(|| {
            let mut acc = FrameAccumulator::new();
            let mut frames = 0usize;
            for chunk in stream.chunks(16) {
                acc.push(chunk);
                while let Some(frame) = acc.next_frame() {
                    if frame.is_ok() {
                        frames += 1;
                    }
                }
            }
            black_box(frames)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_encoding, bench_decoding, bench_accumulator);
criterion_main!(benches);
