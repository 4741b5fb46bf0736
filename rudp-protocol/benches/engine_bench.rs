use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rudp_protocol::header::{AckHeader, Datagram};
use rudp_protocol::receive::reorder_buffer;
use rudp_protocol::rtt::LinkHealth;
use rudp_protocol::send::SendEngine;
use rudp_protocol::sequence::Seq;
use std::sync::Arc;

fn data_datagram(seq: u8, len: usize) -> Vec<u8> {
    let mut bytes = vec![AckHeader::data(Seq::new(seq)).encode()];
    bytes.resize(len + 1, 0xAB);
    bytes
}

fn bench_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("header");

    group.bench_function("encode", |b| {
        let header = AckHeader::data(Seq::new(42));
        b.iter(|| black_box(black_box(header).encode()));
    });

    group.bench_function("decode", |b| {
        b.iter(|| black_box(AckHeader::decode(black_box(0xAA))));
    });

    group.bench_function("parse_datagram", |b| {
        let bytes = data_datagram(7, 1000);
        b.iter(|| {
            let datagram = Datagram::parse(black_box(&bytes)).unwrap();
            black_box(datagram);
        });
    });

    group.finish();
}

fn bench_sequence(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequence");

    group.bench_function("is_later_wrap", |b| {
        let a = Seq::new(1);
        let z = Seq::new(62);
        b.iter(|| black_box(black_box(a).is_later(black_box(z))));
    });

    group.bench_function("offset_from", |b| {
        let a = Seq::new(3);
        let z = Seq::new(60);
        b.iter(|| black_box(black_box(a).offset_from(black_box(z))));
    });

    group.finish();
}

fn bench_push_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("receive");
    let datagrams: Vec<_> = (0..24u8).rev().map(|s| data_datagram(s, 512)).collect();
    group.throughput(Throughput::Elements(datagrams.len() as u64));

    group.bench_function("push_reversed_then_drain", |b| {
        b.iter_batched(
            || reorder_buffer(1),
            |(mut writers, mut consumer)| {
                for datagram in &datagrams {
                    writers[0].push(datagram).unwrap();
                }
                black_box(consumer.drain().unwrap());
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_send(c: &mut Criterion) {
    let payload = vec![0u8; 512];

    c.bench_function("stage_complete", |b| {
        let mut engine = SendEngine::new(Arc::new(LinkHealth::default()));
        let mut seq = Seq::default();
        let mut now = 0u64;
        b.iter(|| {
            engine.stage(black_box(&payload), true, seq, now).unwrap();
            now += 1;
            engine.complete(seq, now).unwrap();
            seq = seq.next();
        });
    });

    c.bench_function("scan_idle_window", |b| {
        let mut engine = SendEngine::new(Arc::new(LinkHealth::default()));
        for s in 0..30 {
            engine.stage(&payload, true, Seq::new(s), 0).unwrap();
        }
        b.iter(|| black_box(engine.scan_for_resend(1000, black_box(10)).unwrap()));
    });
}

criterion_group!(benches, bench_header, bench_sequence, bench_push_drain, bench_send);
criterion_main!(benches);
