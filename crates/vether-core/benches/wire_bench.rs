use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vether_core::packet::{fragment_packet, CipherSuite, Packet};
use vether_core::types::Address;
use vether_core::verb::Verb;

fn armored(body_len: usize) -> Vec<u8> {
    let body: Vec<u8> = (0..body_len).map(|i| (i % 251) as u8).collect();
    let mut packet = Packet::new_outbound(
        Address::from_u64(0x0a0a0a0a0a),
        Address::from_u64(0x0b0b0b0b0b),
        Verb::Frame,
        &body,
    );
    packet.armor(&[0x42u8; 32], CipherSuite::Poly1305Salsa2012);
    packet.serialize()
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_codec");
    let key = [0x42u8; 32];

    for len in [64usize, 1024, 2800] {
        let raw = armored(len);
        group.throughput(Throughput::Bytes(raw.len() as u64));

        group.bench_with_input(BenchmarkId::new("parse", len), &raw, |b, r| {
            b.iter(|| Packet::parse(r).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("parse_dearmor", len), &raw, |b, r| {
            b.iter(|| {
                let mut p = Packet::parse(r).unwrap();
                p.dearmor(&key).unwrap();
                p
            });
        });
        group.bench_with_input(BenchmarkId::new("serialize", len), &raw, |b, r| {
            let packet = Packet::parse(r).unwrap();
            b.iter(|| packet.serialize());
        });
    }

    group.finish();
}

fn bench_fragmentation(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragmentation");

    let raw = armored(4000);
    group.throughput(Throughput::Bytes(raw.len() as u64));
    group.bench_function("fragment_4000B", |b| {
        b.iter(|| fragment_packet(&raw, 1444).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_codec, bench_fragmentation);
criterion_main!(benches);
