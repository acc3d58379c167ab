use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vether_crypto::c25519::C25519Secret;
use vether_crypto::ed25519::Ed25519Secret;
use vether_crypto::memhard::memory_hard_digest;
use vether_crypto::poly::{packet_mac, poly1305_tag};
use vether_crypto::salsa::Salsa12Stream;
use vether_crypto::sha512::sha512;

fn bench_hashing(c: &mut Criterion) {
    let mut group = c.benchmark_group("hashing");

    let data_64 = vec![0xABu8; 64];
    let data_1k = vec![0xABu8; 1024];
    let data_64k = vec![0xABu8; 65536];

    for (label, data) in [("64B", &data_64), ("1KB", &data_1k), ("64KB", &data_64k)] {
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::new("sha512", label), data, |b, d| {
            b.iter(|| sha512(d));
        });
    }

    group.bench_function("memory_hard_digest", |b| {
        let input = [0x5Au8; 64];
        b.iter(|| memory_hard_digest(&input));
    });

    group.finish();
}

fn bench_symmetric(c: &mut Criterion) {
    let mut group = c.benchmark_group("symmetric");

    let key = [0x42u8; 32];
    let iv = [0x13u8; 8];

    let data_64 = vec![0xABu8; 64];
    let data_1k = vec![0xABu8; 1024];
    let data_64k = vec![0xABu8; 65536];

    for (label, data) in [("64B", &data_64), ("1KB", &data_1k), ("64KB", &data_64k)] {
        group.throughput(Throughput::Bytes(data.len() as u64));

        group.bench_with_input(BenchmarkId::new("salsa2012", label), data, |b, d| {
            b.iter(|| {
                let mut buf = d.clone();
                Salsa12Stream::new(&key, &iv).apply(&mut buf);
                buf
            });
        });
        group.bench_with_input(BenchmarkId::new("poly1305", label), data, |b, d| {
            b.iter(|| poly1305_tag(&key, d));
        });
        group.bench_with_input(BenchmarkId::new("packet_mac", label), data, |b, d| {
            b.iter(|| packet_mac(&key, d));
        });
    }

    group.finish();
}

fn bench_asymmetric(c: &mut Criterion) {
    let mut group = c.benchmark_group("asymmetric");

    let a = C25519Secret::from_bytes([0x11; 32]);
    let b_pub = C25519Secret::from_bytes([0x22; 32]).public_key();
    group.bench_function("c25519_shared_key", |bench| {
        bench.iter(|| a.shared_key(&b_pub));
    });

    let signer = Ed25519Secret::from_bytes([0x33; 32]);
    let message = vec![0xCDu8; 256];
    let sig = signer.sign(&message);
    group.bench_function("ed25519_sign_256B", |bench| {
        bench.iter(|| signer.sign(&message));
    });
    group.bench_function("ed25519_verify_256B", |bench| {
        let public = signer.public_key();
        bench.iter(|| public.verify(&message, &sig).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_hashing, bench_symmetric, bench_asymmetric);
criterion_main!(benches);
