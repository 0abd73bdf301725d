//! Benchmarks for core VeriTag operations.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use veritag_core::{
    config::Limits,
    identity::Identity,
    item::{derive_identifier, parse_qr_payload},
    registry::Registry,
    util,
};

fn bench_derive_identifier(c: &mut Criterion) {
    c.bench_function("derive_identifier", |b| {
        b.iter(|| derive_identifier(black_box(42), black_box("BENCH-SERIAL-000042")))
    });
}

fn bench_sha256(c: &mut Criterion) {
    let data = vec![0u8; 1024];
    c.bench_function("sha256_1kb", |b| {
        b.iter(|| util::sha256(black_box(&data)))
    });
}

fn bench_parse_qr_payload(c: &mut Criterion) {
    c.bench_function("parse_qr_payload_colon", |b| {
        b.iter(|| parse_qr_payload(black_box("42:BENCH-SERIAL-000042")).unwrap())
    });
    c.bench_function("parse_qr_payload_json", |b| {
        b.iter(|| {
            parse_qr_payload(black_box(
                r#"{"batchId": "42", "serialNumber": "BENCH-SERIAL-000042"}"#,
            ))
            .unwrap()
        })
    });
}

fn bench_register_batch(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("bench.db");
    let admin = Identity::from_bytes([0xAA; 20]);
    let mut registry = Registry::create_new(&db_path, admin, Limits::default()).unwrap();

    let mut batch_id = 0u64;
    c.bench_function("register_batch_10_items", |b| {
        b.iter(|| {
            batch_id += 1;
            let items: Vec<_> = (0..10)
                .map(|i| derive_identifier(batch_id, &format!("SN-{i}")))
                .collect();
            registry
                .register_batch(admin, batch_id, "Bench", "Acme", &items, None)
                .unwrap()
        })
    });
}

fn bench_verify(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("bench.db");
    let admin = Identity::from_bytes([0xAA; 20]);
    let verifier = Identity::from_bytes([0x01; 20]);
    let mut registry = Registry::create_new(&db_path, admin, Limits::default()).unwrap();
    registry
        .register_batch(admin, 1, "Bench", "Acme", &[derive_identifier(1, "SEED")], None)
        .unwrap();

    let mut n = 0u64;
    c.bench_function("verify_fresh_item", |b| {
        b.iter(|| {
            n += 1;
            let item = derive_identifier(1, &format!("BENCH-{n}"));
            registry.verify(verifier, item, 1).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_derive_identifier,
    bench_sha256,
    bench_parse_qr_payload,
    bench_register_batch,
    bench_verify
);
criterion_main!(benches);
