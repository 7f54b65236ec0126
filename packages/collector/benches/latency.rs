//! Latency benchmarks for the collector hot path
//!
//! Every observation is decoded once at the connector and then written and
//! deduplicated by the processor, so both must stay well below a millisecond.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use chrono::{DateTime, TimeDelta};
use mempool_collector::codec::{decode_raw, encode_raw, hex_to_bytes};
use mempool_collector::files::FileManager;
use mempool_collector::observation::Observation;
use mempool_collector::processor::Processor;

const SAMPLE_RAW: &str = "0x02f873018305643b840f2c19f08503f8bfbbb2832ab980940ed1bcc400acd34593451e76f854992198995f52808498e5b12ac080a051eb99ae13fd1ace55dd93a4b36eefa5d34e115cd7b9fd5d0ffac07300cbaeb2a0782d9ad12490b45af932d8c98cb3c2fd8c02cdd6317edb36bde2df7556fa9132";

/// Benchmark transaction decoding
fn bench_decode_transaction(c: &mut Criterion) {
    let raw = hex_to_bytes(SAMPLE_RAW).unwrap();

    c.bench_function("decode_raw", |b| {
        b.iter(|| black_box(decode_raw(black_box(&raw)).unwrap()))
    });
}

/// Benchmark canonical re-encoding
fn bench_encode_transaction(c: &mut Criterion) {
    let tx = decode_raw(&hex_to_bytes(SAMPLE_RAW).unwrap()).unwrap();

    c.bench_function("encode_raw", |b| {
        b.iter(|| black_box(encode_raw(black_box(&tx))))
    });
}

/// Benchmark the processor on duplicate sightings (sourcelog row only)
fn bench_process_duplicate(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut processor = Processor::new(FileManager::new(dir.path(), Some("bench".into()), true).unwrap());
    let tx = decode_raw(&hex_to_bytes(SAMPLE_RAW).unwrap()).unwrap();
    let t0 = DateTime::from_timestamp_millis(1_703_000_000_000).unwrap();

    processor.process(&Observation::at(t0, "local", tx.clone())).unwrap();
    let duplicate = Observation::at(t0 + TimeDelta::milliseconds(5), "blx", tx);

    c.bench_function("process_duplicate", |b| {
        b.iter(|| black_box(processor.process(black_box(&duplicate)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_decode_transaction,
    bench_encode_transaction,
    bench_process_duplicate
);

criterion_main!(benches);
