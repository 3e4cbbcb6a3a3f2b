//! Performance benchmarks for ziti-crypto.
//!
//! Run with: `cargo bench -p ziti-crypto`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ziti_crypto::secret_stream::StreamState;
use ziti_crypto::{KxKeyPair, KxRole, Tag};

// ============================================================================
// Secret Stream Benchmarks
// ============================================================================

fn bench_stream_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("secret_stream_push");

    for size in [64, 1024, 16384, 65536] {
        let mut state = StreamState::init_push_with_header(&[0x42; 32], &[0x24; 24]);
        let plaintext = vec![0xAA; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| state.push(black_box(&plaintext), Tag::Message))
        });
    }

    group.finish();
}

fn bench_stream_pull(c: &mut Criterion) {
    let mut group = c.benchmark_group("secret_stream_pull");

    for size in [64, 1024, 16384, 65536] {
        let plaintext = vec![0xAA; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            // Pull state ratchets, so each iteration needs a fresh frame.
            b.iter_batched(
                || {
                    let mut tx = StreamState::init_push_with_header(&[0x42; 32], &[0x24; 24]);
                    let rx = StreamState::init_pull(&[0x42; 32], &[0x24; 24]).unwrap();
                    (rx, tx.push(&plaintext, Tag::Message))
                },
                |(mut rx, frame)| rx.pull(black_box(&frame)).unwrap(),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

// ============================================================================
// Key Agreement Benchmarks
// ============================================================================

fn bench_key_agreement(c: &mut Criterion) {
    let router = KxKeyPair::generate().public_key();

    c.bench_function("kx_agree_and_derive", |b| {
        b.iter(|| {
            let client = KxKeyPair::generate();
            let shared = client.agree(black_box(&router), KxRole::Client).unwrap();
            shared.session_pair(black_box(1))
        })
    });
}

criterion_group!(
    benches,
    bench_stream_push,
    bench_stream_pull,
    bench_key_agreement
);
criterion_main!(benches);
