use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sentinel_core::{classify, DEFAULT_SAFE_THRESHOLD};
use sentinel_kem::{KemAlgorithm, KemScheme, MlKem768};

fn bench_classify(c: &mut Criterion) {
    c.bench_function("classify", |b| {
        b.iter(|| classify(black_box(1484), black_box(DEFAULT_SAFE_THRESHOLD)))
    });
}

fn bench_validate_public_key(c: &mut Criterion) {
    let pair = MlKem768.generate_keypair().expect("keypair");
    c.bench_function("validate_public_key/ML-KEM-768", |b| {
        b.iter(|| MlKem768.validate_public_key(black_box(&pair.public)))
    });
}

fn bench_kem_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("kem_round_trip");
    for algorithm in KemAlgorithm::ALL {
        let scheme = algorithm.scheme();
        let pair = scheme.generate_keypair().expect("keypair");
        group.bench_with_input(
            BenchmarkId::from_parameter(scheme.name()),
            &pair,
            |b, pair| {
                b.iter(|| {
                    let encapsulation = scheme
                        .encapsulate(black_box(&pair.public))
                        .expect("encapsulate");
                    let shared = scheme
                        .decapsulate(&pair.secret, &encapsulation.ciphertext)
                        .expect("decapsulate");
                    black_box(shared);
                })
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_classify,
    bench_validate_public_key,
    bench_kem_round_trip
);
criterion_main!(benches);
