use criterion::{black_box, criterion_group, criterion_main, Criterion};
use velocyte_stats::correlation::{cosine_similarity, pearson};
use velocyte_stats::descriptive::{masked_percentile, percentile, variance};
use velocyte_stats::regression::{fit_through_origin, fit_with_intercept};

fn random_f64(n: usize, seed: u64) -> Vec<f64> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            (state >> 11) as f64 / (1u64 << 53) as f64
        })
        .collect()
}

fn bench_descriptive(c: &mut Criterion) {
    let mut group = c.benchmark_group("descriptive");

    let data = random_f64(100_000, 42);
    let mask: Vec<bool> = data.iter().map(|&v| v > 0.25).collect();

    group.bench_function("variance_100k", |b| {
        b.iter(|| variance(black_box(&data), 0))
    });
    group.bench_function("percentile_100k", |b| {
        b.iter(|| percentile(black_box(&data), 95.0))
    });
    group.bench_function("masked_percentile_100k", |b| {
        b.iter(|| masked_percentile(black_box(&data), black_box(&mask), 99.0))
    });

    group.finish();
}

fn bench_regression(c: &mut Criterion) {
    let mut group = c.benchmark_group("regression");

    // one gene across 10k cells, 10% of cells selected as extremes
    let s = random_f64(10_000, 42);
    let u: Vec<f64> = s.iter().zip(random_f64(10_000, 137)).map(|(x, e)| 0.8 * x + 0.1 * e).collect();
    let mask: Vec<bool> = (0..10_000).map(|i| i % 10 == 0).collect();

    group.bench_function("through_origin_10k", |b| {
        b.iter(|| fit_through_origin(black_box(&s), black_box(&u), Some(&mask)))
    });
    group.bench_function("with_intercept_10k", |b| {
        b.iter(|| fit_with_intercept(black_box(&s), black_box(&u), Some(&mask)))
    });

    group.finish();
}

fn bench_similarity(c: &mut Criterion) {
    let mut group = c.benchmark_group("similarity");

    let x = random_f64(2_000, 42);
    let y = random_f64(2_000, 137);

    group.bench_function("cosine_2k_genes", |b| {
        b.iter(|| cosine_similarity(black_box(&x), black_box(&y), 1e-12))
    });
    group.bench_function("pearson_2k_genes", |b| {
        b.iter(|| pearson(black_box(&x), black_box(&y)))
    });

    group.finish();
}

criterion_group!(benches, bench_descriptive, bench_regression, bench_similarity);
criterion_main!(benches);
