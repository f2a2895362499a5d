use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use distinct_count::{
    DistinctCounter, Estimator, HyperLogLog, HyperLogLogEstimator, MartingaleEstimator,
    UltraLogLog, UltraLogLogEstimator,
};
use rand::prelude::*;

fn bench_insert_for<T: DistinctCounter>(c: &mut Criterion, name: &str) {
    let mut group = c.benchmark_group(format!("{name} Insert"));
    let mut rng = StdRng::seed_from_u64(42);

    for p in 8..=16 {
        let numbers: Vec<u64> = (0..10_000).map(|_| rng.gen()).collect();

        group.bench_with_input(BenchmarkId::from_parameter(p), &p, |b, &p| {
            b.iter(|| {
                let mut sketch = T::new(p).unwrap();
                for &num in numbers.iter() {
                    sketch.add(black_box(num));
                }
            });
        });
    }
    group.finish();
}

fn bench_insert(c: &mut Criterion) {
    bench_insert_for::<HyperLogLog>(c, "HyperLogLog");
    bench_insert_for::<UltraLogLog>(c, "UltraLogLog");
}

fn bench_insert_with_martingale(c: &mut Criterion) {
    let mut group = c.benchmark_group("UltraLogLog Insert (Martingale)");
    let mut rng = StdRng::seed_from_u64(42);
    let numbers: Vec<u64> = (0..10_000).map(|_| rng.gen()).collect();

    for p in [8, 12, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(p), &p, |b, &p| {
            b.iter(|| {
                let mut ull = UltraLogLog::new(p).unwrap();
                let mut martingale = MartingaleEstimator::new();
                for &num in numbers.iter() {
                    ull.add_with_martingale(black_box(num), &mut martingale);
                }
                black_box(martingale.distinct_count_estimate())
            });
        });
    }
    group.finish();
}

fn bench_estimate_for<T: DistinctCounter>(c: &mut Criterion, name: &str) {
    let mut rng = StdRng::seed_from_u64(42);
    for &estimator in <T::Estimator as Estimator<T>>::ALL {
        let mut group = c.benchmark_group(format!("{name} Estimate ({estimator:?})"));
        for p in 8..=16 {
            let mut sketch = T::new(p).unwrap();
            for _ in 0..10_000 {
                sketch.add(rng.gen());
            }

            group.bench_with_input(BenchmarkId::from_parameter(p), &p, |b, _| {
                b.iter(|| {
                    black_box(estimator.estimate(&sketch));
                });
            });
        }
        group.finish();
    }
}

fn bench_estimate(c: &mut Criterion) {
    bench_estimate_for::<HyperLogLog>(c, "HyperLogLog");
    bench_estimate_for::<UltraLogLog>(c, "UltraLogLog");
}

fn bench_estimator_comparison(c: &mut Criterion) {
    let mut group = c.benchmark_group("Estimator Comparison");
    let mut rng = StdRng::seed_from_u64(42);

    let p = 12;
    for &size in &[1000, 10_000, 100_000] {
        let mut ull = UltraLogLog::new(p).unwrap();
        let mut hll = HyperLogLog::new(p).unwrap();
        for _ in 0..size {
            let hash = rng.gen();
            ull.add(hash);
            hll.add(hash);
        }

        for &estimator in UltraLogLogEstimator::ALL {
            group.bench_with_input(
                BenchmarkId::new(format!("UltraLogLog {estimator:?}"), size),
                &size,
                |b, _| {
                    b.iter(|| {
                        black_box(estimator.estimate(&ull));
                    });
                },
            );
        }
        for &estimator in HyperLogLogEstimator::ALL {
            group.bench_with_input(
                BenchmarkId::new(format!("HyperLogLog {estimator:?}"), size),
                &size,
                |b, _| {
                    b.iter(|| {
                        black_box(estimator.estimate(&hll));
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("UltraLogLog Merge");
    let mut rng = StdRng::seed_from_u64(42);

    for p in [8, 12, 16] {
        let mut large = UltraLogLog::new(p + 2).unwrap();
        for _ in 0..10_000 {
            large.add(rng.gen());
        }
        group.bench_with_input(BenchmarkId::from_parameter(p), &p, |b, &p| {
            b.iter(|| {
                let mut ull = UltraLogLog::new(p).unwrap();
                ull.add_sketch(black_box(&large)).unwrap();
                black_box(ull)
            });
        });
    }
    group.finish();
}

fn bench_combined_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("UltraLogLog Combined");
    let mut rng = StdRng::seed_from_u64(42);

    for p in 8..=16 {
        let numbers: Vec<u64> = (0..1_000).map(|_| rng.gen()).collect();

        group.bench_with_input(BenchmarkId::from_parameter(p), &p, |b, &p| {
            b.iter(|| {
                let mut ull = UltraLogLog::new(p).unwrap();
                // Insert numbers in batches and estimate periodically
                for chunk in numbers.chunks(100) {
                    for &num in chunk {
                        ull.add(black_box(num));
                    }
                    black_box(ull.distinct_count_estimate());
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_insert,
    bench_insert_with_martingale,
    bench_estimate,
    bench_estimator_comparison,
    bench_merge,
    bench_combined_operations
);
criterion_main!(benches);
