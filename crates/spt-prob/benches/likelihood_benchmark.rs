use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use spt_core::{PopulationParameters, Trajectory};
use spt_prob::likelihood::{log_likelihood, log_likelihood_with_gradient};
use std::hint::black_box;

fn make_trajectory(n: usize, dim: usize) -> Trajectory {
    let coords: Vec<f64> = (0..n * dim).map(|i| ((i as f64) * 0.913).sin() * 0.3).collect();
    Trajectory::new(dim, coords).unwrap()
}

fn bench_log_likelihood_n_scaling(c: &mut Criterion) {
    let params = PopulationParameters::new(0.02, 0.5).unwrap();
    let blur = 1.0 / 6.0;

    let mut group = c.benchmark_group("likelihood/n_scaling");
    for n in [10usize, 100, 1_000] {
        let t = make_trajectory(n, 2);
        group.bench_with_input(BenchmarkId::new("value", n), &t, |b, t| {
            b.iter(|| black_box(log_likelihood(black_box(t), blur, &params).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("value_and_gradient", n), &t, |b, t| {
            b.iter(|| black_box(log_likelihood_with_gradient(black_box(t), blur, &params).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_log_likelihood_n_scaling);
criterion_main!(benches);
