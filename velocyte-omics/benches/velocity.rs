use criterion::{black_box, criterion_group, criterion_main, Criterion};
use velocyte_omics::sc_dynamics::{spliced, unspliced};
use velocyte_omics::{
    build_velocity_graph, compute_moments, fit_kinetics, CancelToken, FitMode, KineticsConfig,
    KineticsInput, MatrixData, MomentsConfig, NeighborGraph, VelocityGraphConfig, VelocityMatrix,
};

/// Honors `RUST_LOG`, e.g. `RUST_LOG=velocyte_omics=info`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn random_f64(n: usize, seed: u64) -> Vec<f64> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            (state >> 11) as f64 / (1u64 << 53) as f64
        })
        .collect()
}

/// Cells on a ring, each linked to its `k` following cells.
fn ring_graph(n_obs: usize, k: usize) -> NeighborGraph {
    let indices = (0..n_obs)
        .map(|i| (1..=k).map(|d| (i + d) % n_obs).collect())
        .collect();
    NeighborGraph::from_indices(indices).unwrap()
}

fn counts(n_obs: usize, n_vars: usize, seed: u64) -> Vec<Vec<f64>> {
    (0..n_obs)
        .map(|i| {
            random_f64(n_vars, seed + i as u64)
                .into_iter()
                .map(|x| (x * 10.0).floor())
                .collect()
        })
        .collect()
}

/// Gene-major columns following one induction/repression cycle.
fn trajectory_input(n_obs: usize, n_vars: usize) -> KineticsInput {
    let (alpha, beta, t_switch) = (5.0, 1.0, 4.0);
    let noise = random_f64(2 * n_obs * n_vars, 7);
    let mut s_cols = Vec::with_capacity(n_vars);
    let mut u_cols = Vec::with_capacity(n_vars);
    for g in 0..n_vars {
        let gamma = 0.3 + 0.1 * (g % 5) as f64;
        let u_sw = unspliced(t_switch, 0.0, alpha, beta);
        let s_sw = spliced(t_switch, 0.0, 0.0, alpha, beta, gamma);
        let (mut s, mut u) = (Vec::with_capacity(n_obs), Vec::with_capacity(n_obs));
        for i in 0..n_obs {
            let t = 10.0 * i as f64 / n_obs as f64;
            let (ui, si) = if t < t_switch {
                (unspliced(t, 0.0, alpha, beta), spliced(t, 0.0, 0.0, alpha, beta, gamma))
            } else {
                let tau = t - t_switch;
                (unspliced(tau, u_sw, 0.0, beta), spliced(tau, s_sw, u_sw, 0.0, beta, gamma))
            };
            let k = 2 * (g * n_obs + i);
            u.push((ui + 0.1 * noise[k]).max(0.0));
            s.push((si + 0.1 * noise[k + 1]).max(0.0));
        }
        s_cols.push(s);
        u_cols.push(u);
    }
    KineticsInput::from_columns(s_cols.clone(), u_cols.clone(), s_cols, u_cols).unwrap()
}

fn bench_moments(c: &mut Criterion) {
    init_tracing();
    let mut group = c.benchmark_group("moments");

    let s = MatrixData::Dense(counts(2_000, 200, 42));
    let u = MatrixData::Dense(counts(2_000, 200, 137));
    let graph = ring_graph(2_000, 30);
    let config = MomentsConfig::default();

    group.bench_function("2k_cells_x200_k30", |b| {
        b.iter(|| compute_moments(black_box(&s), black_box(&u), &graph, &config))
    });

    group.finish();
}

fn bench_kinetics(c: &mut Criterion) {
    let mut group = c.benchmark_group("kinetics");
    group.sample_size(10);

    let input = trajectory_input(500, 20);
    let genes: Vec<usize> = (0..20).collect();
    let cancel = CancelToken::new();

    let steady = KineticsConfig::default();
    group.bench_function("steady_state_500x20", |b| {
        b.iter(|| fit_kinetics(black_box(&input), &genes, &steady, &cancel))
    });

    let dynamical = KineticsConfig {
        mode: FitMode::Dynamical,
        max_iterations: 10,
        ..Default::default()
    };
    group.bench_function("dynamical_500x20_10iter", |b| {
        b.iter(|| fit_kinetics(black_box(&input), &genes, &dynamical, &cancel))
    });

    group.finish();
}

fn bench_velocity_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("velocity_graph");

    let n_obs = 2_000;
    let n_vars = 100;
    let expression = counts(n_obs, n_vars, 42);
    let columns = (0..n_vars)
        .map(|g| Some(random_f64(n_obs, 1_000 + g as u64).into_iter().map(|x| x - 0.5).collect()))
        .collect();
    let velocity = VelocityMatrix::new(n_obs, columns).unwrap();
    let graph = ring_graph(n_obs, 15);
    let config = VelocityGraphConfig::default();

    group.bench_function("2k_cells_x100_k15", |b| {
        b.iter(|| build_velocity_graph(black_box(&velocity), black_box(&expression), &graph, &config))
    });

    group.finish();
}

criterion_group!(benches, bench_moments, bench_kinetics, bench_velocity_graph);
criterion_main!(benches);
