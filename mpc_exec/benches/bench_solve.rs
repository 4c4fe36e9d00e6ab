//! # Trajectory Optimiser Benchmark

use criterion::{criterion_group, criterion_main, Criterion};

use mpc_lib::mpc::{
    AugLagSolver, LatencyCompensator, Params, ReferenceCurve, TrajOptimiser, VehicleState,
    Actuation,
};

fn solve_benchmark(c: &mut Criterion) {
    // ---- Build the reference and initial state ----

    let mut params = Params::default();
    params.ref_speed_ms = 30.0;

    // Waypoints along a gentle left hand bend, vehicle frame
    let xs: Vec<f64> = (0..6).map(|i| i as f64 * 10.0).collect();
    let ys: Vec<f64> = xs.iter().map(|x| 0.5 + 0.005 * x * x).collect();
    let curve = ReferenceCurve::fit(&xs, &ys, params.curve_order).unwrap();

    let state = VehicleState {
        v_ms: 25.0,
        cte_m: curve.eval(0.0),
        epsi_rad: -curve.derivative(0.0).atan(),
        ..Default::default()
    };

    let compensator = LatencyCompensator::new(&params);
    let init = compensator.compensate(
        &state,
        &Actuation { delta_rad: -0.05, a: 0.3 },
        &curve,
        params.default_latency_s,
    );

    // ---- Bench the sparse and dense derivative solves ----

    let sparse = TrajOptimiser::new(params.clone(), AugLagSolver::new(params.solver.clone()));

    c.bench_function("TrajOptimiser::solve::sparse", |b| {
        b.iter(|| sparse.solve(&init, &curve))
    });

    let mut dense_params = params.clone();
    dense_params.solver.sparse_derivatives = false;
    let dense = TrajOptimiser::new(
        dense_params.clone(),
        AugLagSolver::new(dense_params.solver),
    );

    let mut group = c.benchmark_group("dense");
    group.sample_size(10);
    group.bench_function("TrajOptimiser::solve::dense", |b| {
        b.iter(|| dense.solve(&init, &curve))
    });
    group.finish();
}

criterion_group!(benches, solve_benchmark);
criterion_main!(benches);
