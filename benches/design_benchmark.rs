// ========================================================================================
//
//                 NETFORMULA MODEL MATRIX BENCHMARK
//
// ========================================================================================
//
// Compares dense and sparse model matrix construction, and a lasso path fit on each,
// for a formula dominated by one high-cardinality factor and its interaction with a
// numeric column.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use netformula::design::{Column, DesignOptions, Frame, model_matrix};
use netformula::options::FitOptions;
use netformula::fit;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Rows in the simulated data set.
const NUM_ROWS: usize = 5_000;
/// Level counts for the grouping factor; the x-axis of the comparison.
const LEVEL_COUNTS: [usize; 3] = [10, 100, 500];
const FORMULA: &str = "y ~ x + g + g:x";

fn simulate(levels: usize) -> Frame {
    let mut rng = StdRng::seed_from_u64(7);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let x: Vec<f64> = (0..NUM_ROWS).map(|_| noise.sample(&mut rng)).collect();
    let g: Vec<Option<String>> = (0..NUM_ROWS)
        .map(|_| Some(format!("level{:04}", rng.gen_range(0..levels))))
        .collect();
    let y: Vec<f64> = x
        .iter()
        .map(|xi| 1.5 * xi + noise.sample(&mut rng))
        .collect();
    Frame::new()
        .with_column("y", Column::numeric(y))
        .unwrap()
        .with_column("x", Column::numeric(x))
        .unwrap()
        .with_column("g", Column::factor(g))
        .unwrap()
}

fn benchmark_model_matrix(c: &mut Criterion) {
    let mut group = c.benchmark_group("model_matrix");
    for &levels in &LEVEL_COUNTS {
        let frame = simulate(levels);
        for sparse in [false, true] {
            let label = if sparse { "sparse" } else { "dense" };
            let options = DesignOptions {
                sparse,
                ..DesignOptions::default()
            };
            group.bench_with_input(BenchmarkId::new(label, levels), &frame, |b, frame| {
                b.iter(|| model_matrix(black_box(FORMULA), black_box(frame), options).unwrap())
            });
        }
    }
    group.finish();
}

fn benchmark_path_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("lasso_path");
    group.sample_size(10);
    for &levels in &LEVEL_COUNTS {
        let frame = simulate(levels);
        for sparse in [false, true] {
            let label = if sparse { "sparse" } else { "dense" };
            let options = FitOptions {
                sparse,
                nlambda: 20,
                ..FitOptions::default()
            };
            group.bench_with_input(BenchmarkId::new(label, levels), &frame, |b, frame| {
                b.iter(|| fit(black_box(FORMULA), black_box(frame), &options).unwrap())
            });
        }
    }
    group.finish();
}

criterion_group!(benches, benchmark_model_matrix, benchmark_path_fit);
criterion_main!(benches);
