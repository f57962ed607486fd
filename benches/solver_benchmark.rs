// ========================================================================================
//
//                      PENFIT COORDINATE-ASCENT SOLVER BENCHMARK
//
// ========================================================================================
//
// Measures one complete fit of a single synthetic partition for each fitting strategy.
// The LD matrix is a banded, truncated AR(1) correlation, which keeps it positive
// definite so no run triggers the divergence-retry path.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use penfit::data::{SumstatsDataset, SumstatsRow, VariantInfo};
use penfit::model::{ModelSettings, PenaltyKind, StrategyParams};
use penfit::solver::SummaryStatsModel;
use penfit::types::{FitStrategy, LambdaMin};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;

// --- Benchmark Tuning Parameters ---

/// Variants in the synthetic partition.
const NUM_VARIANTS: &[usize] = &[500, 2_000];
/// Off-diagonal band width of the LD matrix.
const LD_BAND: usize = 5;
/// Correlation decay between neighbouring variants.
const LD_DECAY: f64 = 0.4;
/// Every `CAUSAL_STRIDE`-th variant carries a real effect.
const CAUSAL_STRIDE: usize = 50;
const SAMPLE_SIZE: f64 = 50_000.0;

fn synthetic_partition(n: usize, seed: u64) -> SumstatsDataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let rows: Vec<SumstatsRow> = (0..n)
        .map(|i| {
            let noise: f64 = rng.gen_range(-1.5..1.5);
            let signal = if i % CAUSAL_STRIDE == 0 { 8.0 } else { 0.0 };
            SumstatsRow {
                variant: VariantInfo {
                    chromosome: "1".to_string(),
                    snp: format!("rs{i}"),
                    position: (i as i64 + 1) * 1_000,
                    a1: "A".to_string(),
                    a2: "G".to_string(),
                },
                z: signal + noise,
                n: SAMPLE_SIZE,
            }
        })
        .collect();

    let pairs: Vec<(String, String, f64)> = (0..n)
        .flat_map(|i| {
            (1..=LD_BAND)
                .filter(move |d| i + d < n)
                .map(move |d| (format!("rs{i}"), format!("rs{}", i + d), LD_DECAY.powi(d as i32)))
        })
        .collect();

    SumstatsDataset::from_rows(rows, &pairs).expect("synthetic partition is valid")
}

fn bench_strategies(c: &mut Criterion) {
    let settings = ModelSettings {
        penalty: PenaltyKind::Lasso,
        lambda_min: LambdaMin::Value(0.0),
    };

    let mut group = c.benchmark_group("solver_fit");
    group.sample_size(20);

    for &n in NUM_VARIANTS {
        let dataset = synthetic_partition(n, 42);

        for strategy in [
            FitStrategy::ColdStart,
            FitStrategy::WarmStartLadder,
            FitStrategy::Pathwise,
        ] {
            let params = StrategyParams {
                ladder_steps: 10,
                penalty_path: vec![0.02, 0.01, 0.005, 0.0025],
                ..StrategyParams::default()
            };
            group.bench_with_input(
                BenchmarkId::new(strategy.describe(), n),
                &params,
                |b, params| {
                    b.iter(|| {
                        let mut model = SummaryStatsModel::from_dataset(&dataset, &settings)
                            .expect("model construction");
                        strategy.apply(&mut model, params).expect("fit converges");
                        black_box(model.current_beta())
                    })
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_strategies);
criterion_main!(benches);
