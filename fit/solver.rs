//! # Coordinate-Ascent Solver on Summary Statistics
//!
//! `SummaryStatsModel` fits penalized regression coefficients from marginal
//! associations and an LD matrix, minimising
//!
//! ```text
//! 0.5 * b'(R + lambda_min * I) b - r'b + penalty(b)
//! ```
//!
//! one coordinate at a time. The off-diagonal product `q = (R - I) b` is kept up to
//! date incrementally, so a sweep costs one pass over the non-zero LD entries.
//!
//! Two penalties are supported:
//!
//! - **Lasso:** a soft threshold at `lambda`. Its ladder walks down from
//!   `lambda_max = max |r_j|`, the smallest penalty with an all-zero solution.
//! - **Spike-and-slab lasso:** the threshold adapts per coordinate to the posterior
//!   slab weight of the current coefficient. Its ladder walks the spike rate up from
//!   the slab rate, so early steps are dense and later steps sparse.
//!
//! After every sweep the solution is checked; a non-finite or implausibly large
//! coefficient vector raises `OptimizationDivergence`, which the caller may answer by
//! raising `lambda_min`.

use crate::data::{SparseLd, SumstatsDataset, VariantInfo};
use crate::model::{ModelError, ModelSettings, PenalizedModel, PenaltyKind, StrategyParams};
use crate::types::{Criterion, LambdaMin};
use ahash::AHashMap;
use ndarray::{Array1, ArrayView1};
use polars::prelude::{DataFrame, NamedFrom, Series};

/// Largest admissible standardized coefficient, and largest admissible `|b'Rb|`.
pub const DIVERGENCE_BOUND: f64 = 10.0;
const POWER_ITERATIONS: usize = 1_000;
const POWER_TOLERANCE: f64 = 1e-10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitStatus {
    Unfitted,
    Fitted,
    Diverged,
}

impl FitStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Unfitted => "unfitted",
            Self::Fitted => "fitted",
            Self::Diverged => "diverged",
        }
    }
}

/// The solution found at one point of a penalty sequence.
#[derive(Clone, Debug)]
pub struct FittedConfiguration {
    pub penalty: f64,
    pub beta: Array1<f64>,
    pub sweeps: usize,
    pub converged: bool,
}

#[derive(Debug)]
pub struct SummaryStatsModel {
    penalty: PenaltyKind,
    variants: Vec<VariantInfo>,
    marginal: Array1<f64>,
    ld: SparseLd,
    n_eff: f64,
    lambda_min: f64,
    /// Floor used by the latest penalty sequence, which produced `configurations`.
    fitted_lambda_min: Option<f64>,
    configurations: Vec<FittedConfiguration>,
    selected: Option<usize>,
    status: FitStatus,
}

impl SummaryStatsModel {
    /// Binds a model to every variant of `dataset`. Chromosome blocks are stacked
    /// along the diagonal of one LD matrix.
    pub fn from_dataset(
        dataset: &SumstatsDataset,
        settings: &ModelSettings,
    ) -> Result<Self, ModelError> {
        let blocks = dataset.blocks()?;
        let variants: Vec<VariantInfo> = blocks
            .iter()
            .flat_map(|b| b.variants.iter().cloned())
            .collect();
        let marginal = Array1::from_iter(blocks.iter().flat_map(|b| b.marginal.iter().copied()));
        let total_n: f64 = blocks.iter().map(|b| b.sample_size.sum()).sum();
        let n_eff = if variants.is_empty() {
            1.0
        } else {
            total_n / variants.len() as f64
        };
        let ld = SparseLd::block_diagonal(blocks.iter().map(|b| &b.ld));

        let lambda_min = match settings.lambda_min {
            LambdaMin::Value(v) => v,
            LambdaMin::Infer => {
                let inferred = infer_lambda_min(&ld);
                log::debug!("Inferred lambda_min = {inferred:.6e} from {} variants", ld.n());
                inferred
            }
        };

        Ok(Self {
            penalty: settings.penalty,
            variants,
            marginal,
            ld,
            n_eff,
            lambda_min,
            fitted_lambda_min: None,
            configurations: Vec::new(),
            selected: None,
            status: FitStatus::Unfitted,
        })
    }

    pub fn status(&self) -> FitStatus {
        self.status
    }

    pub fn configurations(&self) -> &[FittedConfiguration] {
        &self.configurations
    }

    pub fn n_variants(&self) -> usize {
        self.variants.len()
    }

    /// The configuration reported by the table accessors: the selected one, or the
    /// last fitted one.
    pub fn current(&self) -> Option<&FittedConfiguration> {
        match self.selected {
            Some(idx) => self.configurations.get(idx),
            None => self.configurations.last(),
        }
    }

    pub fn current_beta(&self) -> Array1<f64> {
        self.current()
            .map(|c| c.beta.clone())
            .unwrap_or_else(|| Array1::zeros(self.variants.len()))
    }

    fn lambda_max(&self) -> f64 {
        self.marginal
            .iter()
            .fold(0.0_f64, |acc, r| acc.max(r.abs()))
            .max(f64::EPSILON)
    }

    fn ladder(&self, params: &StrategyParams) -> Vec<f64> {
        let steps = params.ladder_steps.max(1);
        let lambda_max = self.lambda_max();
        match self.penalty {
            PenaltyKind::Lasso => geometric_sequence(lambda_max, lambda_max * params.min_ratio, steps),
            PenaltyKind::SpikeSlab { slab, .. } => {
                geometric_sequence(slab, (self.n_eff * lambda_max).max(slab), steps)
            }
        }
    }

    fn reset(&mut self) {
        self.fitted_lambda_min = None;
        self.configurations.clear();
        self.selected = None;
        self.status = FitStatus::Unfitted;
    }

    fn run_sequence(
        &mut self,
        sequence: &[f64],
        warm: bool,
        params: &StrategyParams,
    ) -> Result<(), ModelError> {
        self.reset();
        if sequence.is_empty() {
            return Err(ModelError::EmptyPath);
        }
        self.fitted_lambda_min = Some(self.lambda_min);

        let n = self.variants.len();
        let mut beta = Array1::<f64>::zeros(n);
        let mut q = Array1::<f64>::zeros(n);
        for &penalty in sequence {
            if !warm {
                beta.fill(0.0);
                q.fill(0.0);
            }
            match self.solve_at(penalty, &mut beta, &mut q, params) {
                Ok((sweeps, converged)) => {
                    if !converged {
                        log::debug!(
                            "Penalty {penalty:.4e} stopped after {sweeps} sweeps without converging"
                        );
                    }
                    self.configurations.push(FittedConfiguration {
                        penalty,
                        beta: beta.clone(),
                        sweeps,
                        converged,
                    });
                }
                Err(err) => {
                    self.status = FitStatus::Diverged;
                    return Err(err);
                }
            }
        }
        self.status = FitStatus::Fitted;
        Ok(())
    }

    /// Runs coordinate sweeps at a single penalty until the largest coefficient change
    /// falls below the tolerance. Returns the sweep count and whether it converged.
    fn solve_at(
        &self,
        penalty: f64,
        beta: &mut Array1<f64>,
        q: &mut Array1<f64>,
        params: &StrategyParams,
    ) -> Result<(usize, bool), ModelError> {
        let denominator = 1.0 + self.lambda_min;
        for sweep in 1..=params.max_iterations.max(1) {
            let mut max_change = 0.0_f64;
            for j in 0..beta.len() {
                let z = self.marginal[j] - q[j];
                let threshold = match self.penalty {
                    PenaltyKind::Lasso => penalty,
                    PenaltyKind::SpikeSlab { slab, theta } => {
                        ssl_rate(beta[j], penalty, slab, theta) / self.n_eff
                    }
                };
                let updated = soft_threshold(z, threshold) / denominator;
                let delta = updated - beta[j];
                if delta != 0.0 {
                    for &(k, r) in self.ld.row(j) {
                        q[k] += r * delta;
                    }
                    beta[j] = updated;
                    max_change = max_change.max(delta.abs());
                }
            }

            check_divergence(beta.view(), q.view(), penalty, sweep)?;
            if max_change < params.tolerance {
                return Ok((sweep, true));
            }
        }
        Ok((params.max_iterations.max(1), false))
    }

    /// Validation marginals aligned to this model's variants. Swapped alleles flip
    /// the sign; variants that are absent or carry different alleles contribute zero.
    fn align_validation(&self, validation: &SumstatsDataset) -> Result<Array1<f64>, ModelError> {
        let mut lookup: AHashMap<&str, (&VariantInfo, f64)> = AHashMap::new();
        for block in validation.blocks()? {
            for (variant, &r) in block.variants.iter().zip(block.marginal.iter()) {
                lookup.insert(variant.snp.as_str(), (variant, r));
            }
        }

        let mut missing = 0usize;
        let aligned = Array1::from_iter(self.variants.iter().map(|variant| {
            match lookup.get(variant.snp.as_str()) {
                Some((other, r)) if other.a1 == variant.a1 && other.a2 == variant.a2 => *r,
                Some((other, r)) if other.a1 == variant.a2 && other.a2 == variant.a1 => -*r,
                _ => {
                    missing += 1;
                    0.0
                }
            }
        }));
        if missing > 0 {
            log::debug!(
                "{missing} of {} training variants have no usable validation statistic",
                self.variants.len()
            );
        }
        Ok(aligned)
    }

    fn score(&self, beta: ArrayView1<f64>, validation: &Array1<f64>, criterion: Criterion) -> f64 {
        let explained = self.ld.quadratic_form(beta);
        let covariance = validation.dot(&beta);
        match criterion {
            Criterion::PseudoValidation => {
                if explained > 0.0 {
                    covariance / explained.sqrt()
                } else {
                    0.0
                }
            }
            Criterion::ValidationLoss => 0.5 * explained - covariance,
        }
    }
}

impl PenalizedModel for SummaryStatsModel {
    type Dataset = SumstatsDataset;

    fn lambda_min(&self) -> f64 {
        self.lambda_min
    }

    fn set_lambda_min(&mut self, value: f64) {
        self.lambda_min = value;
    }

    fn fit(&mut self, params: &StrategyParams) -> Result<(), ModelError> {
        let sequence = self.ladder(params);
        self.run_sequence(&sequence, false, params)
    }

    fn warm_start_fit(&mut self, params: &StrategyParams) -> Result<(), ModelError> {
        let sequence = self.ladder(params);
        self.run_sequence(&sequence, true, params)
    }

    fn pathwise_fit(&mut self, params: &StrategyParams) -> Result<(), ModelError> {
        if let Some(&value) = params
            .penalty_path
            .iter()
            .find(|v| !(v.is_finite() && **v > 0.0))
        {
            return Err(ModelError::InvalidPenalty { value });
        }
        let sequence = params.penalty_path.clone();
        self.run_sequence(&sequence, true, params)
    }

    fn select_best_model(
        &mut self,
        validation: &SumstatsDataset,
        criterion: Criterion,
    ) -> Result<DataFrame, ModelError> {
        if self.configurations.is_empty() {
            return Err(ModelError::NoCandidates);
        }
        let aligned = self.align_validation(validation)?;
        let scores: Vec<f64> = self
            .configurations
            .iter()
            .map(|c| self.score(c.beta.view(), &aligned, criterion))
            .collect();

        let mut best = 0usize;
        for (idx, &score) in scores.iter().enumerate().skip(1) {
            if criterion.prefers(score, scores[best]) {
                best = idx;
            }
        }
        self.selected = Some(best);
        log::debug!(
            "Selected penalty {:.4e} ({} = {:.6})",
            self.configurations[best].penalty,
            criterion.column_name(),
            scores[best]
        );

        let penalties: Vec<f64> = self.configurations.iter().map(|c| c.penalty).collect();
        let selected: Vec<bool> = (0..scores.len()).map(|idx| idx == best).collect();
        let df = DataFrame::new(vec![
            Series::new("Penalty".into(), penalties).into(),
            Series::new(criterion.column_name().into(), scores).into(),
            Series::new("Selected".into(), selected).into(),
        ])?;
        Ok(df)
    }

    fn to_table(&self) -> Result<DataFrame, ModelError> {
        let beta = self.current_beta();
        let df = DataFrame::new(vec![
            Series::new(
                "CHR".into(),
                self.variants.iter().map(|v| v.chromosome.clone()).collect::<Vec<_>>(),
            )
            .into(),
            Series::new(
                "SNP".into(),
                self.variants.iter().map(|v| v.snp.clone()).collect::<Vec<_>>(),
            )
            .into(),
            Series::new(
                "POS".into(),
                self.variants.iter().map(|v| v.position).collect::<Vec<_>>(),
            )
            .into(),
            Series::new(
                "A1".into(),
                self.variants.iter().map(|v| v.a1.clone()).collect::<Vec<_>>(),
            )
            .into(),
            Series::new(
                "A2".into(),
                self.variants.iter().map(|v| v.a2.clone()).collect::<Vec<_>>(),
            )
            .into(),
            Series::new("BETA".into(), beta.to_vec()).into(),
        ])?;
        Ok(df)
    }

    fn to_hyperparameter_table(&self) -> Result<DataFrame, ModelError> {
        let current = self.current();
        let mut columns = vec![
            Series::new("Model".into(), vec![self.penalty.name()]).into(),
            Series::new("Lambda_min".into(), vec![self.lambda_min]).into(),
            Series::new("Lambda_min_used".into(), vec![self.fitted_lambda_min]).into(),
            Series::new("Penalty".into(), vec![current.map(|c| c.penalty)]).into(),
        ];
        if let PenaltyKind::SpikeSlab { slab, theta } = self.penalty {
            columns.push(Series::new("Slab".into(), vec![slab]).into());
            columns.push(Series::new("Theta".into(), vec![theta]).into());
        }
        columns.push(
            Series::new(
                "Iterations".into(),
                vec![current.map(|c| c.sweeps as i64).unwrap_or(0)],
            )
            .into(),
        );
        columns.push(
            Series::new(
                "Converged".into(),
                vec![current.is_some_and(|c| c.converged)],
            )
            .into(),
        );
        columns.push(Series::new("Status".into(), vec![self.status.label()]).into());
        Ok(DataFrame::new(columns)?)
    }
}

fn soft_threshold(z: f64, threshold: f64) -> f64 {
    if z > threshold {
        z - threshold
    } else if z < -threshold {
        z + threshold
    } else {
        0.0
    }
}

/// Effective Laplace rate of the spike-and-slab mixture at coefficient `beta`:
/// the slab and spike rates weighted by the posterior slab probability.
fn ssl_rate(beta: f64, spike: f64, slab: f64, theta: f64) -> f64 {
    let log_odds_spike =
        ((1.0 - theta) / theta).ln() + (spike / slab).ln() - (spike - slab) * beta.abs();
    let slab_weight = 1.0 / (1.0 + log_odds_spike.exp());
    slab * slab_weight + spike * (1.0 - slab_weight)
}

fn check_divergence(
    beta: ArrayView1<f64>,
    q: ArrayView1<f64>,
    penalty: f64,
    sweeps: usize,
) -> Result<(), ModelError> {
    if let Some((j, value)) = beta
        .iter()
        .enumerate()
        .find(|(_, b)| !b.is_finite() || b.abs() > DIVERGENCE_BOUND)
    {
        return Err(ModelError::OptimizationDivergence {
            penalty,
            sweeps,
            detail: format!("coefficient {j} reached {value:e}"),
        });
    }
    let explained: f64 = beta.iter().zip(q.iter()).map(|(b, qj)| b * (b + qj)).sum();
    if !explained.is_finite() || explained.abs() > DIVERGENCE_BOUND {
        return Err(ModelError::OptimizationDivergence {
            penalty,
            sweeps,
            detail: format!("implied explained variance reached {explained:e}"),
        });
    }
    Ok(())
}

/// `steps` points from `start` to `end`, evenly spaced on the log scale.
fn geometric_sequence(start: f64, end: f64, steps: usize) -> Vec<f64> {
    if steps <= 1 {
        return vec![end];
    }
    let ratio = end / start;
    (0..steps)
        .map(|k| start * ratio.powf(k as f64 / (steps - 1) as f64))
        .collect()
}

/// The smallest diagonal shift that makes `R` positive semi-definite.
pub fn infer_lambda_min(ld: &SparseLd) -> f64 {
    if ld.n() == 0 || ld.nnz_offdiag() == 0 {
        return 0.0;
    }
    (-smallest_eigenvalue(ld)).max(0.0)
}

/// Estimates the smallest eigenvalue of `R` by power iteration on `c I - R`, where
/// `c` is the Gershgorin bound on the largest eigenvalue.
pub fn smallest_eigenvalue(ld: &SparseLd) -> f64 {
    let n = ld.n();
    if n == 0 {
        return 1.0;
    }
    let bound = (0..n)
        .map(|i| 1.0 + ld.row(i).iter().map(|(_, r)| r.abs()).sum::<f64>())
        .fold(0.0_f64, f64::max);

    let mut v = Array1::from_iter((0..n).map(|i| 1.0 / (1.0 + i as f64)));
    let norm = v.dot(&v).sqrt();
    v /= norm;

    let mut estimate = 0.0;
    for _ in 0..POWER_ITERATIONS {
        let w = &v * bound - ld.matvec(v.view(), 0.0);
        let rayleigh = v.dot(&w);
        let w_norm = w.dot(&w).sqrt();
        if w_norm == 0.0 {
            estimate = rayleigh;
            break;
        }
        v = w / w_norm;
        let converged = (rayleigh - estimate).abs() < POWER_TOLERANCE * rayleigh.abs().max(1.0);
        estimate = rayleigh;
        if converged {
            break;
        }
    }
    bound - estimate
}
