//! The model collaborator: what the retry loop and the selector may ask of a
//! penalized regression model, and the settings it is built from.

use crate::data::{DataError, GenomicDataset};
use crate::types::{Criterion, LambdaMin};
use polars::prelude::{DataFrame, PolarsError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a model. `OptimizationDivergence` is the only recoverable one.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error(
        "Optimization diverged at penalty {penalty:.6e} after {sweeps} sweep(s): {detail}"
    )]
    OptimizationDivergence {
        penalty: f64,
        sweeps: usize,
        detail: String,
    },
    #[error("The penalty path is empty; nothing to fit.")]
    EmptyPath,
    #[error("Penalty path entry {value} is not a positive finite number.")]
    InvalidPenalty { value: f64 },
    #[error("No fitted configurations are available for model selection.")]
    NoCandidates,
    #[error("Model data is unavailable: {0}")]
    Data(#[from] DataError),
    #[error("Failed to assemble a result table: {0}")]
    Table(#[from] PolarsError),
}

impl ModelError {
    pub fn is_divergence(&self) -> bool {
        matches!(self, Self::OptimizationDivergence { .. })
    }
}

/// The shape of the penalty applied to every coefficient.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PenaltyKind {
    #[default]
    Lasso,
    /// Spike-and-slab lasso: a two-component Laplace mixture with slab rate `slab`
    /// and prior slab proportion `theta`; the spike rate is the tuned quantity.
    SpikeSlab { slab: f64, theta: f64 },
}

impl PenaltyKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lasso => "Lasso",
            Self::SpikeSlab { .. } => "SSL",
        }
    }
}

/// Construction-time settings for a model instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default)]
    pub penalty: PenaltyKind,
    #[serde(default)]
    pub lambda_min: LambdaMin,
}

/// Starting point and regularization bounds handed to every fitting routine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    /// Number of steps in the ladder used by cold-start and warm-start fits.
    pub ladder_steps: usize,
    /// Ratio between the weakest and strongest Lasso penalty in the ladder.
    pub min_ratio: f64,
    /// Explicit penalty values walked, in order, by pathwise fits.
    pub penalty_path: Vec<f64>,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            ladder_steps: 20,
            min_ratio: 1e-2,
            penalty_path: Vec::new(),
            max_iterations: 500,
            tolerance: 1e-6,
        }
    }
}

/// A penalized regression model bound to the training data of one partition.
///
/// Each fitting routine starts from scratch: previously fitted configurations are
/// discarded before the first step runs.
pub trait PenalizedModel {
    type Dataset: GenomicDataset;

    /// Current regularization floor added to the LD diagonal.
    fn lambda_min(&self) -> f64;
    fn set_lambda_min(&mut self, value: f64);

    fn fit(&mut self, params: &StrategyParams) -> Result<(), ModelError>;
    fn warm_start_fit(&mut self, params: &StrategyParams) -> Result<(), ModelError>;
    fn pathwise_fit(&mut self, params: &StrategyParams) -> Result<(), ModelError>;

    /// Makes the configuration that optimizes `criterion` on `validation` current and
    /// returns the per-configuration validation table.
    fn select_best_model(
        &mut self,
        validation: &Self::Dataset,
        criterion: Criterion,
    ) -> Result<DataFrame, ModelError>;

    fn to_table(&self) -> Result<DataFrame, ModelError>;
    fn to_hyperparameter_table(&self) -> Result<DataFrame, ModelError>;
}
