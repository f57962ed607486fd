//! # Per-Partition Fitting With Divergence Recovery
//!
//! A [`FitAttempt`] builds one model from a partition's training data and runs the
//! run's fitting strategy on it. When the model reports
//! [`ModelError::OptimizationDivergence`], the regularization floor is strengthened
//! and the same strategy is retried from scratch, at most [`ATTEMPT_BUDGET`] times in
//! total. Every other model error ends the partition.
//!
//! The retry counter and the current floor live in a [`RetryState`] owned by a single
//! call to [`FitAttempt::run`]; nothing about retries outlives that call.
//!
//! Running out of attempts is not an error. The partition carries on with whatever
//! the last attempt left behind and is flagged as exhausted.

use crate::data::DatasetGuard;
use crate::model::{ModelError, PenalizedModel, StrategyParams};
use crate::types::{FitRecord, FitStrategy, ProfilerMetrics};
use polars::prelude::DataFrame;
use std::time::Instant;

/// Maximum number of fitting attempts per partition, the first one included.
pub const ATTEMPT_BUDGET: usize = 3;

/// Floor used after a divergence when the previous floor was exactly zero.
pub const INITIAL_FLOOR: f64 = 1e-3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptState {
    Idle,
    Fitting,
    Succeeded,
    Diverged,
    /// Terminal: the budget ran out while the model was still diverging.
    Exhausted,
}

impl AttemptState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Exhausted)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryState {
    pub attempts_used: usize,
    pub current_lambda_min: f64,
}

impl RetryState {
    fn new(initial_lambda_min: f64) -> Self {
        Self {
            attempts_used: 0,
            current_lambda_min: initial_lambda_min,
        }
    }

    fn can_retry(&self) -> bool {
        self.attempts_used < ATTEMPT_BUDGET
    }

    /// Applies one strengthening step and returns the new floor.
    fn strengthen(&mut self) -> f64 {
        self.current_lambda_min = strengthen_floor(self.current_lambda_min);
        self.current_lambda_min
    }
}

/// Doubles the floor, or starts it at [`INITIAL_FLOOR`] when it is zero.
pub fn strengthen_floor(current: f64) -> f64 {
    if current <= 0.0 {
        INITIAL_FLOOR
    } else {
        current * 2.0
    }
}

impl FitStrategy {
    /// Runs the fitting routine this strategy names.
    pub fn apply<M: PenalizedModel>(
        self,
        model: &mut M,
        params: &StrategyParams,
    ) -> Result<(), ModelError> {
        match self {
            Self::ColdStart => model.fit(params),
            Self::WarmStartLadder => model.warm_start_fit(params),
            Self::Pathwise => model.pathwise_fit(params),
        }
    }
}

/// A fitted model together with the bookkeeping of how it was obtained.
#[derive(Debug)]
pub struct FittedPartition<M> {
    pub partition_id: String,
    pub model: M,
    pub state: AttemptState,
    pub retry: RetryState,
    pub metrics: ProfilerMetrics,
    pub validation_table: Option<DataFrame>,
}

impl<M: PenalizedModel> FittedPartition<M> {
    pub fn exhausted(&self) -> bool {
        self.state == AttemptState::Exhausted
    }

    /// Reads the result tables from the model, whichever configuration is current.
    pub fn into_record(self) -> Result<FitRecord, ModelError> {
        let model_parameter_table = self.model.to_table()?;
        let hyperparameter_table = self.model.to_hyperparameter_table()?;
        Ok(FitRecord {
            exhausted: self.exhausted(),
            partition_id: self.partition_id,
            profiler_metrics: self.metrics,
            model_parameter_table,
            hyperparameter_table,
            validation_table: self.validation_table,
            attempts: self.retry.attempts_used,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FitAttempt<'a> {
    strategy: FitStrategy,
    params: &'a StrategyParams,
}

impl<'a> FitAttempt<'a> {
    pub fn new(strategy: FitStrategy, params: &'a StrategyParams) -> Self {
        Self { strategy, params }
    }

    /// Builds a model from `train` with `factory` and fits it, retrying on divergence.
    /// The training handle is released before this returns, on every path.
    pub fn run<M, F>(
        &self,
        partition_id: &str,
        train: DatasetGuard<M::Dataset>,
        factory: F,
    ) -> Result<FittedPartition<M>, ModelError>
    where
        M: PenalizedModel,
        F: FnOnce(&M::Dataset) -> Result<M, ModelError>,
    {
        let load_start = Instant::now();
        let mut model = factory(&*train)?;
        let load_time = load_start.elapsed();

        let fit_start = Instant::now();
        let mut retry = RetryState::new(model.lambda_min());
        let mut state = AttemptState::Idle;
        while !state.is_terminal() {
            state = AttemptState::Fitting;
            retry.attempts_used += 1;
            log::trace!("Partition {partition_id}: {state:?}, attempt {}", retry.attempts_used);
            match self.strategy.apply(&mut model, self.params) {
                Ok(()) => state = AttemptState::Succeeded,
                Err(e) if e.is_divergence() => {
                    let previous = retry.current_lambda_min;
                    let next = retry.strengthen();
                    model.set_lambda_min(next);
                    log::warn!(
                        "Partition {partition_id}: attempt {}/{ATTEMPT_BUDGET} diverged ({e}); lambda_min {previous:.3e} -> {next:.3e}",
                        retry.attempts_used
                    );
                    state = if retry.can_retry() {
                        AttemptState::Diverged
                    } else {
                        log::warn!(
                            "Partition {partition_id}: all {ATTEMPT_BUDGET} attempts diverged; keeping the last attempt's state"
                        );
                        AttemptState::Exhausted
                    };
                }
                Err(e) => return Err(e),
            }
        }
        let fit_time = fit_start.elapsed();
        drop(train);

        log::debug!(
            "Partition {partition_id}: {} with {} attempt(s), lambda_min {:.3e}",
            self.strategy,
            retry.attempts_used,
            retry.current_lambda_min
        );

        Ok(FittedPartition {
            partition_id: partition_id.to_string(),
            model,
            state,
            retry,
            metrics: ProfilerMetrics {
                load_time,
                fit_time,
                validation_time: None,
            },
            validation_table: None,
        })
    }
}
