//! # Run Orchestration
//!
//! The top-level driver: load the inputs, split them into work units, fit every unit
//! on a bounded worker pool while the memory sampler watches the process, and merge
//! the per-partition records.
//!
//! [`run_partitions`] holds the control flow and is generic over the dataset and model
//! collaborators. [`run`] wires it to the summary-statistics loader and solver, and
//! [`execute`] adds configuration checks and output writing around it.

use crate::aggregate::{RunAggregate, RunTimings};
use crate::attempt::FitAttempt;
use crate::config::{ConfigError, RunConfig};
use crate::data::{DataError, SumstatsDataset};
use crate::memory::{MemorySampler, SamplerError};
use crate::model::{ModelError, PenalizedModel};
use crate::output::{self, OutputError};
use crate::partition::{self, PartitionError, WorkUnit};
use crate::solver::SummaryStatsModel;
use crate::types::FitRecord;
use crate::validation::ValidationSelector;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use polars::prelude::PolarsError;
use rayon::prelude::*;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to load input data: {0}")]
    Data(#[from] DataError),
    #[error("Failed to partition the input: {0}")]
    Partition(#[from] PartitionError),
    #[error("Partition '{partition}' failed: {source}")]
    PartitionFailed { partition: String, source: ModelError },
    #[error("Failed to start the memory sampler: {0}")]
    Sampler(#[from] SamplerError),
    #[error("Failed to build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to merge partition results: {0}")]
    Aggregate(#[from] PolarsError),
    #[error(transparent)]
    Output(#[from] OutputError),
}

fn create_progress_bar(len: u64) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(10)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    pb.set_style(
        ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} partitions {msg}",
        )
        .expect("Internal Error: Invalid progress bar template string.")
        .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb
}

/// Loads the configured inputs and fits every partition with [`SummaryStatsModel`].
pub fn run(config: &RunConfig) -> Result<RunAggregate, RunError> {
    let started = Instant::now();

    eprintln!("> Loading summary statistics from {}", config.sumstats.display());
    let train = SumstatsDataset::load(&config.sumstats, config.ld.as_deref())?;
    let valid = match config.effective_validation() {
        Some(path) => {
            eprintln!("> Loading validation statistics from {}", path.display());
            Some(SumstatsDataset::load(path, config.ld.as_deref())?)
        }
        None => None,
    };
    let data_prep_time = started.elapsed();

    let settings = config.model.clone();
    run_partitions::<SummaryStatsModel, _>(
        config,
        train,
        valid,
        started,
        data_prep_time,
        |dataset| SummaryStatsModel::from_dataset(dataset, &settings),
    )
}

/// Partitions `train` (and `valid`), fits every work unit on a pool of
/// `config.n_jobs` workers and merges the records.
///
/// `started` marks the beginning of the run for the total wall-clock time; the
/// memory sampler covers everything from partitioning to the last record.
pub fn run_partitions<M, F>(
    config: &RunConfig,
    train: M::Dataset,
    valid: Option<M::Dataset>,
    started: Instant,
    data_prep_time: Duration,
    factory: F,
) -> Result<RunAggregate, RunError>
where
    M: PenalizedModel,
    F: Fn(&M::Dataset) -> Result<M, ModelError> + Sync,
{
    let units = partition::build(
        train,
        valid,
        config.partition_mode,
        config.requires_validation(),
    )?;
    log::info!(
        "Fitting {} partition(s) with {} worker(s) using the {} strategy",
        units.len(),
        config.n_jobs,
        config.strategy
    );

    let mut sampler = MemorySampler::new(config.memory.interval(), config.memory.unit);
    sampler.start_current_process(true)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.n_jobs)
        .thread_name(|idx| format!("penfit-worker-{idx}"))
        .build()?;

    let attempt = FitAttempt::new(config.strategy, &config.strategy_params);
    let selector = config
        .requires_validation()
        .then(|| ValidationSelector::new(config.criterion));

    let pb = create_progress_bar(units.len() as u64);
    let records: Result<Vec<FitRecord>, RunError> = pool.install(|| {
        units
            .into_par_iter()
            .map(|unit| {
                let result = process_unit(unit, &attempt, selector.as_ref(), &factory);
                pb.inc(1);
                result
            })
            .collect()
    });
    pb.finish_and_clear();

    sampler.stop();
    let records = records?;

    let timings = RunTimings {
        total_time: started.elapsed(),
        data_prep_time,
        peak_memory: sampler.peak(),
        memory_unit: sampler.unit(),
    };
    let aggregate = RunAggregate::from_records(records, timings)?;
    if !aggregate.exhausted_partitions.is_empty() {
        log::warn!(
            "Divergence persisted after every attempt in partition(s): {}",
            aggregate.exhausted_partitions.join(", ")
        );
    }
    Ok(aggregate)
}

/// Fits one unit, runs model selection when a selector is configured, and reads the
/// result tables. Any error is fatal for the unit and names it.
fn process_unit<M, F>(
    unit: WorkUnit<M::Dataset>,
    attempt: &FitAttempt<'_>,
    selector: Option<&ValidationSelector>,
    factory: &F,
) -> Result<FitRecord, RunError>
where
    M: PenalizedModel,
    F: Fn(&M::Dataset) -> Result<M, ModelError>,
{
    let WorkUnit { id, train, valid } = unit;
    let fail = |source: ModelError| RunError::PartitionFailed {
        partition: id.clone(),
        source,
    };

    let mut fitted = attempt.run(&id, train, factory).map_err(fail)?;
    if let (Some(selector), Some(valid)) = (selector, valid) {
        selector.select(&mut fitted, valid).map_err(fail)?;
    }
    fitted.into_record().map_err(fail)
}

/// Validates the configuration, checks the output location, runs, and writes every
/// output table. Returns the aggregate and the paths written.
pub fn execute(config: &RunConfig) -> Result<(RunAggregate, Vec<PathBuf>), RunError> {
    config.validate()?;
    output::prepare_output_location(&config.output_prefix)?;

    let mut aggregate = run(config)?;
    let written =
        output::write_aggregate(&config.output_prefix, &mut aggregate, config.write_profile)?;
    for path in &written {
        eprintln!("> Wrote {}", path.display());
    }
    Ok((aggregate, written))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::PARTITION_COLUMN;
    use crate::attempt::test_support::StubModel;
    use crate::partition::test_support::KeyedDataset;
    use crate::types::{MemoryUnit, PartitionMode, TuningMode};
    use polars::prelude::DataFrame;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stub_config(n_jobs: usize, tuning: TuningMode) -> RunConfig {
        let mut config = RunConfig::new("unused.sumstats", "unused/out");
        config.n_jobs = n_jobs;
        config.tuning = tuning;
        config.memory.interval_ms = 5;
        config.memory.unit = MemoryUnit::Bytes;
        config
    }

    fn run_stub(
        config: &RunConfig,
        train_keys: &[&str],
        valid_keys: Option<&[&str]>,
        divergences: usize,
    ) -> (Result<RunAggregate, RunError>, Arc<AtomicUsize>) {
        let releases = Arc::new(AtomicUsize::new(0));
        let train = KeyedDataset::new(train_keys, &releases);
        let valid = valid_keys.map(|keys| KeyedDataset::new(keys, &releases));
        let result = run_partitions::<StubModel, _>(
            config,
            train,
            valid,
            Instant::now(),
            Duration::ZERO,
            |d: &KeyedDataset| {
                let mut model = StubModel::new(d, 0.0, divergences);
                model.fail_fatally = d.keys.iter().any(|k| k == "bad");
                Ok(model)
            },
        );
        (result, releases)
    }

    fn partition_column(df: &DataFrame) -> Vec<String> {
        df.column(PARTITION_COLUMN)
            .unwrap()
            .str()
            .unwrap()
            .into_no_null_iter()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn two_partitions_in_parallel_without_validation() {
        let config = stub_config(2, TuningMode::WarmStart);
        let (result, releases) = run_stub(&config, &["1", "2"], None, 0);
        let aggregate = result.unwrap();

        assert_eq!(aggregate.hyperparameters.height(), 2);
        assert_eq!(partition_column(&aggregate.hyperparameters), vec!["1", "2"]);
        assert!(aggregate.validation.is_none());
        assert_eq!(aggregate.parameters.height(), 4);
        assert_eq!(partition_column(&aggregate.profile), vec!["1", "2"]);
        assert!(aggregate.timings.peak_memory > 0.0);
        assert_eq!(releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn grid_search_tags_validation_rows_and_releases_everything() {
        let config = stub_config(3, TuningMode::GridSearch);
        let (result, releases) = run_stub(&config, &["1", "2", "3"], Some(&["3", "2", "1"]), 1);
        let aggregate = result.unwrap();

        let validation = aggregate.validation.as_ref().expect("validation table");
        assert_eq!(
            partition_column(validation),
            vec!["1", "1", "2", "2", "3", "3"]
        );
        let attempts: Vec<u32> = aggregate
            .profile
            .column("Attempts")
            .unwrap()
            .u32()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(attempts, vec![2, 2, 2]);
        assert!(aggregate.exhausted_partitions.is_empty());
        assert_eq!(releases.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn missing_validation_partition_fails_the_run() {
        let config = stub_config(2, TuningMode::GridSearch);
        let (result, releases) = run_stub(&config, &["1", "2"], Some(&["1"]), 0);
        assert!(matches!(
            result,
            Err(RunError::Partition(PartitionError::MissingValidationPartition(ref id))) if id == "2"
        ));
        assert_eq!(releases.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn a_fatal_partition_error_fails_the_run_and_names_it() {
        let config = stub_config(2, TuningMode::WarmStart);
        let (result, releases) = run_stub(&config, &["1", "bad", "3"], None, 0);
        match result {
            Err(RunError::PartitionFailed { partition, source }) => {
                assert_eq!(partition, "bad");
                assert!(matches!(source, ModelError::EmptyPath));
            }
            other => panic!("expected a partition failure, got {other:?}"),
        }
        assert_eq!(releases.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhausted_partitions_still_produce_records() {
        let config = stub_config(1, TuningMode::WarmStart);
        let (result, _) = run_stub(&config, &["1", "2"], None, usize::MAX);
        let aggregate = result.unwrap();
        assert_eq!(aggregate.hyperparameters.height(), 2);
        assert_eq!(aggregate.exhausted_partitions, vec!["1", "2"]);
    }

    #[test]
    fn genome_wide_mode_produces_a_single_tagged_row() {
        let mut config = stub_config(2, TuningMode::WarmStart);
        config.partition_mode = PartitionMode::GenomeWide;
        let (result, _) = run_stub(&config, &["1", "2", "3"], None, 0);
        let aggregate = result.unwrap();
        assert_eq!(partition_column(&aggregate.hyperparameters), vec!["All"]);
    }

    #[test]
    fn aggregate_is_independent_of_dispatch_order() {
        let keys: Vec<String> = (1..=12).map(|c| c.to_string()).chain(["X".to_string()]).collect();
        let config = stub_config(4, TuningMode::GridSearch);

        let baseline = {
            let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            let (result, _) = run_stub(&config, &refs, Some(&refs), 0);
            result.unwrap()
        };

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..5 {
            let mut train: Vec<&str> = keys.iter().map(String::as_str).collect();
            let mut valid = train.clone();
            train.shuffle(&mut rng);
            valid.shuffle(&mut rng);
            let (result, _) = run_stub(&config, &train, Some(&valid), 0);
            let aggregate = result.unwrap();

            assert!(aggregate.parameters.equals(&baseline.parameters));
            assert!(aggregate.hyperparameters.equals(&baseline.hyperparameters));
            assert!(
                aggregate
                    .validation
                    .as_ref()
                    .unwrap()
                    .equals(baseline.validation.as_ref().unwrap())
            );
            assert_eq!(
                partition_column(&aggregate.profile),
                partition_column(&baseline.profile)
            );
        }
    }
}
