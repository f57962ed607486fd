//! Merging per-partition records into run-level tables.
//!
//! Records are sorted by partition key in natural order before their tables are
//! stacked, so the aggregate never depends on the order in which workers finished.

use crate::types::{FitRecord, MemoryUnit};
use natord::compare;
use polars::prelude::*;
use std::time::Duration;

/// Column holding the partition key in the hyperparameter, validation and profile
/// tables.
pub const PARTITION_COLUMN: &str = "Partition";

/// Run-level measurements attached to the profile table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunTimings {
    pub total_time: Duration,
    pub data_prep_time: Duration,
    pub peak_memory: f64,
    pub memory_unit: MemoryUnit,
}

#[derive(Debug)]
pub struct RunAggregate {
    pub parameters: DataFrame,
    pub hyperparameters: DataFrame,
    pub validation: Option<DataFrame>,
    pub profile: DataFrame,
    pub timings: RunTimings,
    /// Partitions whose every fitting attempt diverged.
    pub exhausted_partitions: Vec<String>,
}

impl RunAggregate {
    pub fn from_records(
        mut records: Vec<FitRecord>,
        timings: RunTimings,
    ) -> Result<Self, PolarsError> {
        records.sort_by(|a, b| compare(&a.partition_id, &b.partition_id));

        let exhausted_partitions: Vec<String> = records
            .iter()
            .filter(|r| r.exhausted)
            .map(|r| r.partition_id.clone())
            .collect();
        let profile = profile_table(&records, &timings)?;

        let mut parameters = Vec::with_capacity(records.len());
        let mut hyperparameters = Vec::with_capacity(records.len());
        let mut validation = Vec::new();
        for record in records {
            parameters.push(record.model_parameter_table);
            hyperparameters.push(tag(record.hyperparameter_table, &record.partition_id)?);
            if let Some(table) = record.validation_table {
                validation.push(tag(table, &record.partition_id)?);
            }
        }

        Ok(Self {
            parameters: stack(parameters)?,
            hyperparameters: stack(hyperparameters)?,
            validation: if validation.is_empty() {
                None
            } else {
                Some(stack(validation)?)
            },
            profile,
            timings,
            exhausted_partitions,
        })
    }
}

fn tag(mut df: DataFrame, partition_id: &str) -> Result<DataFrame, PolarsError> {
    let keys = vec![partition_id; df.height()];
    df.insert_column(0, Series::new(PARTITION_COLUMN.into(), keys))?;
    Ok(df)
}

fn stack(frames: Vec<DataFrame>) -> Result<DataFrame, PolarsError> {
    let mut frames = frames.into_iter();
    let Some(mut stacked) = frames.next() else {
        return Ok(DataFrame::empty());
    };
    for frame in frames {
        stacked.vstack_mut(&frame)?;
    }
    stacked.as_single_chunk_par();
    Ok(stacked)
}

fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

/// One row per partition with its own durations, followed by the run-level totals
/// repeated on every row.
fn profile_table(records: &[FitRecord], timings: &RunTimings) -> Result<DataFrame, PolarsError> {
    let n = records.len();
    let partitions: Vec<&str> = records.iter().map(|r| r.partition_id.as_str()).collect();
    let load: Vec<f64> = records
        .iter()
        .map(|r| seconds(r.profiler_metrics.load_time))
        .collect();
    let fit: Vec<f64> = records
        .iter()
        .map(|r| seconds(r.profiler_metrics.fit_time))
        .collect();
    let validation: Vec<Option<f64>> = records
        .iter()
        .map(|r| r.profiler_metrics.validation_time.map(seconds))
        .collect();
    let attempts: Vec<u32> = records.iter().map(|r| r.attempts as u32).collect();
    let exhausted: Vec<bool> = records.iter().map(|r| r.exhausted).collect();
    let memory_column = format!("Peak_memory_{}", timings.memory_unit.suffix());

    DataFrame::new(vec![
        Series::new(PARTITION_COLUMN.into(), partitions).into(),
        Series::new("Load_time".into(), load).into(),
        Series::new("Fit_time".into(), fit).into(),
        Series::new("Validation_time".into(), validation).into(),
        Series::new("Attempts".into(), attempts).into(),
        Series::new("Exhausted".into(), exhausted).into(),
        Series::new("Total_time".into(), vec![seconds(timings.total_time); n]).into(),
        Series::new("DataPrep_time".into(), vec![seconds(timings.data_prep_time); n]).into(),
        Series::new(memory_column.into(), vec![timings.peak_memory; n]).into(),
    ])
}
