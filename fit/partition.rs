//! Splits a loaded dataset into independent work units.

use crate::data::{DataError, DatasetGuard, GenomicDataset};
use crate::types::{GENOME_WIDE_KEY, PartitionMode};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error(
        "Training partition '{0}' has no matching validation partition, so model selection has no criterion to optimize."
    )]
    MissingValidationPartition(String),
    #[error("Model selection requires a validation dataset, but none was supplied.")]
    ValidationDatasetRequired,
    #[error("The training dataset contains no partitions.")]
    NoPartitions,
    #[error("Failed to split the dataset: {0}")]
    Data(#[from] DataError),
}

/// One independent slice of the run. Its handles are released when the unit, or the
/// guards taken out of it, are dropped.
#[derive(Debug)]
pub struct WorkUnit<D: GenomicDataset> {
    pub id: String,
    pub train: DatasetGuard<D>,
    pub valid: Option<DatasetGuard<D>>,
}

/// Builds the ordered list of work units for a run.
///
/// `valid` is attached to every unit when `requires_validation` is set and ignored
/// (and released) otherwise. Every handle passed in is released on the error paths.
pub fn build<D: GenomicDataset>(
    mut train: D,
    valid: Option<D>,
    mode: PartitionMode,
    requires_validation: bool,
) -> Result<Vec<WorkUnit<D>>, PartitionError> {
    let valid = match (valid, requires_validation) {
        (None, true) => {
            train.cleanup();
            return Err(PartitionError::ValidationDatasetRequired);
        }
        (Some(mut dataset), false) => {
            log::debug!("Validation data is not needed by this tuning mode; releasing it");
            dataset.cleanup();
            None
        }
        (valid, _) => valid,
    };

    if train.chromosomes().is_empty() {
        train.cleanup();
        if let Some(mut dataset) = valid {
            dataset.cleanup();
        }
        return Err(PartitionError::NoPartitions);
    }

    match mode {
        PartitionMode::GenomeWide => Ok(vec![WorkUnit {
            id: GENOME_WIDE_KEY.to_string(),
            train: DatasetGuard::new(train),
            valid: valid.map(DatasetGuard::new),
        }]),
        PartitionMode::PerChromosome => split_per_chromosome(train, valid),
    }
}

fn split_per_chromosome<D: GenomicDataset>(
    train: D,
    valid: Option<D>,
) -> Result<Vec<WorkUnit<D>>, PartitionError> {
    let train_parts = match train.split_by_chromosome() {
        Ok(parts) => guard_parts(parts).collect::<Vec<_>>(),
        Err(e) => {
            if let Some(mut dataset) = valid {
                dataset.cleanup();
            }
            return Err(e.into());
        }
    };

    // A failure here drops `train_parts`, which releases every training piece.
    let mut valid_parts: Option<HashMap<String, DatasetGuard<D>>> = match valid {
        Some(dataset) => Some(guard_parts(dataset.split_by_chromosome()?).collect()),
        None => None,
    };

    let mut units = Vec::with_capacity(train_parts.len());
    for (id, train) in train_parts {
        let valid = match valid_parts.as_mut() {
            Some(parts) => match parts.remove(&id) {
                Some(part) => Some(part),
                None => return Err(PartitionError::MissingValidationPartition(id)),
            },
            None => None,
        };
        units.push(WorkUnit { id, train, valid });
    }

    if let Some(leftover) = valid_parts.filter(|parts| !parts.is_empty()) {
        let mut keys: Vec<&String> = leftover.keys().collect();
        keys.sort();
        log::debug!("Ignoring validation partitions without training data: {keys:?}");
    }
    Ok(units)
}

fn guard_parts<D: GenomicDataset>(
    parts: Vec<(String, D)>,
) -> impl Iterator<Item = (String, DatasetGuard<D>)> {
    parts
        .into_iter()
        .map(|(key, part)| (key, DatasetGuard::new(part)))
}


#[cfg(test)]
mod tests {
    use super::test_support::KeyedDataset;
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ids<D: GenomicDataset>(units: &[WorkUnit<D>]) -> Vec<&str> {
        units.iter().map(|u| u.id.as_str()).collect()
    }

    #[test]
    fn per_chromosome_produces_one_unit_per_key() {
        let releases = Arc::new(AtomicUsize::new(0));
        let train = KeyedDataset::new(&["1", "2", "X"], &releases);
        let units = build(train, None, PartitionMode::PerChromosome, false).unwrap();
        assert_eq!(ids(&units), vec!["1", "2", "X"]);
        assert!(units.iter().all(|u| u.valid.is_none()));
        for unit in &units {
            assert_eq!(unit.train.chromosomes(), vec![unit.id.clone()]);
        }
        drop(units);
        assert_eq!(releases.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn genome_wide_produces_a_single_unit() {
        for keys in [&["1"][..], &["1", "2", "3", "4"][..]] {
            let releases = Arc::new(AtomicUsize::new(0));
            let train = KeyedDataset::new(keys, &releases);
            let units = build(train, None, PartitionMode::GenomeWide, false).unwrap();
            assert_eq!(ids(&units), vec![GENOME_WIDE_KEY]);
            assert_eq!(units[0].train.chromosomes().len(), keys.len());
        }
    }

    #[test]
    fn validation_partitions_are_matched_by_key() {
        let releases = Arc::new(AtomicUsize::new(0));
        let train = KeyedDataset::new(&["1", "2"], &releases);
        let valid = KeyedDataset::new(&["2", "1", "3"], &releases);
        let units = build(train, Some(valid), PartitionMode::PerChromosome, true).unwrap();
        for unit in &units {
            let valid = unit.valid.as_ref().expect("validation attached");
            assert_eq!(valid.chromosomes(), vec![unit.id.clone()]);
        }
        // The unmatched validation partition "3" is released right away.
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_validation_partition_is_fatal_and_releases_everything() {
        let releases = Arc::new(AtomicUsize::new(0));
        let train = KeyedDataset::new(&["1", "2"], &releases);
        let valid = KeyedDataset::new(&["1"], &releases);
        let err = build(train, Some(valid), PartitionMode::PerChromosome, true).unwrap_err();
        assert!(matches!(err, PartitionError::MissingValidationPartition(ref id) if id == "2"));
        assert_eq!(releases.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn validation_is_dropped_when_not_required() {
        let releases = Arc::new(AtomicUsize::new(0));
        let train = KeyedDataset::new(&["1"], &releases);
        let valid = KeyedDataset::new(&["1"], &releases);
        let units = build(train, Some(valid), PartitionMode::PerChromosome, false).unwrap();
        assert!(units[0].valid.is_none());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn required_validation_without_dataset_is_rejected() {
        let releases = Arc::new(AtomicUsize::new(0));
        let train = KeyedDataset::new(&["1"], &releases);
        let err = build(train, None, PartitionMode::GenomeWide, true).unwrap_err();
        assert!(matches!(err, PartitionError::ValidationDatasetRequired));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
