//! Grid-search model selection against a partition's held-out statistics.

use crate::attempt::FittedPartition;
use crate::data::DatasetGuard;
use crate::model::{ModelError, PenalizedModel};
use crate::types::Criterion;
use std::time::Instant;

#[derive(Clone, Copy, Debug)]
pub struct ValidationSelector {
    criterion: Criterion,
}

impl ValidationSelector {
    pub fn new(criterion: Criterion) -> Self {
        Self { criterion }
    }

    pub fn criterion(&self) -> Criterion {
        self.criterion
    }

    /// Makes the configuration that optimizes the criterion on `valid` current, and
    /// stores the validation table and `Validation_time` on `fitted`. The validation
    /// handle is released on return, whatever the outcome.
    pub fn select<M: PenalizedModel>(
        &self,
        fitted: &mut FittedPartition<M>,
        valid: DatasetGuard<M::Dataset>,
    ) -> Result<(), ModelError> {
        let start = Instant::now();
        let table = fitted.model.select_best_model(&*valid, self.criterion)?;
        fitted.metrics.validation_time = Some(start.elapsed());
        log::debug!(
            "Partition {}: scored {} configuration(s) by {}",
            fitted.partition_id,
            table.height(),
            self.criterion.column_name()
        );
        fitted.validation_table = Some(table);
        Ok(())
    }
}
