//! Run-wide vocabulary shared by the partitioner, the retry loop, the selector and the
//! orchestrator: the knobs that select behaviour once per run, and the records that
//! flow back from the workers.

use clap::ValueEnum;
use polars::prelude::DataFrame;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// The key of the single partition produced in genome-wide mode.
pub const GENOME_WIDE_KEY: &str = "All";

/// How the training data is split into independent work units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PartitionMode {
    /// A single unit named "All" wrapping the whole dataset.
    GenomeWide,
    /// One unit per chromosome present in the dataset.
    #[default]
    PerChromosome,
}

/// The fitting routine invoked on every attempt. Chosen once per run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FitStrategy {
    /// Every regularization step is solved from the zero vector.
    ColdStart,
    /// A data-derived ladder of steps, each warm-started from the previous solution.
    #[default]
    WarmStartLadder,
    /// An explicit, user-supplied penalty path, warm-started along the way.
    Pathwise,
}

impl FitStrategy {
    pub fn describe(self) -> &'static str {
        match self {
            Self::ColdStart => "cold start",
            Self::WarmStartLadder => "warm-start ladder",
            Self::Pathwise => "pathwise",
        }
    }
}

impl fmt::Display for FitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// How the final model configuration of a partition is chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TuningMode {
    /// Trust the fitting trajectory: the last fitted configuration wins.
    #[default]
    WarmStart,
    /// Score every fitted configuration against held-out data and keep the best.
    GridSearch,
}

impl TuningMode {
    pub fn requires_validation(self) -> bool {
        matches!(self, Self::GridSearch)
    }
}

/// Model-selection criterion evaluated against a validation unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    /// Pseudo-validation correlation; larger is better.
    #[default]
    PseudoValidation,
    /// Quadratic loss of the validation statistics; smaller is better.
    ValidationLoss,
}

impl Criterion {
    pub fn column_name(self) -> &'static str {
        match self {
            Self::PseudoValidation => "Pseudo_validation",
            Self::ValidationLoss => "Validation_loss",
        }
    }

    /// Returns true when `candidate` beats `incumbent` under this criterion.
    pub fn prefers(self, candidate: f64, incumbent: f64) -> bool {
        if !candidate.is_finite() {
            return false;
        }
        if !incumbent.is_finite() {
            return true;
        }
        match self {
            Self::PseudoValidation => candidate > incumbent,
            Self::ValidationLoss => candidate < incumbent,
        }
    }
}

/// Unit in which the peak memory reading is reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MemoryUnit {
    Bytes,
    #[default]
    Mib,
    Gib,
}

impl MemoryUnit {
    pub fn divisor(self) -> f64 {
        match self {
            Self::Bytes => 1.0,
            Self::Mib => 1024.0 * 1024.0,
            Self::Gib => 1024.0 * 1024.0 * 1024.0,
        }
    }

    pub fn convert(self, bytes: u64) -> f64 {
        bytes as f64 / self.divisor()
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Self::Bytes => "B",
            Self::Mib => "MB",
            Self::Gib => "GB",
        }
    }
}

/// The regularization floor added to the LD diagonal. `Infer` asks the model to
/// derive it from its own data when it is constructed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LambdaMin {
    Infer,
    Value(f64),
}

impl LambdaMin {
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Infer => None,
            Self::Value(v) => Some(v),
        }
    }
}

impl Default for LambdaMin {
    fn default() -> Self {
        Self::Value(0.0)
    }
}

impl fmt::Display for LambdaMin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infer => f.write_str("infer"),
            Self::Value(v) => write!(f, "{v}"),
        }
    }
}

impl std::str::FromStr for LambdaMin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("infer") {
            return Ok(Self::Infer);
        }
        trimmed
            .parse::<f64>()
            .map(Self::Value)
            .map_err(|_| format!("expected a number or 'infer', found '{trimmed}'"))
    }
}

// Serialized as either a bare number or the string "infer", which keeps TOML
// run configurations readable.
impl Serialize for LambdaMin {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Infer => serializer.serialize_str("infer"),
            Self::Value(v) => serializer.serialize_f64(*v),
        }
    }
}

impl<'de> Deserialize<'de> for LambdaMin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(v) => Ok(Self::Value(v)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Wall-clock durations recorded while one partition is processed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProfilerMetrics {
    pub load_time: Duration,
    pub fit_time: Duration,
    pub validation_time: Option<Duration>,
}

/// Everything a worker hands back for one partition. Immutable once produced.
#[derive(Debug)]
pub struct FitRecord {
    pub partition_id: String,
    pub profiler_metrics: ProfilerMetrics,
    pub model_parameter_table: DataFrame,
    pub hyperparameter_table: DataFrame,
    pub validation_table: Option<DataFrame>,
    /// Number of fitting attempts consumed, including the successful one.
    pub attempts: usize,
    /// True when every attempt diverged and the record reflects the last, failed one.
    pub exhausted: bool,
}
