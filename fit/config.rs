//! # Run Configuration
//!
//! A [`RunConfig`] describes one complete run. The CLI builds it either from flags or
//! from a TOML file, and [`RunConfig::validate`] rejects every invalid setting before
//! any data is read.

use crate::model::{ModelSettings, PenaltyKind, StrategyParams};
use crate::types::{Criterion, FitStrategy, LambdaMin, MemoryUnit, PartitionMode, TuningMode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("The {role} file '{path}' does not exist or is not a regular file.")]
    MissingInput { role: &'static str, path: String },
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Incompatible options: {0}")]
    Incompatible(String),
    #[error("IO error while handling the configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse the configuration TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize the configuration TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Settings for the background peak-memory sampler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub interval_ms: u64,
    pub unit: MemoryUnit,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            unit: MemoryUnit::default(),
        }
    }
}

impl MemorySettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Training summary statistics.
    pub sumstats: PathBuf,
    /// Pairwise LD shared by training and validation statistics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ld: Option<PathBuf>,
    /// Held-out summary statistics used by grid search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<PathBuf>,
    /// Output tables are written to `<prefix>.tsv`, `<prefix>.hyp`, and so on.
    pub output_prefix: PathBuf,
    #[serde(default)]
    pub partition_mode: PartitionMode,
    #[serde(default = "default_n_jobs")]
    pub n_jobs: usize,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub strategy: FitStrategy,
    #[serde(default)]
    pub strategy_params: StrategyParams,
    #[serde(default)]
    pub tuning: TuningMode,
    #[serde(default)]
    pub criterion: Criterion,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub write_profile: bool,
}

fn default_n_jobs() -> usize {
    1
}

impl RunConfig {
    /// A configuration with every optional setting at its default.
    pub fn new(sumstats: impl Into<PathBuf>, output_prefix: impl Into<PathBuf>) -> Self {
        Self {
            sumstats: sumstats.into(),
            ld: None,
            validation: None,
            output_prefix: output_prefix.into(),
            partition_mode: PartitionMode::default(),
            n_jobs: default_n_jobs(),
            model: ModelSettings::default(),
            strategy: FitStrategy::default(),
            strategy_params: StrategyParams::default(),
            tuning: TuningMode::default(),
            criterion: Criterion::default(),
            memory: MemorySettings::default(),
            write_profile: false,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn requires_validation(&self) -> bool {
        self.tuning.requires_validation()
    }

    /// The validation file, if the tuning mode will use it.
    pub fn effective_validation(&self) -> Option<&Path> {
        if self.requires_validation() {
            self.validation.as_deref()
        } else {
            None
        }
    }

    /// Checks every setting. Nothing is read from the inputs beyond their existence.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_file("summary statistics", &self.sumstats)?;
        if let Some(ld) = &self.ld {
            require_file("LD", ld)?;
        }

        match (&self.validation, self.requires_validation()) {
            (Some(path), true) => require_file("validation summary statistics", path)?,
            (None, true) => {
                return Err(ConfigError::Incompatible(format!(
                    "tuning mode 'grid_search' scores candidates by '{}' and needs --validation data",
                    self.criterion.column_name()
                )));
            }
            (Some(path), false) => log::warn!(
                "Ignoring validation file '{}': tuning mode 'warm_start' does not use it",
                path.display()
            ),
            (None, false) => {}
        }

        if self.output_prefix.file_name().is_none() {
            return Err(invalid(
                "output_prefix",
                format!("'{}' does not name a file", self.output_prefix.display()),
            ));
        }

        if self.n_jobs == 0 {
            return Err(invalid("n_jobs", "at least one worker is required".to_string()));
        }
        let cpus = num_cpus::get();
        if self.n_jobs > cpus {
            log::warn!(
                "n_jobs = {} exceeds the {cpus} logical CPUs available; workers will share cores",
                self.n_jobs
            );
        }

        self.validate_model()?;
        self.validate_strategy()?;

        if self.memory.interval_ms == 0 {
            return Err(invalid(
                "memory.interval_ms",
                "the sampling interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_model(&self) -> Result<(), ConfigError> {
        if let LambdaMin::Value(v) = self.model.lambda_min {
            if !(v.is_finite() && v >= 0.0) {
                return Err(invalid(
                    "lambda_min",
                    format!("expected a non-negative number or 'infer', found {v}"),
                ));
            }
        }
        if let PenaltyKind::SpikeSlab { slab, theta } = self.model.penalty {
            if !(slab.is_finite() && slab > 0.0) {
                return Err(invalid("slab", format!("must be positive, found {slab}")));
            }
            if !(theta > 0.0 && theta < 1.0) {
                return Err(invalid("theta", format!("must lie in (0, 1), found {theta}")));
            }
        }
        Ok(())
    }

    fn validate_strategy(&self) -> Result<(), ConfigError> {
        let params = &self.strategy_params;
        if params.ladder_steps == 0 {
            return Err(invalid("ladder_steps", "at least one step is required".to_string()));
        }
        if !(params.min_ratio > 0.0 && params.min_ratio < 1.0) {
            return Err(invalid(
                "min_ratio",
                format!("must lie in (0, 1), found {}", params.min_ratio),
            ));
        }
        if params.max_iterations == 0 {
            return Err(invalid("max_iterations", "must be at least 1".to_string()));
        }
        if !(params.tolerance.is_finite() && params.tolerance > 0.0) {
            return Err(invalid(
                "tolerance",
                format!("must be positive, found {}", params.tolerance),
            ));
        }

        if self.strategy == FitStrategy::Pathwise && params.penalty_path.is_empty() {
            return Err(ConfigError::Incompatible(
                "the pathwise strategy needs an explicit --penalty-path".to_string(),
            ));
        }
        if let Some(value) = params
            .penalty_path
            .iter()
            .find(|v| !(v.is_finite() && **v > 0.0))
        {
            return Err(invalid(
                "penalty_path",
                format!("every entry must be positive, found {value}"),
            ));
        }
        if self.strategy != FitStrategy::Pathwise && !params.penalty_path.is_empty() {
            log::warn!("Ignoring penalty_path: the {} strategy builds its own ladder", self.strategy);
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::InvalidValue { field, reason }
}

fn require_file(role: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConfigError::MissingInput {
            role,
            path: path.display().to_string(),
        })
    }
}
