use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;

use penfit::config::{MemorySettings, RunConfig};
use penfit::model::{ModelSettings, PenaltyKind, StrategyParams};
use penfit::orchestrator::execute;
use penfit::types::{Criterion, FitStrategy, LambdaMin, MemoryUnit, PartitionMode, TuningMode};

#[derive(Clone, Copy, ValueEnum)]
pub enum PenaltyCli {
    Lasso,
    Ssl,
}

#[derive(Args)]
pub struct FitArgs {
    /// Path to tab-separated summary statistics (CHR, SNP, POS, A1, A2, N and Z or BETA/SE)
    #[arg(value_name = "SUMSTATS")]
    pub sumstats: PathBuf,

    /// Pairwise LD file with SNP_A, SNP_B, R columns; variants are independent without it
    #[arg(long, value_name = "PATH")]
    pub ld: Option<PathBuf>,

    /// Held-out summary statistics used by grid search
    #[arg(long, value_name = "PATH")]
    pub validation: Option<PathBuf>,

    /// Output prefix; tables are written to <PREFIX>.tsv, .hyp, .validation and .prof
    #[arg(long, short = 'o', value_name = "PREFIX", default_value = "penfit")]
    pub output: PathBuf,

    /// Fit all chromosomes as a single partition instead of one per chromosome
    #[arg(long)]
    pub genome_wide: bool,

    /// Number of partitions fitted in parallel
    #[arg(long, default_value = "1")]
    pub n_jobs: usize,

    #[arg(long, value_enum, default_value_t = PenaltyCli::Lasso)]
    pub penalty: PenaltyCli,

    /// Slab rate of the spike-and-slab lasso
    #[arg(long, default_value = "1.0")]
    pub slab: f64,

    /// Prior slab proportion of the spike-and-slab lasso
    #[arg(long, default_value = "0.01")]
    pub theta: f64,

    /// Initial regularization floor added to the LD diagonal, or "infer"
    #[arg(long, default_value = "0")]
    pub lambda_min: LambdaMin,

    #[arg(long, value_enum, default_value_t = FitStrategy::WarmStartLadder)]
    pub strategy: FitStrategy,

    /// Number of steps in the regularization ladder
    #[arg(long, default_value = "20")]
    pub ladder_steps: usize,

    /// Ratio between the weakest and strongest Lasso penalty of the ladder
    #[arg(long, default_value = "0.01")]
    pub min_ratio: f64,

    /// Comma-separated penalty values walked by the pathwise strategy
    #[arg(long, value_delimiter = ',', value_name = "VALUES")]
    pub penalty_path: Vec<f64>,

    /// Maximum coordinate sweeps per regularization step
    #[arg(long, default_value = "500")]
    pub max_iterations: usize,

    /// Convergence tolerance on the largest coefficient change
    #[arg(long, default_value = "1e-6")]
    pub tolerance: f64,

    #[arg(long, value_enum, default_value_t = TuningMode::WarmStart)]
    pub tuning: TuningMode,

    #[arg(long, value_enum, default_value_t = Criterion::PseudoValidation)]
    pub criterion: Criterion,

    /// Milliseconds between memory samples
    #[arg(long, default_value = "100")]
    pub memory_interval_ms: u64,

    #[arg(long, value_enum, default_value_t = MemoryUnit::Mib)]
    pub memory_unit: MemoryUnit,

    /// Also write the profiling table (<PREFIX>.prof)
    #[arg(long)]
    pub profile: bool,

    /// Save the configuration as TOML, once it passes validation, for later use with `penfit run`
    #[arg(long, value_name = "PATH")]
    pub write_config: Option<PathBuf>,
}

impl FitArgs {
    fn into_config(self) -> (RunConfig, Option<PathBuf>) {
        let penalty = match self.penalty {
            PenaltyCli::Lasso => PenaltyKind::Lasso,
            PenaltyCli::Ssl => PenaltyKind::SpikeSlab {
                slab: self.slab,
                theta: self.theta,
            },
        };
        let config = RunConfig {
            sumstats: self.sumstats,
            ld: self.ld,
            validation: self.validation,
            output_prefix: self.output,
            partition_mode: if self.genome_wide {
                PartitionMode::GenomeWide
            } else {
                PartitionMode::PerChromosome
            },
            n_jobs: self.n_jobs,
            model: ModelSettings {
                penalty,
                lambda_min: self.lambda_min,
            },
            strategy: self.strategy,
            strategy_params: StrategyParams {
                ladder_steps: self.ladder_steps,
                min_ratio: self.min_ratio,
                penalty_path: self.penalty_path,
                max_iterations: self.max_iterations,
                tolerance: self.tolerance,
            },
            tuning: self.tuning,
            criterion: self.criterion,
            memory: MemorySettings {
                interval_ms: self.memory_interval_ms,
                unit: self.memory_unit,
            },
            write_profile: self.profile,
        };
        (config, self.write_config)
    }
}

#[derive(Parser)]
#[command(
    name = "penfit",
    version,
    about = "Fit penalized regression models to GWAS summary statistics, one partition at a time."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit models with settings given as flags
    #[command(about = "Fit models from summary statistics (outputs: <PREFIX>.tsv, <PREFIX>.hyp)")]
    Fit(FitArgs),

    /// Fit models with settings read from a TOML run configuration
    #[command(about = "Fit models from a TOML run configuration")]
    Run {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}

fn run_fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (config, write_config) = args.into_config();
    if let Some(path) = write_config {
        config.validate()?;
        config.save(&path)?;
        eprintln!("> Configuration saved to {}", path.display());
    }
    run_config(&config)
}

fn run_from_file(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("> Reading run configuration from {}", path.display());
    let config = RunConfig::load(&path)?;
    run_config(&config)
}

fn run_config(config: &RunConfig) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!(
        "> Strategy: {}, tuning: {:?}, partitions: {:?}, workers: {}",
        config.strategy, config.tuning, config.partition_mode, config.n_jobs
    );
    let (aggregate, _written) = execute(config)?;
    let timings = &aggregate.timings;
    eprintln!(
        "> Done in {:.2}s (data preparation {:.2}s), peak memory {:.1} {}",
        timings.total_time.as_secs_f64(),
        timings.data_prep_time.as_secs_f64(),
        timings.peak_memory,
        timings.memory_unit.suffix()
    );
    if !aggregate.exhausted_partitions.is_empty() {
        eprintln!(
            "> Warning: every attempt diverged for partition(s) {}; their results are from the last attempt.",
            aggregate.exhausted_partitions.join(", ")
        );
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Fit(args)) => run_fit(args),
        Some(Commands::Run { config }) => run_from_file(config),
        None => {
            Cli::command().print_help().expect("print help");
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
