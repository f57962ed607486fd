use penfit::config::RunConfig;
use penfit::model::PenaltyKind;
use penfit::orchestrator::{RunError, execute};
use penfit::partition::PartitionError;
use penfit::types::{FitStrategy, LambdaMin, PartitionMode, TuningMode};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{TempDir, tempdir};

const TRAIN: &str = "CHR\tSNP\tPOS\tA1\tA2\tZ\tN\n\
1\trs1\t100\tA\tG\t6.0\t1000\n\
1\trs2\t200\tC\tT\t2.5\t1000\n\
1\trs3\t300\tA\tC\t-0.4\t1000\n\
chr2\trs4\t150\tG\tT\t-5.0\t1000\n\
chr2\trs5\t250\tA\tG\t0.3\t1000\n";

const VALID_BOTH: &str = "CHR\tSNP\tPOS\tA1\tA2\tZ\tN\n\
1\trs1\t100\tA\tG\t4.0\t800\n\
1\trs2\t200\tC\tT\t1.0\t800\n\
2\trs4\t150\tT\tG\t3.5\t800\n";

const VALID_CHR1_ONLY: &str = "CHR\tSNP\tPOS\tA1\tA2\tZ\tN\n\
1\trs1\t100\tA\tG\t4.0\t800\n";

const LD: &str = "SNP_A\tSNP_B\tR\n\
rs1\trs2\t0.3\n\
rs2\trs3\t0.1\n\
rs4\trs5\t-0.2\n";

struct Fixture {
    dir: TempDir,
    config: RunConfig,
}

impl Fixture {
    fn new(validation: Option<&str>) -> Self {
        let dir = tempdir().expect("temporary directory");
        let sumstats = write(dir.path(), "train.sumstats", TRAIN);
        let mut config = RunConfig::new(sumstats, dir.path().join("results/run"));
        config.ld = Some(write(dir.path(), "panel.ld", LD));
        config.validation = validation.map(|text| write(dir.path(), "valid.sumstats", text));
        config.strategy_params.ladder_steps = 5;
        config.memory.interval_ms = 5;
        Self { dir, config }
    }

    fn output(&self, suffix: &str) -> PathBuf {
        self.dir.path().join(format!("results/run.{suffix}"))
    }
}

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write fixture");
    path
}

/// Values of the first column, skipping the header.
fn first_column(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .expect("read output table")
        .lines()
        .skip(1)
        .map(|line| line.split('\t').next().unwrap_or_default().to_string())
        .collect()
}

fn header(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .expect("read output table")
        .lines()
        .next()
        .unwrap_or_default()
        .split('\t')
        .map(str::to_string)
        .collect()
}

#[test]
fn per_chromosome_warm_start_run_writes_tagged_tables() {
    let mut fixture = Fixture::new(None);
    fixture.config.n_jobs = 2;
    fixture.config.tuning = TuningMode::WarmStart;

    let (aggregate, written) = execute(&fixture.config).expect("run succeeds");
    assert_eq!(written.len(), 2);
    assert_eq!(aggregate.hyperparameters.height(), 2);
    assert!(aggregate.validation.is_none());
    assert!(aggregate.exhausted_partitions.is_empty());

    assert_eq!(first_column(&fixture.output("hyp")), vec!["1", "2"]);
    assert_eq!(
        header(&fixture.output("tsv")),
        vec!["CHR", "SNP", "POS", "A1", "A2", "BETA"]
    );
    assert_eq!(first_column(&fixture.output("tsv")), vec!["1", "1", "1", "2", "2"]);
    assert!(!fixture.output("validation").exists());
    assert!(!fixture.output("prof").exists());
}

#[test]
fn grid_search_selects_per_partition_and_writes_validation() {
    let mut fixture = Fixture::new(Some(VALID_BOTH));
    fixture.config.tuning = TuningMode::GridSearch;
    fixture.config.write_profile = true;

    let (aggregate, _) = execute(&fixture.config).expect("run succeeds");
    let validation = aggregate.validation.as_ref().expect("validation table");
    assert_eq!(validation.height(), 10);

    let tags = first_column(&fixture.output("validation"));
    assert_eq!(tags.iter().filter(|t| *t == "1").count(), 5);
    assert_eq!(tags.iter().filter(|t| *t == "2").count(), 5);
    assert!(header(&fixture.output("validation")).contains(&"Pseudo_validation".to_string()));

    let profile = header(&fixture.output("prof"));
    for column in ["Partition", "Load_time", "Fit_time", "Validation_time", "Peak_memory_MB"] {
        assert!(profile.contains(&column.to_string()), "missing {column}");
    }
}

#[test]
fn missing_validation_partition_aborts_without_output() {
    let mut fixture = Fixture::new(Some(VALID_CHR1_ONLY));
    fixture.config.tuning = TuningMode::GridSearch;
    fixture.config.n_jobs = 2;

    let err = execute(&fixture.config).expect_err("run must fail");
    assert!(
        matches!(
            err,
            RunError::Partition(PartitionError::MissingValidationPartition(ref id)) if id == "2"
        ),
        "unexpected error: {err}"
    );
    for suffix in ["tsv", "hyp", "validation", "prof"] {
        assert!(!fixture.output(suffix).exists(), "{suffix} was written");
    }
    let leftovers = fs::read_dir(fixture.dir.path().join("results"))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[test]
fn genome_wide_spike_slab_run_with_inferred_floor() {
    let mut fixture = Fixture::new(None);
    fixture.config.partition_mode = PartitionMode::GenomeWide;
    fixture.config.strategy = FitStrategy::ColdStart;
    fixture.config.model.penalty = PenaltyKind::SpikeSlab {
        slab: 1.0,
        theta: 0.1,
    };
    fixture.config.model.lambda_min = LambdaMin::Infer;

    execute(&fixture.config).expect("run succeeds");
    assert_eq!(first_column(&fixture.output("hyp")), vec!["All"]);
    let hyp_header = header(&fixture.output("hyp"));
    assert!(hyp_header.contains(&"Slab".to_string()));
    assert!(hyp_header.contains(&"Theta".to_string()));
}

#[test]
fn pathwise_run_walks_the_given_path() {
    let mut fixture = Fixture::new(Some(VALID_BOTH));
    fixture.config.strategy = FitStrategy::Pathwise;
    fixture.config.strategy_params.penalty_path = vec![0.2, 0.1, 0.05];
    fixture.config.tuning = TuningMode::GridSearch;

    let (aggregate, _) = execute(&fixture.config).expect("run succeeds");
    assert_eq!(aggregate.validation.as_ref().map(|v| v.height()), Some(6));
}

#[test]
fn invalid_configuration_is_rejected_before_any_work() {
    let mut fixture = Fixture::new(None);
    fixture.config.n_jobs = 0;
    let err = execute(&fixture.config).expect_err("invalid config");
    assert!(matches!(err, RunError::Config(_)));
    assert!(!fixture.dir.path().join("results").exists());
}
