use std::fs;
use std::process::Command;

use tempfile::tempdir;

const SUMSTATS: &str = "CHR\tSNP\tPOS\tA1\tA2\tBETA\tSE\tN\n\
1\trs1\t100\tA\tG\t0.12\t0.02\t2000\n\
1\trs2\t200\tC\tT\t0.01\t0.02\t2000\n\
2\trs3\t300\tA\tC\t-0.09\t0.02\t2000\n\
2\trs4\t400\tG\tT\t0.00\t0.02\t2000\n";

#[test]
fn fit_subcommand_writes_tables_and_config() {
    let tmp = tempdir().expect("temporary directory");
    let sumstats = tmp.path().join("trait.sumstats");
    fs::write(&sumstats, SUMSTATS).expect("write sumstats");

    let exe = env!("CARGO_BIN_EXE_penfit");
    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "fit",
            sumstats.to_str().expect("path str"),
            "--output",
            "out/trait",
            "--n-jobs",
            "2",
            "--ladder-steps",
            "4",
            "--lambda-min",
            "infer",
            "--profile",
            "--write-config",
            "run.toml",
        ])
        .status()
        .expect("run penfit cli");

    assert!(status.success(), "CLI exited with status {status:?}");
    for suffix in ["tsv", "hyp", "prof"] {
        let path = tmp.path().join(format!("out/trait.{suffix}"));
        assert!(path.exists(), "{} missing", path.display());
    }
    assert!(!tmp.path().join("out/trait.validation").exists());

    let config = fs::read_to_string(tmp.path().join("run.toml")).expect("saved config");
    assert!(config.contains("lambda_min = \"infer\""));
    assert!(config.contains("n_jobs = 2"));
}

#[test]
fn run_subcommand_reads_toml_configuration() {
    let tmp = tempdir().expect("temporary directory");
    fs::write(tmp.path().join("trait.sumstats"), SUMSTATS).expect("write sumstats");
    fs::write(
        tmp.path().join("run.toml"),
        "sumstats = \"trait.sumstats\"\n\
output_prefix = \"fits/trait\"\n\
partition_mode = \"genome_wide\"\n\
strategy = \"pathwise\"\n\
\n\
[strategy_params]\n\
penalty_path = [0.05, 0.02]\n\
\n\
[model.penalty]\n\
kind = \"lasso\"\n",
    )
    .expect("write config");

    let exe = env!("CARGO_BIN_EXE_penfit");
    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args(["run", "run.toml"])
        .status()
        .expect("run penfit cli");

    assert!(status.success(), "CLI exited with status {status:?}");
    let hyp = fs::read_to_string(tmp.path().join("fits/trait.hyp")).expect("hyp table");
    let tags: Vec<&str> = hyp
        .lines()
        .skip(1)
        .filter_map(|line| line.split('\t').next())
        .collect();
    assert_eq!(tags, vec!["All"]);
}

#[test]
fn invalid_input_exits_non_zero_without_output() {
    let tmp = tempdir().expect("temporary directory");

    let exe = env!("CARGO_BIN_EXE_penfit");
    let output = Command::new(exe)
        .current_dir(tmp.path())
        .args(["fit", "missing.sumstats", "--output", "out/trait"])
        .output()
        .expect("run penfit cli");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "stderr was: {stderr}");
    assert!(!tmp.path().join("out").exists());
}

#[test]
fn grid_search_without_validation_is_a_configuration_error() {
    let tmp = tempdir().expect("temporary directory");
    let sumstats = tmp.path().join("trait.sumstats");
    fs::write(&sumstats, SUMSTATS).expect("write sumstats");

    let exe = env!("CARGO_BIN_EXE_penfit");
    let output = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "fit",
            sumstats.to_str().expect("path str"),
            "--tuning",
            "grid-search",
        ])
        .output()
        .expect("run penfit cli");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Incompatible options"), "stderr was: {stderr}");
}

#[test]
fn rejected_configuration_is_not_saved() {
    let tmp = tempdir().expect("temporary directory");
    let sumstats = tmp.path().join("trait.sumstats");
    fs::write(&sumstats, SUMSTATS).expect("write sumstats");

    let exe = env!("CARGO_BIN_EXE_penfit");
    let output = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "fit",
            sumstats.to_str().expect("path str"),
            "--n-jobs",
            "0",
            "--write-config",
            "run.toml",
        ])
        .output()
        .expect("run penfit cli");

    assert!(!output.status.success());
    assert!(!tmp.path().join("run.toml").exists());
}
