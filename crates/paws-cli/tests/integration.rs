//! End-to-end tests of the `paws` binary on small synthetic datasets.

use std::path::{Path, PathBuf};
use std::process::Command;

use events::{EventReader, Split};
use paws::aggregate::collect_results;
use paws::landscape::Landscape;

fn paws() -> Command {
    Command::new(env!("CARGO_BIN_EXE_paws"))
}

fn run_ok(cmd: &mut Command) -> String {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap()
}

/// Small, fast configuration shared by the tests.
fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("paws.toml");
    std::fs::write(
        &path,
        r#"
[model]
hidden = [8]

[training]
batch_size = 128
max_epochs = 2
network_lr = 0.01

[data]
split_seed = 3
"#,
    )
    .unwrap();
    path
}

fn generate(dir: &Path) -> PathBuf {
    let data = dir.join("events.parquet");
    run_ok(paws().args([
        "generate",
        "--output",
        data.to_str().unwrap(),
        "--n-reference",
        "400",
        "--n-mixed",
        "400",
        "--mu",
        "0.1",
        "--seed",
        "9",
    ]));
    data
}

#[test]
fn test_generate_and_summary() {
    let tmp = tempfile::TempDir::new().unwrap();
    let data = generate(tmp.path());

    let events = EventReader::read_all(&data).unwrap();
    assert_eq!(events.len(), 800);

    let stdout = run_ok(paws().args(["summary", "--input", data.to_str().unwrap()]));
    assert!(stdout.contains("Total events: 800"));

    let json = run_ok(paws().args(["summary", "--input", data.to_str().unwrap(), "--json"]));
    let summary: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(summary["reference_count"], 400);
    assert_eq!(summary["mixed_count"], 400);
}

#[test]
fn test_train_gather_and_evaluate_scan() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = write_config(tmp.path());
    let data = generate(tmp.path());
    let runs = tmp.path().join("runs");

    for seed in ["1", "2"] {
        let stdout = run_ok(paws().args([
            "train",
            "--config",
            config.to_str().unwrap(),
            "--data",
            data.to_str().unwrap(),
            "--output-dir",
            runs.to_str().unwrap(),
            "--mode",
            "dedicated",
            "--seed",
            seed,
        ]));
        assert!(stdout.contains("--- Training Summary ---"));
    }

    let results = collect_results(&runs).unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.terminal_state.is_success()));
    // Same configuration, different seeds: one group.
    assert_eq!(results[0].group_key, results[1].group_key);

    let summary = tmp.path().join("summary.parquet");
    let summary_json = tmp.path().join("summary.json");
    run_ok(paws().args([
        "gather",
        "--input",
        runs.to_str().unwrap(),
        "--output",
        summary.to_str().unwrap(),
        "--json",
        summary_json.to_str().unwrap(),
        "--top-k",
        "1",
    ]));
    assert!(summary.exists());
    let rows: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&summary_json).unwrap()).unwrap();
    assert_eq!(rows.as_array().unwrap().len(), 1);
    assert_eq!(rows[0]["n_runs"], 2);
    assert_eq!(rows[0]["n_kept"], 1);

    let model_dir = runs.join(&results[0].run_id);
    let scan_dir = tmp.path().join("scan");
    run_ok(paws().args([
        "scan",
        "--config",
        config.to_str().unwrap(),
        "--data",
        data.to_str().unwrap(),
        "--output-dir",
        scan_dir.to_str().unwrap(),
        "--model",
        model_dir.to_str().unwrap(),
        "--scan-mode",
        "evaluate",
        "--grid",
        "mu=(0.0,0.05)",
        "--metric",
        "auc",
    ]));

    let landscape = Landscape::load(&scan_dir.join("landscape.json")).unwrap();
    assert_eq!(landscape.points.len(), 2);
    assert_eq!(landscape.total_failures(), 0);
    // mu = 0 makes every log ratio zero.
    assert_eq!(landscape.points[0].aggregated, Some(0.5));

    let stdout = run_ok(paws().args([
        "summary",
        "--input",
        scan_dir.join("landscape.json").to_str().unwrap(),
    ]));
    assert!(stdout.contains("--- Landscape ---"));
}

#[test]
fn test_retrain_scan_writes_landscape_and_runs() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = write_config(tmp.path());
    let data = generate(tmp.path());
    let scan_dir = tmp.path().join("scan");

    run_ok(paws().args([
        "scan",
        "--config",
        config.to_str().unwrap(),
        "--data",
        data.to_str().unwrap(),
        "--output-dir",
        scan_dir.to_str().unwrap(),
        "--grid",
        "m1=(250,300),m2=(300)",
        "--restarts",
        "2",
        "--max-concurrency",
        "2",
        "--mu",
        "0.1",
    ]));

    let landscape = Landscape::load(&scan_dir.join("landscape.json")).unwrap();
    assert_eq!(landscape.points.len(), 2);
    for point in &landscape.points {
        assert_eq!(point.per_restart.len(), 2);
    }
    let results = collect_results(&scan_dir).unwrap();
    assert_eq!(
        results.len() + landscape.total_failures(),
        4,
        "every run either wrote a result or counted as a failure"
    );
}

#[test]
fn test_invalid_inputs_fail_cleanly() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = write_config(tmp.path());
    let data = generate(tmp.path());

    // Unknown grid parameter.
    let output = paws()
        .args([
            "scan",
            "--config",
            config.to_str().unwrap(),
            "--data",
            data.to_str().unwrap(),
            "--grid",
            "m3=(100)",
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());

    // Mass outside the physical window.
    let output = paws()
        .args([
            "train",
            "--config",
            config.to_str().unwrap(),
            "--data",
            data.to_str().unwrap(),
            "--masses",
            "10,300",
            "--output-dir",
            tmp.path().join("runs").to_str().unwrap(),
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(!tmp.path().join("runs").exists());

    // Evaluate scans need a model.
    let output = paws()
        .args([
            "scan",
            "--data",
            data.to_str().unwrap(),
            "--grid",
            "mu=(0.01)",
            "--scan-mode",
            "evaluate",
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_feature_selection_from_config() {
    let tmp = tempfile::TempDir::new().unwrap();
    let data = generate(tmp.path());
    let events = EventReader::read_all(&data).unwrap();
    let dataset =
        events::InMemoryDataset::from_events(events, Default::default(), 3).unwrap();
    let projected = dataset.select_features(&[0, 1, 2]).unwrap();
    assert!(projected
        .events(Split::Test)
        .iter()
        .all(|e| e.features.len() == 3));
}

#[test]
fn test_pretrain_then_semi_weakly_with_inferred_kappa() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = write_config(tmp.path());
    let data = generate(tmp.path());
    let pretrained = tmp.path().join("pretrained");

    let stdout = run_ok(paws().args([
        "pretrain",
        "--config",
        config.to_str().unwrap(),
        "--output-dir",
        pretrained.to_str().unwrap(),
        "--mass-points",
        "250:300,300:300,350:300",
        "--n-signal-per-point",
        "60",
        "--n-background",
        "300",
    ]));
    assert!(stdout.contains("--- Pretraining Summary ---"));
    assert!(pretrained.join("classifier.json").exists());
    assert!(pretrained.join("supervised_result.json").exists());

    let runs = tmp.path().join("runs");
    let stdout = run_ok(paws().args([
        "train",
        "--config",
        config.to_str().unwrap(),
        "--data",
        data.to_str().unwrap(),
        "--output-dir",
        runs.to_str().unwrap(),
        "--pretrained",
        pretrained.to_str().unwrap(),
        "--mode",
        "semi_weakly",
        "--kappa",
        "inferred",
        "--mu",
        "0.05",
    ]));
    assert!(stdout.contains("Mode: semi_weakly"));
    let results = collect_results(&runs).unwrap();
    assert_eq!(results.len(), 1);

    // A misspelled estimate is rejected before training.
    let output = paws()
        .args([
            "train",
            "--config",
            config.to_str().unwrap(),
            "--data",
            data.to_str().unwrap(),
            "--kappa",
            "guessed",
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_sampled_kappa_run() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = write_config(tmp.path());
    let data = generate(tmp.path());
    let runs = tmp.path().join("runs");

    run_ok(paws().args([
        "train",
        "--config",
        config.to_str().unwrap(),
        "--data",
        data.to_str().unwrap(),
        "--output-dir",
        runs.to_str().unwrap(),
        "--kappa",
        "sampled",
    ]));
    let results = collect_results(&runs).unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].terminal_state.is_success());
}

#[test]
fn test_existing_landscape_skips_scan() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = write_config(tmp.path());
    let data = generate(tmp.path());
    let scan_dir = tmp.path().join("scan");
    let scan = |extra: &[&str]| {
        let mut cmd = paws();
        cmd.args([
            "scan",
            "--config",
            config.to_str().unwrap(),
            "--data",
            data.to_str().unwrap(),
            "--output-dir",
            scan_dir.to_str().unwrap(),
            "--grid",
            "m1=(300),m2=(300)",
            "--mu",
            "0.1",
        ])
        .args(extra);
        run_ok(&mut cmd)
    };

    let first = scan(&[]);
    assert!(first.contains("Output:"));
    let runs_after_first = collect_results(&scan_dir).unwrap().len();

    let second = scan(&[]);
    assert!(second.contains("Cached:"));
    assert_eq!(collect_results(&scan_dir).unwrap().len(), runs_after_first);

    let third = scan(&["--no-cache", "--seed", "77"]);
    assert!(third.contains("Output:"));
    assert!(!third.contains("Cached:"));
}

#[test]
fn test_gather_filters_by_hypothesis_and_trial() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = write_config(tmp.path());
    let data = generate(tmp.path());
    let runs = tmp.path().join("runs");

    for (mu, seed) in [("0.05", "1"), ("0.1", "2")] {
        run_ok(paws().args([
            "train",
            "--config",
            config.to_str().unwrap(),
            "--data",
            data.to_str().unwrap(),
            "--output-dir",
            runs.to_str().unwrap(),
            "--mu",
            mu,
            "--seed",
            seed,
        ]));
    }
    assert_eq!(collect_results(&runs).unwrap().len(), 2);

    let gather = |extra: &[&str]| {
        let summary_json = tmp.path().join("summary.json");
        let mut cmd = paws();
        cmd.args([
            "gather",
            "--input",
            runs.to_str().unwrap(),
            "--output",
            tmp.path().join("summary.parquet").to_str().unwrap(),
            "--json",
            summary_json.to_str().unwrap(),
        ])
        .args(extra);
        run_ok(&mut cmd);
        let rows: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&summary_json).unwrap()).unwrap();
        rows.as_array()
            .unwrap()
            .iter()
            .map(|row| row["n_runs"].as_u64().unwrap())
            .sum::<u64>()
    };

    assert_eq!(gather(&[]), 2);
    assert_eq!(gather(&["--mu-list", "0.05"]), 1);
    assert_eq!(gather(&["--mass-points", "*:300", "--trial-list", "0"]), 2);

    // Nothing passes: the command fails instead of writing an empty table.
    let output = paws()
        .args([
            "gather",
            "--input",
            runs.to_str().unwrap(),
            "--output",
            tmp.path().join("empty.parquet").to_str().unwrap(),
            "--mass-points",
            "500:500",
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
}
