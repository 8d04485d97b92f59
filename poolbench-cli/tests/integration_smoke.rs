//! Smoke tests for the poolbench binary, run against the in-memory backend

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn poolbench() -> Command {
    let mut cmd = Command::cargo_bin("poolbench").unwrap();
    cmd.env("POOLBENCH_QUIET", "1").env("RUST_LOG", "warn");
    cmd
}

#[test]
fn test_help_lists_flags() {
    poolbench()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--max-pool"))
        .stdout(predicate::str::contains("--strategy"));
}

#[test]
fn test_run_help() {
    poolbench()
        .arg("run")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--acquire-timeout"));
}

#[test]
fn test_memory_comparison() {
    poolbench()
        .args(["--backend", "memory", "-n", "20", "-c", "4", "--memory-connect-latency-ms", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Without Pooling"))
        .stdout(predicate::str::contains("With Pooling"))
        .stdout(predicate::str::contains("Performance Gain"));
}

#[test]
fn test_single_strategy_has_no_comparison() {
    poolbench()
        .args(["run", "--backend", "memory", "--strategy", "pooled", "-n", "10", "-c", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("With Pooling"))
        .stdout(predicate::str::contains("Performance Gain").not());
}

#[test]
fn test_json_output_uses_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[workload]\nentities = 7\nconcurrency = 3").unwrap();

    let output = poolbench()
        .args(["--backend", "memory", "--json", "--config"])
        .arg(file.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["config"]["workload"]["entities"], 7);
    assert_eq!(json["runs"].as_array().unwrap().len(), 2);
    assert_eq!(json["runs"][0]["strategy"], "direct");
    assert_eq!(json["runs"][1]["phases"][3]["succeeded"], 7);
    assert_eq!(json["comparison"]["operations_per_phase"], 7);
    assert!(json["config"]["connection"].get("password").is_none());
}

#[test]
fn test_invalid_pool_range_fails() {
    poolbench()
        .args(["--backend", "memory", "--min-pool", "5", "--max-pool", "2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("min_size"));
}

#[test]
fn test_env_overrides_config_file_and_flag_overrides_env() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[connection]\nhost = \"file-host\"\nport = 1111\ndatabase = \"file_db\""
    )
    .unwrap();

    let output = poolbench()
        .env("HOST", "env-host")
        .env("PORT", "2222")
        .env_remove("DB_NAME")
        .args(["--backend", "memory", "--json", "-n", "2", "--port", "3333", "--config"])
        .arg(file.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let connection = &json["config"]["connection"];
    assert_eq!(connection["host"], "env-host");
    assert_eq!(connection["port"], 3333);
    assert_eq!(connection["database"], "file_db");
}

#[test]
fn test_dotenv_feeds_flags_and_log_filter() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(".env"),
        "DB_NAME=dotenv_db\nRUST_LOG=error\n",
    )
    .unwrap();

    let output = poolbench()
        .current_dir(dir.path())
        .env_remove("DB_NAME")
        .env_remove("RUST_LOG")
        .args(["--backend", "memory", "--json", "-n", "2"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["config"]["connection"]["database"], "dotenv_db");
    // RUST_LOG=error from .env silences the info-level run summary
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("starting benchmark"), "{stderr}");
}
