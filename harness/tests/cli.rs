//! CLI tests for configuration handling and startup failures.
//!
//! Spawns the harness binary and verifies exit codes.

use std::fs;
use std::process::{Command, Stdio};

use model_harness::exit_codes;
use model_harness::io::config::{HarnessConfig, write_config};
use model_harness::io::fifo::{INPUT_PIPE_ENV, OUTPUT_PIPE_ENV};

fn harness() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_model-harness"));
    command
        .env_remove(INPUT_PIPE_ENV)
        .env_remove(OUTPUT_PIPE_ENV)
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    command
}

#[test]
fn check_config_accepts_a_written_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("harness.toml");
    let mut cfg = HarnessConfig::default();
    cfg.run.runs = 4;
    write_config(&path, &cfg).expect("write config");

    let status = harness()
        .arg("check-config")
        .arg("--config")
        .arg(&path)
        .status()
        .expect("check-config");
    assert_eq!(status.code(), Some(exit_codes::OK));
}

#[test]
fn check_config_falls_back_to_defaults_when_missing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = harness()
        .current_dir(temp.path())
        .arg("check-config")
        .status()
        .expect("check-config");
    assert_eq!(status.code(), Some(exit_codes::OK));
}

#[test]
fn check_config_rejects_an_invalid_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("harness.toml");
    fs::write(&path, "[run]\nsteps = 0\n").expect("write config");

    let status = harness()
        .arg("check-config")
        .arg("--config")
        .arg(&path)
        .status()
        .expect("check-config");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn run_without_pipe_environment_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = harness()
        .current_dir(temp.path())
        .args(["run", "--runs", "1", "--steps", "1"])
        .status()
        .expect("run");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn replay_of_a_missing_report_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = harness()
        .current_dir(temp.path())
        .args(["replay", "--trace", "nope/failure.json"])
        .status()
        .expect("replay");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}
