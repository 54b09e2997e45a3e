//! CLI test cases.

use std::{io::Write as _, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("bridge-worker").unwrap()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_missing_config_path_is_an_error() {
    cmd().assert().failure();
}

#[test]
fn test_nonexistent_config_file_is_an_error() {
    cmd()
        .arg("/nonexistent/bridge-worker.yaml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("could not read configuration file"));
}

#[test]
fn test_invalid_config_is_an_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "endpoints: [ {{ type: openai, name: main, url: https://api.openai.com/v1 }} ]").unwrap();
    cmd()
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("api_key"));
}
