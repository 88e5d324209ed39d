//! CLI integration tests for warehouse-transfer.
//!
//! These tests verify command-line argument parsing, help output,
//! and exit codes for various error conditions.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the warehouse-transfer binary.
fn cmd() -> Command {
    Command::cargo_bin("warehouse-transfer").unwrap()
}

fn credentials_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", content).unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("register-source"))
        .stdout(predicate::str::contains("check-credentials"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--job"));
}

#[test]
fn test_serve_subcommand_help() {
    cmd()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--bind"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("warehouse-transfer"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flags_and_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"))
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

#[test]
fn test_short_config_flag() {
    cmd()
        .args(["-c", "some_config.yaml", "--help"])
        .assert()
        .success();
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Exit Code Tests - Config Errors (Exit Code 1)
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_7() {
    // Missing file is an IO error (code 7), not config error (code 1)
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "status", "job-1"])
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "status", "job-1"])
        .assert()
        .code(1);
}

#[test]
fn test_file_registry_without_signing_key_exits_with_code_1() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "registry:").unwrap();
    writeln!(file, "  backend: file").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "status", "job-1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("registry.signing_key"));
}

#[test]
fn test_unknown_warehouse_kind_is_rejected() {
    let creds = credentials_file("host: h\n");
    cmd()
        .args([
            "check-credentials",
            "--kind",
            "oracle",
            "--credentials",
            creds.path().to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown warehouse kind"));
}

// =============================================================================
// Credential Checks
// =============================================================================

#[test]
fn test_check_credentials_reports_missing_fields() {
    let creds = credentials_file("host: pg.internal\nport: 5432\ndatabase: app\nuser: etl\n");
    cmd()
        .args([
            "check-credentials",
            "--kind",
            "postgres",
            "--credentials",
            creds.path().to_str().unwrap(),
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("password"));
}

#[test]
fn test_check_credentials_accepts_complete_map_without_leaking_secrets() {
    let creds = credentials_file(
        r#"{"host": "ch.internal", "database": "lake", "user": "loader", "password": "do-not-print-me"}"#,
    );
    cmd()
        .args([
            "--output-json",
            "check-credentials",
            "--kind",
            "clickhouse",
            "--credentials",
            creds.path().to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"valid\":true"))
        .stdout(predicate::str::contains("ch.internal:8123/lake"))
        .stdout(predicate::str::contains("do-not-print-me").not())
        .stderr(predicate::str::contains("do-not-print-me").not());
}

#[test]
fn test_missing_credentials_file_exits_with_code_7() {
    cmd()
        .args([
            "check-credentials",
            "--kind",
            "postgres",
            "--credentials",
            "no_such_credentials.yaml",
        ])
        .assert()
        .code(7);
}

// =============================================================================
// Registry-backed Commands
// =============================================================================

fn file_registry_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        format!(
            "registry:\n  backend: file\n  path: {}\n  signing_key: test-key\n",
            dir.path().join("jobs.json").display()
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_status_of_unknown_job_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = file_registry_config(&dir);

    cmd()
        .args(["--config", config.to_str().unwrap(), "status", "acme_postgres_workflow"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not found"));
}

#[test]
fn test_register_source_prints_id() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = file_registry_config(&dir);
    let creds = credentials_file(
        "host: pg.internal\nport: 5432\ndatabase: app\nuser: etl\npassword: s3cret\n",
    );

    cmd()
        .args([
            "--config",
            config.to_str().unwrap(),
            "--output-json",
            "register-source",
            "--organization",
            "acme",
            "--kind",
            "postgres",
            "--credentials",
            creds.path().to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\""));

    assert!(dir.path().join("jobs.json").exists());
}
