#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn intercept(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("intercept").expect("intercept binary");
    cmd.current_dir(dir).env_remove("RUST_LOG");
    cmd
}

const SCHEMA_BUNDLE: &str = r#"
Version: "1.0.0"
Policies:
  - id: service-port
    type: json
    filepattern: 'service\.json$'
    enforcement:
      - environment: all
        fatal: "true"
        exceptions: "false"
        confidence: high
    _schema:
      structure: '{"type":"object","required":["port"]}'
"#;

fn seed(dir: &Path, service: &str) {
    std::fs::create_dir_all(dir.join("target")).unwrap();
    std::fs::write(dir.join("target/service.json"), service).unwrap();
    std::fs::write(dir.join("policy.yaml"), SCHEMA_BUNDLE).unwrap();
}

#[test]
fn version_prints_package_version() {
    let dir = tempfile::tempdir().unwrap();
    intercept(dir.path())
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn config_add_then_reset() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("base.yaml"), "Version: \"1.0\"\nNamespace: dev\n").unwrap();
    std::fs::write(dir.path().join("overlay.yaml"), "Namespace: prod\n").unwrap();

    intercept(dir.path())
        .args(["config", "--add", "base.yaml"])
        .assert()
        .success();
    intercept(dir.path())
        .args(["config", "--add", "overlay.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config file updated"));

    let merged = std::fs::read_to_string(dir.path().join("config.yaml")).unwrap();
    assert!(merged.contains("Namespace: prod"), "{merged}");
    assert!(merged.contains("Version"), "{merged}");

    intercept(dir.path())
        .args(["config", "--reset"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config cleared"));
    assert!(!dir.path().join("config.yaml").exists());
}

#[test]
fn compliant_audit_exits_zero_and_writes_report() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), r#"{"port": 8080}"#);

    intercept(dir.path())
        .args(["audit", "--policy", "policy.yaml", "--target", "target", "-o", "out"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("All policies compliant"));

    let reports: Vec<_> = std::fs::read_dir(dir.path().join("out"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with("intercept_") && n.ends_with(".sarif.json"))
        .collect();
    assert_eq!(reports.len(), 1, "{reports:?}");
}

#[test]
fn fatal_result_exits_one_unless_break_disabled() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), r#"{"host": "x"}"#);

    intercept(dir.path())
        .args(["audit", "--policy", "policy.yaml", "--target", "target", "-o", "out"])
        .assert()
        .code(1);

    intercept(dir.path())
        .args(["audit", "--policy", "policy.yaml", "--target", "target", "-o", "out", "--break", "false"])
        .assert()
        .code(0);
}

#[test]
fn audit_falls_back_to_active_config() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), r#"{"port": 1}"#);
    std::fs::rename(dir.path().join("policy.yaml"), dir.path().join("config.yaml")).unwrap();

    intercept(dir.path())
        .args(["audit", "--target", "target", "-o", "out"])
        .assert()
        .code(0);
}

#[test]
fn missing_bundle_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    intercept(dir.path())
        .args(["audit", "--target", "."])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("fatal:"));
}

#[test]
fn checksum_mismatch_has_its_own_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), r#"{"port": 1}"#);
    intercept(dir.path())
        .args(["audit", "--policy", "policy.yaml", "--checksum", "deadbeef", "--target", "target", "-o", "out"])
        .assert()
        .code(3);
}
