//! Integration tests for the setlog binary.
//!
//! Every test runs against its own temp database and config home so the
//! user's real catalog is never touched. Nothing here needs a reachable
//! LLM; parse is only exercised on paths that fail before or at the
//! first model call.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn setup_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// CLI pointed at a database inside `dir`, isolated from user config
fn cli(dir: &TempDir) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("setlog"));
    cmd.env("XDG_CONFIG_HOME", dir.path().join("config"))
        .env("HOME", dir.path())
        .env_remove("SETLOG_LLM_API_KEY")
        .arg("--db")
        .arg(db_path(dir));
    cmd
}

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("setlog.db")
}

fn seed(dir: &TempDir) {
    cli(dir).arg("seed").assert().success();
}

/// Config file whose LLM endpoint refuses connections
fn unreachable_llm_config(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("unreachable.toml");
    fs::write(
        &path,
        r#"
[llm]
base_url = "http://127.0.0.1:9/v1"
timeout_secs = 2
connect_timeout_secs = 1
"#,
    )
    .expect("Failed to write config");
    path
}

#[test]
fn test_cli_help() {
    let dir = setup_test_dir();
    cli(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Turn free-text workout logs into structured records",
        ));
}

#[test]
fn test_seed_creates_database() {
    let dir = setup_test_dir();

    cli(&dir)
        .arg("seed")
        .assert()
        .success()
        .stdout(predicate::str::contains("Seeded 43 exercises"));

    assert!(db_path(&dir).exists());
}

#[test]
fn test_seed_is_idempotent() {
    let dir = setup_test_dir();
    seed(&dir);

    cli(&dir)
        .arg("seed")
        .assert()
        .success()
        .stdout(predicate::str::contains("Seeded 0 exercises (43 in catalog)"));
}

#[test]
fn test_resolve_exact_name() {
    let dir = setup_test_dir();
    seed(&dir);

    let output = cli(&dir)
        .args(["resolve", "bench press"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let explanation: Value = serde_json::from_slice(&output).expect("explain output is JSON");
    assert_eq!(explanation["slug"], "bench-press");
    assert_eq!(explanation["decision"]["action"], "match");
    assert_eq!(explanation["decision"]["candidate"]["strategy"], "exact");
    assert_eq!(explanation["decision"]["candidate"]["slug"], "bench-press");
}

#[test]
fn test_resolve_partial_name_uses_fulltext() {
    let dir = setup_test_dir();
    seed(&dir);

    let output = cli(&dir)
        .args(["resolve", "chin"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let explanation: Value = serde_json::from_slice(&output).expect("explain output is JSON");
    assert_eq!(explanation["decision"]["action"], "match");
    assert_eq!(explanation["decision"]["candidate"]["slug"], "chin-up");
    assert_eq!(explanation["decision"]["candidate"]["strategy"], "fulltext");
}

#[test]
fn test_resolve_unknown_name_would_create() {
    let dir = setup_test_dir();
    seed(&dir);

    cli(&dir)
        .args(["resolve", "Zercher Carry"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"action\": \"create\""))
        .stdout(predicate::str::contains("zercher-carry"));
}

#[test]
fn test_review_empty_queue() {
    let dir = setup_test_dir();
    seed(&dir);

    cli(&dir)
        .arg("review")
        .assert()
        .success()
        .stdout(predicate::str::contains("No exercises awaiting review"));
}

#[test]
fn test_review_approve_unknown_slug_fails() {
    let dir = setup_test_dir();
    seed(&dir);

    cli(&dir)
        .args(["review", "--approve", "nonexistent"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nonexistent"));
}

#[test]
fn test_show_missing_workout_fails() {
    let dir = setup_test_dir();
    seed(&dir);

    cli(&dir)
        .args(["show", "00000000-0000-0000-0000-000000000042"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_show_rejects_malformed_id() {
    let dir = setup_test_dir();

    cli(&dir).args(["show", "not-a-uuid"]).assert().failure();
}

#[test]
fn test_parse_empty_text_is_rejected_without_llm() {
    let dir = setup_test_dir();
    seed(&dir);
    let config = unreachable_llm_config(&dir);

    cli(&dir)
        .arg("--config")
        .arg(&config)
        .args(["parse", "   "])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Parse failed while validating"))
        .stderr(predicate::str::contains("NotAWorkout"));
}

#[test]
fn test_parse_with_unreachable_llm_fails_in_validation() {
    let dir = setup_test_dir();
    seed(&dir);
    let config = unreachable_llm_config(&dir);

    cli(&dir)
        .arg("--config")
        .arg(&config)
        .args(["parse", "Bench Press: 3x8 @ 135"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Parse failed while validating"))
        .stderr(predicate::str::contains("retrying may succeed"));
}

#[test]
fn test_parse_rejects_unknown_unit() {
    let dir = setup_test_dir();
    seed(&dir);
    let config = unreachable_llm_config(&dir);

    cli(&dir)
        .arg("--config")
        .arg(&config)
        .args(["parse", "Squat 5x5", "--unit", "stone"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown weight unit"));
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = setup_test_dir();
    let config = dir.path().join("bad.toml");
    fs::write(&config, "[resolver]\nfulltext_threshold = 3.0\n").unwrap();

    cli(&dir).arg("--config").arg(&config).arg("seed").assert().failure();
}

#[test]
fn test_init_config_writes_loadable_defaults() {
    let dir = setup_test_dir();
    let config = dir.path().join("conf").join("setlog.toml");

    cli(&dir)
        .arg("--config")
        .arg(&config)
        .arg("init-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote default config"));

    let contents = fs::read_to_string(&config).unwrap();
    assert!(contents.contains("[resolver]"));
    assert!(contents.contains("fulltext_threshold"));

    // Refuses to clobber without --force
    cli(&dir)
        .arg("--config")
        .arg(&config)
        .arg("init-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    // The written file is accepted by every other command
    cli(&dir)
        .arg("--config")
        .arg(&config)
        .arg("seed")
        .assert()
        .success();
}

#[test]
fn test_init_config_force_replaces_broken_file() {
    let dir = setup_test_dir();
    let config = dir.path().join("broken.toml");
    fs::write(&config, "[resolver]\nfulltext_threshold = 3.0\n").unwrap();

    cli(&dir)
        .arg("--config")
        .arg(&config)
        .args(["init-config", "--force"])
        .assert()
        .success();

    cli(&dir).arg("--config").arg(&config).arg("seed").assert().success();
}
