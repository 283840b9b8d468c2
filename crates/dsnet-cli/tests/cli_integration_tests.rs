//! CLI integration tests for dsnet
//!
//! Runs the dsnet binary against a throwaway config directory. Nothing here
//! needs a reachable relay or authority.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Command isolated to `dir` for both config and database
#[allow(deprecated)]
fn dsnet_cmd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("dsnet").unwrap();
    cmd.env("DSNET_CONFIG_DIR", dir.path());
    cmd.env("RUST_LOG", "off");
    cmd
}

/// Fresh config dir whose database lives inside it
fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("client.db");
    dsnet_cmd(&dir)
        .args(["config", "set", "database.path", db.to_str().unwrap()])
        .assert()
        .success();
    dir
}

#[test]
fn test_help_lists_commands() {
    let dir = TempDir::new().unwrap();
    dsnet_cmd(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("tokens"))
        .stdout(predicate::str::contains("query"))
        .stdout(predicate::str::contains("listen"));
}

#[test]
fn test_query_help_explains_expected_count() {
    let dir = TempDir::new().unwrap();
    dsnet_cmd(&dir)
        .args(["query", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("identical answers count once"));
}

#[test]
fn test_config_path_honors_env() {
    let dir = TempDir::new().unwrap();
    dsnet_cmd(&dir)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains(dir.path().to_str().unwrap()))
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_config_set_then_get() {
    let dir = TempDir::new().unwrap();

    dsnet_cmd(&dir)
        .args(["config", "set", "aggregation.late_responses", "record"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set aggregation.late_responses = record"));

    dsnet_cmd(&dir)
        .args(["config", "get", "aggregation.late_responses"])
        .assert()
        .success()
        .stdout(predicate::str::diff("record\n"));

    assert!(dir.path().join("config.toml").exists());
}

#[test]
fn test_config_rejects_invalid_values() {
    let dir = TempDir::new().unwrap();

    dsnet_cmd(&dir)
        .args(["config", "set", "submission.max_attempts", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_attempts"));

    dsnet_cmd(&dir)
        .args(["config", "get", "no.such.key"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown configuration key"));
}

#[test]
fn test_config_reset_restores_defaults() {
    let dir = TempDir::new().unwrap();

    dsnet_cmd(&dir)
        .args(["config", "set", "cover.enabled", "true"])
        .assert()
        .success();
    dsnet_cmd(&dir).args(["config", "reset"]).assert().success();

    dsnet_cmd(&dir)
        .args(["config", "get", "cover.enabled"])
        .assert()
        .success()
        .stdout(predicate::str::diff("false\n"));
}

#[test]
fn test_config_list_shows_all_sections() {
    let dir = TempDir::new().unwrap();
    dsnet_cmd(&dir)
        .args(["config", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("network.relay_url = "))
        .stdout(predicate::str::contains("submission.max_attempts = "))
        .stdout(predicate::str::contains("codec.buckets = "))
        .stdout(predicate::str::contains("cover.enabled = false"));
}

#[test]
fn test_migrate_creates_database() {
    let dir = workspace();

    dsnet_cmd(&dir)
        .arg("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Migrated schema"));
    assert!(dir.path().join("client.db").exists());

    dsnet_cmd(&dir)
        .arg("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("up to date"));
}

#[test]
fn test_status_on_empty_store() {
    let dir = workspace();
    dsnet_cmd(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("unused:   0"))
        .stdout(predicate::str::contains("none"));
}

#[test]
fn test_empty_listings() {
    let dir = workspace();

    dsnet_cmd(&dir)
        .args(["tokens", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No credentials found."));

    dsnet_cmd(&dir)
        .args(["queries", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No queries found."));
}

#[test]
fn test_unknown_state_filter_fails() {
    let dir = workspace();
    dsnet_cmd(&dir)
        .args(["queries", "list", "--state", "pending"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown query state"));
}

#[test]
fn test_show_missing_query_fails() {
    let dir = workspace();
    dsnet_cmd(&dir)
        .args(["queries", "show", "00000000-0000-0000-0000-000000000001"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_sweep_with_nothing_expired() {
    let dir = workspace();
    dsnet_cmd(&dir)
        .arg("sweep")
        .assert()
        .success()
        .stdout(predicate::str::contains("Expired 0 queries"));
}
