//! CLI integration tests for davlock
//!
//! Runs the davlock binary end-to-end using assert_cmd. Every test gets its
//! own config directory and lock file.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

struct Env {
    dir: TempDir,
}

impl Env {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn lock_file(&self) -> PathBuf {
        self.dir.path().join("locks.json")
    }

    /// Command isolated to this environment's config dir
    #[allow(deprecated)]
    fn bare(&self) -> Command {
        let mut cmd = Command::cargo_bin("davlock").unwrap();
        cmd.env("DAVLOCK_CONFIG_DIR", self.dir.path().join("config"));
        cmd.env_remove("RUST_LOG");
        cmd
    }

    /// Command using the JSON backend in this environment
    fn cmd(&self) -> Command {
        let mut cmd = self.bare();
        cmd.arg("--backend").arg("json").arg("--db").arg(self.lock_file());
        cmd
    }

    fn acquire_json(&self, args: &[&str]) -> serde_json::Value {
        let output = self
            .cmd()
            .args(["--format", "json", "acquire"])
            .args(args)
            .output()
            .unwrap();
        assert!(output.status.success(), "acquire {:?} failed", args);
        serde_json::from_slice(&output.stdout).unwrap()
    }
}

#[test]
fn test_help_lists_commands() {
    let env = Env::new();
    env.bare()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("acquire"))
        .stdout(predicate::str::contains("query"))
        .stdout(predicate::str::contains("purge"));
}

#[test]
fn test_acquire_prints_state_token() {
    let env = Env::new();
    env.cmd()
        .args(["acquire", "/docs", "--recursive", "--owner", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Lock acquired."))
        .stdout(predicate::str::contains("urn:uuid:"))
        .stdout(predicate::str::contains("owner: alice"));
}

#[test]
fn test_exclusive_recursive_lock_blocks_descendant() {
    let env = Env::new();
    env.acquire_json(&["/docs", "-r"]);

    env.cmd()
        .args(["acquire", "/docs/readme.txt", "--shared"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Conflicting locks:"))
        .stderr(predicate::str::contains("Lock conflict"));
}

#[test]
fn test_shared_locks_coexist_with_distinct_tokens() {
    let env = Env::new();
    let first = env.acquire_json(&["/docs", "--shared"]);
    let second = env.acquire_json(&["/docs", "--shared"]);

    assert_eq!(first["share_mode"], "shared");
    assert_ne!(first["state_token"], second["state_token"]);

    let output = env.cmd().args(["--format", "json", "list"]).output().unwrap();
    let locks: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(locks.as_array().unwrap().len(), 2);
}

#[test]
fn test_release_is_idempotent() {
    let env = Env::new();
    let lock = env.acquire_json(&["/a"]);
    let token = lock["state_token"].as_str().unwrap();

    env.cmd()
        .args(["release", token])
        .assert()
        .success()
        .stdout(predicate::str::contains("released"));

    env.cmd()
        .args(["release", token])
        .assert()
        .success()
        .stdout(predicate::str::contains("already released"));
}

#[test]
fn test_release_at_outside_range_fails() {
    let env = Env::new();
    let lock = env.acquire_json(&["/a/b"]);
    let token = lock["state_token"].as_str().unwrap();

    env.cmd()
        .args(["release", token, "--path", "/elsewhere"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not cover"));

    env.cmd()
        .args(["release", token, "--path", "/a/b"])
        .assert()
        .success();
}

#[test]
fn test_refresh_unknown_token_fails() {
    let env = Env::new();
    env.cmd()
        .args(["refresh", "urn:uuid:00000000-0000-0000-0000-000000000000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_refresh_changes_timeout() {
    let env = Env::new();
    let lock = env.acquire_json(&["/a", "--timeout", "60"]);
    let token = lock["state_token"].as_str().unwrap();

    let output = env
        .cmd()
        .args(["--format", "json", "refresh", token, "--timeout", "120"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let refreshed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(refreshed["timeout"], "120s");
    assert!(!refreshed["last_refresh"].is_null());
}

#[test]
fn test_query_reports_parent_and_child_locks() {
    let env = Env::new();
    env.acquire_json(&["/docs", "--shared", "-r"]);
    env.acquire_json(&["/docs/a/file.txt", "--shared"]);

    let output = env
        .cmd()
        .args(["--format", "json", "query", "/docs/a", "--recursive"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["reference_locks"].as_array().unwrap().len(), 0);
    assert_eq!(status["parent_locks"].as_array().unwrap().len(), 1);
    assert_eq!(status["child_locks"].as_array().unwrap().len(), 1);
}

#[test]
fn test_check_write_access_with_token() {
    let env = Env::new();
    let lock = env.acquire_json(&["/docs", "-r"]);
    let token = lock["state_token"].as_str().unwrap();

    env.cmd()
        .args(["check", "/docs/x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("is locked"));

    env.cmd()
        .args(["check", "/docs/x", "--token", token])
        .assert()
        .success()
        .stdout(predicate::str::contains("allowed"));
}

#[test]
fn test_release_under_and_purge() {
    let env = Env::new();
    env.acquire_json(&["/tree/a"]);
    env.acquire_json(&["/tree/b/c"]);
    env.acquire_json(&["/other"]);

    env.cmd()
        .args(["release-under", "/tree"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Released 2 lock(s)"));

    env.cmd()
        .arg("purge")
        .assert()
        .success()
        .stdout(predicate::str::contains("Purged 0 expired lock(s)"));

    env.cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("/other"))
        .stdout(predicate::str::contains("/tree").not());
}

#[test]
fn test_invalid_path_is_rejected() {
    let env = Env::new();
    env.cmd()
        .args(["acquire", "/a/../b"])
        .assert()
        .failure();
}

#[test]
fn test_sqlite_backend_persists_between_runs() {
    let env = Env::new();
    let db = env.dir.path().join("locks.db");

    env.bare()
        .arg("--db")
        .arg(&db)
        .args(["--backend", "sqlite", "acquire", "/persisted", "-q"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("urn:uuid:"));

    env.bare()
        .arg("--db")
        .arg(&db)
        .args(["--backend", "sqlite", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/persisted"));
}

#[test]
fn test_config_set_get_and_reset() {
    let env = Env::new();

    env.bare()
        .args(["config", "set", "locks.max_timeout_secs", "600"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set locks.max_timeout_secs = 600"));

    env.bare()
        .args(["config", "get", "locks.max_timeout_secs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("600"));

    env.bare()
        .args(["config", "set", "locks.rounding", "weekly"])
        .assert()
        .failure();

    env.bare().args(["config", "reset"]).assert().success();

    env.bare()
        .args(["config", "get", "locks.max_timeout_secs"])
        .assert()
        .success()
        .stdout(predicate::str::diff("0\n"));
}

#[test]
fn test_config_max_timeout_clamps_grants() {
    let env = Env::new();
    env.bare()
        .args(["config", "set", "locks.max_timeout_secs", "30"])
        .assert()
        .success();

    let lock = env.acquire_json(&["/clamped", "--timeout", "infinite"]);
    assert_eq!(lock["timeout"], "30s");
}

#[test]
fn test_doctor_reports_lock_file() {
    let env = Env::new();
    env.acquire_json(&["/a"]);

    env.cmd()
        .arg("doctor")
        .assert()
        .success()
        .stdout(predicate::str::contains("[OK] Lock file"))
        .stdout(predicate::str::contains("Live locks: 1"));
}
