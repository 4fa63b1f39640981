use assert_cmd::Command;
use predicates::str::contains;
use std::path::Path;

fn helix(state_dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("helix-approvals"));
    cmd.env("HELIX_DIR", state_dir)
        .env("NO_COLOR", "1")
        .env_remove("HELIX_CONFIG")
        .env_remove("HELIX_GATEWAY_TOKEN")
        .env_remove("RUST_LOG");
    cmd
}

fn write_policy(state_dir: &Path, json: &str) {
    std::fs::write(state_dir.join("exec-approvals.json"), json).unwrap();
}

#[test]
fn test_cli_help() {
    let dir = tempfile::tempdir().unwrap();
    helix(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Helix exec approvals"));
}

#[test]
fn test_cli_version() {
    let dir = tempfile::tempdir().unwrap();
    helix(dir.path()).arg("--version").assert().success();
}

#[test]
fn test_check_deny_dominates_allow() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(
        dir.path(),
        r#"{"globalDeny": ["rm -rf *"], "globalAllow": ["rm *", "git *"]}"#,
    );

    helix(dir.path())
        .args(["check", "rm", "-rf", "/tmp/x"])
        .assert()
        .success()
        .stdout(contains("denied"))
        .stdout(contains("rm -rf *"));

    helix(dir.path())
        .args(["check", "git", "status"])
        .assert()
        .success()
        .stdout(contains("approved"));
}

#[test]
fn test_check_json_reports_requires_approval() {
    let dir = tempfile::tempdir().unwrap();
    helix(dir.path())
        .args(["check", "--format", "json", "--agent", "main", "cargo", "build"])
        .assert()
        .success()
        .stdout(contains("\"requires_approval\""))
        .stdout(contains("\"agentId\": \"main\""));
}

#[test]
fn test_policy_allow_then_show() {
    let dir = tempfile::tempdir().unwrap();

    helix(dir.path())
        .args(["policy", "allow", "npm *", "--agent", "main"])
        .assert()
        .success()
        .stdout(contains("Added"));

    helix(dir.path())
        .args(["policy", "allow", "npm *", "--agent", "main"])
        .assert()
        .success()
        .stdout(contains("already"));

    helix(dir.path())
        .args(["policy", "show"])
        .assert()
        .success()
        .stdout(contains("\"perAgent\""))
        .stdout(contains("npm *"));
}

#[test]
fn test_policy_validate_fails_on_invalid_pattern() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), r#"{"globalAllow": ["git *", ""]}"#);

    helix(dir.path())
        .args(["policy", "validate"])
        .assert()
        .failure()
        .stdout(contains("INVALID"));
}

#[test]
fn test_policy_validate_clean_document() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), r#"{"globalAllow": ["git *"]}"#);

    helix(dir.path())
        .args(["policy", "validate"])
        .assert()
        .success()
        .stdout(contains("All patterns compile"));
}

#[test]
fn test_missing_explicit_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    helix(dir.path())
        .args(["--config"])
        .arg(dir.path().join("missing.toml"))
        .args(["policy", "show"])
        .assert()
        .failure()
        .stderr(contains("Config file not found"));
}

#[test]
fn test_unreadable_policy_fails() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), "{ not json");

    helix(dir.path())
        .args(["check", "ls"])
        .assert()
        .failure()
        .stderr(contains("Failed to load policy document"));
}
