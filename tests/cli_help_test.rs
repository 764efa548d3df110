// CLI surface checks against the built binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("patchkeeper").unwrap();

    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("patch"))
        .stdout(predicate::str::contains("rollback"))
        .stdout(predicate::str::contains("monitor"));
}

#[test]
fn test_patch_help_shows_flags() {
    let mut cmd = Command::cargo_bin("patchkeeper").unwrap();

    cmd.args(["patch", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--skip-validation"))
        .stdout(predicate::str::contains("--no-review"))
        .stdout(predicate::str::contains("--ticket"));
}

#[test]
fn test_rollback_rejects_unknown_target() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("patchkeeper").unwrap();

    cmd.current_dir(dir.path())
        .args(["rollback", "yesterday"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown rollback target"));
}

#[test]
fn test_config_prints_defaults_as_toml() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("patchkeeper").unwrap();

    cmd.current_dir(dir.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[safety]"))
        .stdout(predicate::str::contains("commit_prefix = \"patchkeeper:\""));
}
