//! End-to-end tests for the rr binary

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn rr(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("rr").expect("rr binary");
    cmd.current_dir(dir)
        .env("HOME", dir)
        .env("XDG_DATA_HOME", dir.join("data"))
        .env("XDG_CONFIG_HOME", dir.join("config"))
        .env("NO_COLOR", "1")
        .arg("--store")
        .arg(dir.join("records.db"));
    cmd
}

/// Run a create command and return the id printed last
fn created_id(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    let text = String::from_utf8(output).expect("utf8 stdout");
    text.split_whitespace().last().expect("printed id").to_string()
}

#[test]
fn test_help() {
    let dir = TempDir::new().unwrap();
    rr(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("client"))
        .stdout(predicate::str::contains("watch"));
}

#[test]
fn test_client_add_and_list() {
    let dir = TempDir::new().unwrap();
    rr(dir.path())
        .args(["client", "add", "Acme", "--type", "business", "-e", "ops@acme.test"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created client"));

    rr(dir.path())
        .args(["client", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Acme"))
        .stdout(predicate::str::contains("business"));

    rr(dir.path())
        .args(["client", "list", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"email\": \"ops@acme.test\""));
}

#[test]
fn test_job_lifecycle() {
    let dir = TempDir::new().unwrap();
    let client_id = created_id(rr(dir.path()).args(["client", "add", "Acme"]));
    let job_id = created_id(rr(dir.path()).args(["job", "add", "--client", &client_id, "Fix sink"]));
    rr(dir.path())
        .args(["task", "add", "-j", &job_id, "Shut off water"])
        .assert()
        .success();

    rr(dir.path())
        .args(["job", "show", &job_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Fix sink"))
        .stdout(predicate::str::contains("Client: Acme"))
        .stdout(predicate::str::contains("Shut off water"));

    rr(dir.path()).args(["job", "discard", &job_id]).assert().success();
    rr(dir.path())
        .args(["job", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No jobs found"));
    rr(dir.path())
        .args(["job", "list", "--discarded"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(discarded)"));
}

#[test]
fn test_job_for_unknown_client_fails() {
    let dir = TempDir::new().unwrap();
    rr(dir.path())
        .args(["job", "add", "--client", "00000000-0000-4000-8000-000000000000", "Fix sink"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Couldn't find clients"));
}

#[test]
fn test_empty_update_fails() {
    let dir = TempDir::new().unwrap();
    let client_id = created_id(rr(dir.path()).args(["client", "add", "Acme"]));
    let job_id = created_id(rr(dir.path()).args(["job", "add", "--client", &client_id, "Fix sink"]));

    rr(dir.path())
        .args(["job", "update", &job_id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Update data is required"));
}

#[test]
fn test_watch_reaches_ready() {
    let dir = TempDir::new().unwrap();
    rr(dir.path()).args(["client", "add", "Acme"]).assert().success();
    rr(dir.path())
        .args(["watch", "jobs", "--seconds", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("initializing"))
        .stdout(predicate::str::contains("ready (empty)"));
}
