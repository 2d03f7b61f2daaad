use predicates::prelude::*;

use crate::harness::{demo, fleet_cmd};

#[test]
fn no_args_shows_help() {
    fleet_cmd().assert().failure().code(2).stderr(predicate::str::contains("Usage"));
}

#[test]
fn version_flag() {
    fleet_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn help_flag() {
    fleet_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("up"))
        .stdout(predicate::str::contains("step-down"));
}

#[test]
fn unknown_subcommand() {
    fleet_cmd().arg("bogus").assert().failure().code(2);
}

#[test]
fn unknown_flag() {
    fleet_cmd().args(["status", "--bogus"]).assert().failure().code(2);
}

#[test]
fn status_requires_host() {
    fleet_cmd().arg("status").assert().failure().code(2).stderr(predicate::str::contains("--host"));
}

#[test]
fn validate_demo_topologies() {
    fleet_cmd()
        .args(["validate", "-f"])
        .arg(demo("basic.hcl"))
        .assert()
        .success()
        .stdout(predicate::str::contains("rs0"))
        .stdout(predicate::str::contains("replica_set"));

    fleet_cmd()
        .args(["validate", "-f"])
        .arg(demo("sharded.hcl"))
        .assert()
        .success()
        .stdout(predicate::str::contains("c0"))
        .stdout(predicate::str::contains("sharded_cluster"));
}

#[test]
fn validate_json_output() {
    let output = fleet_cmd()
        .args(["--json", "validate", "-f"])
        .arg(demo("basic.hcl"))
        .output()
        .unwrap();
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rs0 = &parsed[0];
    assert_eq!(rs0["name"], "rs0");
    assert_eq!(rs0["members"], 3);
    assert_eq!(rs0["majority"], 2);
}

#[test]
fn validate_rejects_bad_topology() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.hcl");
    std::fs::write(&path, "replica_set \"rs0\" {\n  members = []\n}\n").unwrap();

    fleet_cmd()
        .args(["validate", "-f"])
        .arg(&path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid topology"));
}

#[test]
fn validate_missing_file_is_io_error() {
    fleet_cmd()
        .args(["validate", "-f", "/nonexistent/fleet.hcl"])
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("could not read"));
}

#[test]
fn up_unknown_name_is_usage_error() {
    fleet_cmd()
        .args(["up", "nope", "-f"])
        .arg(demo("basic.hcl"))
        .assert()
        .failure()
        .code(64)
        .stderr(predicate::str::contains("known: rs0"));
}

#[test]
fn status_unreachable_host() {
    fleet_cmd()
        .args(["status", "--host", "127.0.0.1:1"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unreachable"));
}

#[test]
fn step_down_bad_host() {
    fleet_cmd()
        .args(["step-down", "--host", "localhost"])
        .assert()
        .failure()
        .code(64);
}
