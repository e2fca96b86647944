//! CLI flag tests for the hostpulse-agent binary (spec section 6 "CLI
//! surface"), exercised the way the teacher's own `assert_cmd`-based tests
//! drive its binary.

use assert_cmd::Command;

#[test]
fn version_flag_prints_and_exits_cleanly() {
    let mut cmd = Command::cargo_bin("hostpulse-agent").expect("binary exists");
    let assert = cmd.arg("--version").assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    assert!(stdout.contains("hostpulse-agent"));
}

#[test]
fn health_subcommand_reports_failure_when_nothing_is_listening() {
    let mut cmd = Command::cargo_bin("hostpulse-agent").expect("binary exists");
    cmd.arg("health").env("LISTEN", ":1").assert().failure();
}
