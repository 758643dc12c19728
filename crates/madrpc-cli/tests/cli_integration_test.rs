//! CLI Integration Tests
//!
//! Runs the built `madrpc` binary end to end and checks its JSON report.

use std::process::Command;

fn madrpc() -> Command {
    Command::new(env!("CARGO_BIN_EXE_madrpc"))
}

#[test]
fn test_simulate_prints_json_report() {
    let output = madrpc()
        .args([
            "simulate",
            "--businesses",
            "2",
            "--providers",
            "2",
            "--requests",
            "10",
            "--threads",
            "2",
            "--silent-rate",
            "0",
        ])
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run madrpc");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["metrics"]["total_calls"], 10);
    assert!(report["metrics"]["bizs"]["biz-1"].is_object());
}

#[test]
fn test_simulate_rejects_invalid_flow_config() {
    let output = madrpc()
        .args([
            "simulate",
            "--requests",
            "1",
            "--flow-config",
            r#"{"retry_trigger_percent": 250}"#,
        ])
        .output()
        .expect("failed to run madrpc");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("retry_trigger_percent"));
}

#[test]
fn test_unknown_subcommand_fails() {
    let output = madrpc().arg("serve").output().expect("failed to run madrpc");
    assert!(!output.status.success());
}
