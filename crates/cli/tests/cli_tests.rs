//! CLI integration tests

use std::process::Command;

fn arctl(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_arctl"))
        .args(args)
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = arctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("AutoRange"), "Should show app name");
    assert!(stdout.contains("watchers"), "Should show watchers command");
    assert!(stdout.contains("health"), "Should show health command");
    assert!(stdout.contains("--api-url"), "Should show api-url option");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = arctl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("arctl"), "Should show binary name");
}

#[test]
fn test_watchers_help() {
    let output = arctl(&["watchers", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    for command in ["list", "show", "pause", "resume"] {
        assert!(stdout.contains(command), "Should show {} command", command);
    }
}

#[test]
fn test_show_requires_id() {
    let output = arctl(&["watchers", "show"]);

    assert!(!output.status.success(), "Missing workload ID should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("<ID>"));
}

#[test]
fn test_invalid_format_rejected() {
    let output = arctl(&["--format", "yaml", "health"]);
    assert!(!output.status.success());
}

#[test]
fn test_unreachable_agent_fails() {
    let output = arctl(&["--api-url", "http://127.0.0.1:1", "health"]);
    assert!(!output.status.success());
}
