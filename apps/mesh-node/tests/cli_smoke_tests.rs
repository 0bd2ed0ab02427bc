#![allow(clippy::unwrap_used, clippy::expect_used)]

//! CLI smoke tests for the mesh-node binary.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

fn run_mesh_node(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_mesh-node"))
        .args(args)
        .env_remove("RUST_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("Failed to execute mesh-node")
}

fn write_config(dir: &TempDir, name: &str, contents: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).expect("Failed to write config file");
    path.to_str().unwrap().to_owned()
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[test]
fn test_cli_help_command() {
    let output = run_mesh_node(&["--help"]);
    assert!(output.status.success(), "Help command should succeed");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("mesh-node"), "Should contain binary name");
    assert!(stdout.contains("Usage:"), "Should contain usage information");
    for subcommand in ["serve", "list", "call", "check"] {
        assert!(stdout.contains(subcommand), "Should mention '{subcommand}'");
    }
    assert!(stdout.contains("--config"), "Should mention config option");
}

#[test]
fn test_cli_version_command() {
    let output = run_mesh_node(&["--version"]);
    assert!(output.status.success(), "Version command should succeed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("mesh-node"));
    assert!(stdout.chars().any(|c| c.is_ascii_digit()));
}

#[test]
fn test_cli_invalid_command() {
    let output = run_mesh_node(&["invalid-command"]);
    assert!(!output.status.success(), "Invalid command should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error"), "Should report the bad subcommand: {stderr}");
}

#[test]
fn test_cli_missing_config_file() {
    let output = run_mesh_node(&["--config", "/nonexistent/mesh.yaml", "check"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"), "{stderr}");
}

#[test]
fn test_cli_check_valid_config() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        "node.yaml",
        r"
service:
  name: orders
server:
  port: 9001
pool:
  watch: [billing]
logging:
  level: warn
",
    );

    let output = run_mesh_node(&["--config", &config, "check"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "Should succeed with valid config: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout.contains("Configuration is valid"));
    assert!(stdout.contains("orders"));
    assert!(stdout.contains("billing"));
}

#[test]
fn test_cli_check_rejects_invalid_yaml() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "bad.yaml", "service: [unclosed");
    let output = run_mesh_node(&["--config", &config, "check"]);
    assert!(!output.status.success(), "Should fail with invalid YAML");
}

#[test]
fn test_cli_check_rejects_unset_placeholder() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "env.yaml", "service:\n  name: ${MESH_SMOKE_UNSET}\n");
    let output = Command::new(env!("CARGO_BIN_EXE_mesh-node"))
        .args(["--config", &config, "check"])
        .env_remove("MESH_SMOKE_UNSET")
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("MESH_SMOKE_UNSET"), "{stderr}");
}

#[test]
fn test_cli_print_config_is_yaml_with_overrides() {
    let output = Command::new(env!("CARGO_BIN_EXE_mesh-node"))
        .args(["--print-config", "--port", "7100", "-vv"])
        .env("MESH__SERVICE__NAME", "from-env")
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let yaml = stdout
        .strip_prefix("Effective configuration:\n")
        .expect("header line");
    let parsed: serde_json::Value = serde_saphyr::from_str(yaml).unwrap();
    assert_eq!(parsed["service"]["name"], "from-env");
    assert_eq!(parsed["server"]["port"], 7100);
    assert_eq!(parsed["logging"]["level"], "debug");
}

#[tokio::test]
async fn test_cli_serve_fails_without_registry() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        "serve.yaml",
        &format!(
            r#"
server:
  port: {port}
registry:
  endpoints: ["http://127.0.0.1:1"]
  dial_timeout_ms: 300
  request_timeout_ms: 300
logging:
  level: error
"#,
            port = free_port()
        ),
    );
    assert!(Path::new(&config).is_file());

    let child = tokio::process::Command::new(env!("CARGO_BIN_EXE_mesh-node"))
        .args(["--config", &config, "serve"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let output = timeout(Duration::from_secs(30), child.wait_with_output())
        .await
        .expect("serve should give up when the registry is unreachable")
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("regist"), "{stderr}");
}
