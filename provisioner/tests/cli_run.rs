//! CLI tests for `provisioner run` and `provisioner init-config`.
//!
//! Spawns the binary against a config pointing at the fake tool and checks
//! exit codes and streamed output.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use provisioner::exit_codes;
use provisioner::io::config::{OrchestratorConfig, load_config, write_config};
use provisioner::test_support::{FakeScript, FakeTool};

fn write_tool_config(tool: &FakeTool) -> PathBuf {
    let path = tool.state_dir().with_file_name("provisioner.toml");
    write_config(&path, &tool.config()).expect("write config");
    path
}

fn provisioner(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_provisioner"))
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("run provisioner")
}

#[test]
fn run_plan_streams_output_and_exits_ok() {
    let tool = FakeTool::new();
    let config = write_tool_config(&tool);

    let out = provisioner(
        &config,
        &["run", "plan", "--workspace", "dev", "--var", "replicas=2"],
    );

    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Plan: 1 to add"), "stdout: {stdout}");
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("==> succeeded"), "stderr: {stderr}");

    let tfvars = std::fs::read_to_string(tool.workspace_dir("dev").join("terraform.tfvars"))
        .expect("tfvars");
    assert_eq!(tfvars, "replicas = 2\n");
}

#[test]
fn failed_job_exits_with_failure_code() {
    let tool = FakeTool::with_script(
        FakeScript::default().apply("echo 'Error: quota exceeded' >&2\nexit 1"),
    );
    let config = write_tool_config(&tool);

    let out = provisioner(&config, &["run", "apply", "--workspace", "dev"]);

    assert_eq!(out.status.code(), Some(exit_codes::FAILED));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("quota exceeded"), "stderr: {stderr}");
    assert!(stderr.contains("exited with code 1"), "stderr: {stderr}");
}

#[test]
fn reserved_variable_is_rejected_before_running() {
    let tool = FakeTool::new();
    let config = write_tool_config(&tool);

    let out = provisioner(&config, &["run", "plan", "--workspace", "dev", "--var", "source=x"]);

    assert_eq!(out.status.code(), Some(exit_codes::FAILED));
    assert!(String::from_utf8_lossy(&out.stderr).contains("reserved"));
    assert!(tool.calls().is_empty());
}

#[test]
fn init_config_writes_defaults_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("provisioner.toml");

    let out = provisioner(&path, &["init-config"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert_eq!(load_config(&path).expect("load"), OrchestratorConfig::default());

    let again = provisioner(&path, &["init-config"]);
    assert_eq!(again.status.code(), Some(exit_codes::FAILED));
    let forced = provisioner(&path, &["init-config", "--force"]);
    assert_eq!(forced.status.code(), Some(exit_codes::OK));
}
