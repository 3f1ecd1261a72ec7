#![cfg(unix)]

use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("agentbox");
    Command::new(path)
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

/// Stand-in runtime: logs every invocation and answers the probes the
/// orchestrator makes. No container exists and the image is present.
const FAKE_DOCKER: &str = r#"#!/bin/sh
echo "$*" >> "$FAKE_DOCKER_LOG"
case "$1 $2" in
  "container inspect")
    echo "Error: No such container: $3" >&2
    exit 1
    ;;
  "image inspect")
    echo '[{}]'
    exit 0
    ;;
  "info --format")
    echo x86_64
    exit 0
    ;;
esac
exit 0
"#;

struct Sandbox {
    _dir: TempDir,
    home: PathBuf,
    workspace: PathBuf,
    docker: PathBuf,
    log: PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let home = dir.path().join("home");
        let workspace = dir.path().join("code/proj");
        fs::create_dir_all(&home).unwrap();
        fs::create_dir_all(&workspace).unwrap();
        let docker = dir.path().join("fake-docker");
        fs::write(&docker, FAKE_DOCKER).unwrap();
        fs::set_permissions(&docker, fs::Permissions::from_mode(0o755)).unwrap();
        let log = dir.path().join("docker.log");
        Self {
            home,
            workspace,
            docker,
            log,
            _dir: dir,
        }
    }

    fn cmd(&self) -> Command {
        let mut cmd = bin();
        cmd.env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("HOME", &self.home)
            .env("USER", "tester")
            .env("AGENTBOX_CONFIG_DIR", self.home.join(".config/agentbox"))
            .env("AGENTBOX_DOCKER", &self.docker)
            .env("FAKE_DOCKER_LOG", &self.log);
        cmd
    }

    fn docker_calls(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

#[test]
fn missing_workspace_fails_before_touching_the_runtime() {
    let sandbox = Sandbox::new();
    let missing = sandbox.workspace.join("does-not-exist");

    sandbox
        .cmd()
        .args(["-w", &path_arg(&missing), "--dry-run"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("workspace directory does not exist"));

    assert!(sandbox.docker_calls().is_empty());
}

#[test]
fn conflicting_config_modes_are_rejected() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["-w", &path_arg(&sandbox.workspace)])
        .args(["--selective-config", "--full-config"])
        .assert()
        .failure()
        .stderr(contains("--full-config"));

    assert!(sandbox.docker_calls().is_empty());
}

#[test]
fn package_requires_a_build() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["-w", &path_arg(&sandbox.workspace), "--package", "htop"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("--package"));

    assert!(sandbox.docker_calls().is_empty());
}

#[test]
fn completions_are_generated() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["--completions", "bash"])
        .assert()
        .success()
        .stdout(contains("agentbox"))
        .stdout(contains("--force-rebuild"));
}

#[test]
fn export_dockerfile_writes_the_build_description() {
    let sandbox = Sandbox::new();
    let out = sandbox.home.join("Dockerfile.agentbox");

    sandbox
        .cmd()
        .args(["-w", &path_arg(&sandbox.workspace)])
        .args(["--export-dockerfile", &path_arg(&out)])
        .assert()
        .success();

    let dockerfile = fs::read_to_string(&out).unwrap();
    assert!(dockerfile.contains("FROM debian:bookworm-slim AS base"));
    assert!(dockerfile.contains("nvim-linux-x86_64.tar.gz"));
    assert!(sandbox.docker_calls().iter().all(|call| call.starts_with("info")));
}

#[test]
fn dry_run_plans_container_creation() {
    let sandbox = Sandbox::new();

    sandbox
        .cmd()
        .args(["-w", &path_arg(&sandbox.workspace), "--dry-run", "--no-interactive"])
        .assert()
        .success()
        .stdout(contains("docker container create"))
        .stdout(contains("agentbox.managed=true"))
        .stdout(contains("docker exec"));

    let calls = sandbox.docker_calls();
    assert!(calls.iter().any(|call| call.starts_with("container inspect agentbox-code-proj-")));
    assert!(!calls.iter().any(|call| call.starts_with("container create")));
}

#[test]
fn dry_run_json_reports_the_plan() {
    let sandbox = Sandbox::new();

    let output = sandbox
        .cmd()
        .args(["-w", &path_arg(&sandbox.workspace)])
        .args(["--dry-run", "--no-interactive", "--json", "--ephemeral"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let payload = parse_json(&output.stdout);
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["result"]["image"], "present");
    assert_eq!(payload["result"]["launch"]["transition"], "created");
    let planned: Vec<&str> = payload["result"]["planned"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(planned[0].starts_with("docker container create"));
    assert!(planned[0].contains(" --rm "));
    assert!(planned.iter().any(|cmd| cmd.starts_with("docker container stop")));
}

#[test]
fn json_errors_carry_the_message() {
    let sandbox = Sandbox::new();

    let output = sandbox
        .cmd()
        .args(["-w", "/definitely/not/here", "--json"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let payload = parse_json(&output.stdout);
    assert_eq!(payload["ok"], false);
    assert!(payload["error"]
        .as_str()
        .unwrap()
        .contains("workspace directory does not exist"));
}

#[test]
fn force_remove_all_without_terminal_is_a_noop() {
    let sandbox = Sandbox::new();
    let docker = sandbox.docker.clone();
    fs::write(
        &docker,
        FAKE_DOCKER.replace("esac", "  \"ps -a\")\n    echo agentbox-one\n    exit 0\n    ;;\nesac"),
    )
    .unwrap();

    sandbox
        .cmd()
        .args(["-w", &path_arg(&sandbox.workspace), "--force-remove-all"])
        .assert()
        .success()
        .stdout(contains("Nothing removed"));

    assert!(!sandbox.docker_calls().iter().any(|call| call.contains(" rm ")));
}
