use crate::error::{BoxError, ProcessErrorDetails};
use std::cell::RefCell;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const DOCKER_PROGRAM_ENV: &str = "AGENTBOX_DOCKER";

/// `docker run`/`docker exec` reserve this status for failures of the runtime itself.
const RUNTIME_FAILURE_STATUS: i32 = 125;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    fn empty_success() -> Self {
        Self {
            status_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }
}

pub trait DockerRunner {
    fn run(&self, args: &[String], capture_output: bool) -> Result<CommandOutput, io::Error>;
}

pub struct RealDockerRunner {
    program: PathBuf,
}

impl RealDockerRunner {
    pub fn detect() -> Self {
        if let Ok(program) = env::var(DOCKER_PROGRAM_ENV) {
            if !program.trim().is_empty() {
                return Self {
                    program: PathBuf::from(program),
                };
            }
        }
        let program = which::which("docker").unwrap_or_else(|_| PathBuf::from("docker"));
        Self { program }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl DockerRunner for RealDockerRunner {
    fn run(&self, args: &[String], capture_output: bool) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        if capture_output {
            let output = cmd.output()?;
            let status_code =
                output
                    .status
                    .code()
                    .unwrap_or(if output.status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            let status = cmd.status()?;
            let status_code = status
                .code()
                .unwrap_or(if status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }
}

/// Thin facade over a [`DockerRunner`] that separates read-only probes from
/// mutations, so `--dry-run` can still observe state while only planning changes.
pub struct Docker<'a, R: DockerRunner> {
    runner: &'a R,
    dry_run: bool,
    planned: RefCell<Vec<String>>,
}

impl<'a, R: DockerRunner> Docker<'a, R> {
    pub fn new(runner: &'a R, dry_run: bool) -> Self {
        Self {
            runner,
            dry_run,
            planned: RefCell::new(Vec::new()),
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Commands that were skipped because of dry-run mode, in call order.
    pub fn planned(&self) -> Vec<String> {
        self.planned.borrow().clone()
    }

    /// Read-only probe. A non-zero exit is handed back to the caller to interpret.
    pub fn query(&self, args: &[String]) -> Result<CommandOutput, BoxError> {
        let command = render_docker_command(args);
        tracing::debug!(%command, "docker query");
        self.runner
            .run(args, true)
            .map_err(|err| spawn_error(&err, &command))
    }

    /// Mutating call with captured output; a non-zero exit is a classified error.
    pub fn mutate(&self, args: &[String]) -> Result<CommandOutput, BoxError> {
        let command = render_docker_command(args);
        if self.record_if_dry_run(&command) {
            return Ok(CommandOutput::empty_success());
        }
        tracing::debug!(%command, "docker");
        let output = self
            .runner
            .run(args, true)
            .map_err(|err| spawn_error(&err, &command))?;
        if !output.success() {
            return Err(command_failure(&command, output.status_code, &output.stderr_text()));
        }
        Ok(output)
    }

    /// Mutating call attached to the caller's terminal (progress output of
    /// `pull`/`build`); any non-zero exit is an error.
    pub fn stream(&self, args: &[String]) -> Result<(), BoxError> {
        let status = self.attach(args)?;
        if status != 0 {
            let command = render_docker_command(args);
            return Err(command_failure(&command, status, ""));
        }
        Ok(())
    }

    /// Interactive call attached to the caller's terminal. The exit status of
    /// the command inside the container is returned; only the runtime's own
    /// failure status is treated as an error.
    pub fn attach(&self, args: &[String]) -> Result<i32, BoxError> {
        let command = render_docker_command(args);
        if self.record_if_dry_run(&command) {
            return Ok(0);
        }
        tracing::debug!(%command, "docker (attached)");
        let output = self
            .runner
            .run(args, false)
            .map_err(|err| spawn_error(&err, &command))?;
        if output.status_code == RUNTIME_FAILURE_STATUS {
            return Err(command_failure(&command, output.status_code, &output.stderr_text()));
        }
        Ok(output.status_code)
    }

    fn record_if_dry_run(&self, command: &str) -> bool {
        if self.dry_run {
            self.planned.borrow_mut().push(command.to_string());
        }
        self.dry_run
    }
}

pub fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

pub fn render_docker_command(args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push("docker".to_string());
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

fn spawn_error(err: &io::Error, command: &str) -> BoxError {
    let details = if err.kind() == io::ErrorKind::NotFound {
        ProcessErrorDetails {
            error_code: "docker_not_found".to_string(),
            hint: Some(format!(
                "Install Docker and ensure `docker` is on your PATH (or point {DOCKER_PROGRAM_ENV} at a compatible runtime)."
            )),
            command: Some(command.to_string()),
            raw_stderr: None,
        }
    } else {
        ProcessErrorDetails {
            error_code: "process_command_failed".to_string(),
            hint: None,
            command: Some(command.to_string()),
            raw_stderr: None,
        }
    };
    BoxError::ProcessDetailed {
        message: format!("failed to run command `{command}`: {err}"),
        details,
    }
}

/// Classified error for a query whose non-zero exit the caller cannot interpret.
pub fn query_failure(args: &[String], output: &CommandOutput) -> BoxError {
    command_failure(
        &render_docker_command(args),
        output.status_code,
        &output.stderr_text(),
    )
}

fn command_failure(command: &str, status_code: i32, stderr: &str) -> BoxError {
    let (error_code, hint) = classify_docker_command_failure(stderr);
    let mut message = format!("command failed with status {status_code} while running `{command}`");
    if !stderr.is_empty() {
        message = format!("{message}: {stderr}");
    }
    if let Some(ref hint_message) = hint {
        message = format!("{message}\nHint: {hint_message}");
    }
    BoxError::ProcessDetailed {
        message,
        details: ProcessErrorDetails {
            error_code,
            hint,
            command: Some(command.to_string()),
            raw_stderr: if stderr.is_empty() {
                None
            } else {
                Some(stderr.to_string())
            },
        },
    }
}

pub fn classify_docker_command_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("failed to connect to the docker api")
        || lower.contains("error during connect")
    {
        return (
            "docker_daemon_unreachable".to_string(),
            Some(
                "Docker daemon is unreachable. Start Docker Desktop (or dockerd) and retry."
                    .to_string(),
            ),
        );
    }

    if lower.contains("is already in use by container") || lower.contains("conflict. the container name") {
        return (
            "container_name_conflict".to_string(),
            Some(
                "Another invocation created this container concurrently. Re-run agentbox to attach to it, or pass --recreate."
                    .to_string(),
            ),
        );
    }

    if lower.contains("no such container") {
        return (
            "container_missing".to_string(),
            Some("The container disappeared; re-run agentbox to create it again.".to_string()),
        );
    }

    if lower.contains("manifest unknown")
        || lower.contains("not found: manifest")
        || lower.contains("no such image")
        || lower.contains("pull access denied")
    {
        return (
            "image_not_found".to_string(),
            Some("Build the image locally with `agentbox --build`.".to_string()),
        );
    }

    if lower.contains("denied")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
    {
        return (
            "docker_registry_auth".to_string(),
            Some("Authenticate with `docker login <registry>` and retry.".to_string()),
        );
    }

    ("process_command_failed".to_string(), None)
}


#[cfg(test)]
mod tests {
    use super::testing::MockDockerRunner;
    use super::*;

    #[test]
    fn render_quotes_whitespace_arguments() {
        let rendered = render_docker_command(&args(["exec", "box", "sh", "-c", "echo hi"]));
        assert_eq!(rendered, "docker exec box sh -c \"echo hi\"");
    }

    #[test]
    fn dry_run_records_mutations_but_runs_queries() {
        let runner = MockDockerRunner::default();
        let docker = Docker::new(&runner, true);

        docker.query(&args(["container", "inspect", "box"])).unwrap();
        docker.mutate(&args(["container", "rm", "box"])).unwrap();
        let status = docker.attach(&args(["exec", "-it", "box", "zsh"])).unwrap();

        assert_eq!(status, 0);
        assert_eq!(runner.calls().len(), 1);
        assert_eq!(
            docker.planned(),
            vec!["docker container rm box", "docker exec -it box zsh"]
        );
    }

    #[test]
    fn mutate_failure_is_classified() {
        let runner = MockDockerRunner::default();
        runner.push_err(
            125,
            "Error response from daemon: Conflict. The container name \"/agentbox-x\" is already in use by container \"abc\".",
        );
        let docker = Docker::new(&runner, false);

        let err = docker
            .mutate(&args(["container", "create", "--name", "agentbox-x", "img"]))
            .expect_err("conflict should fail");
        assert_eq!(err.error_code(), Some("container_name_conflict"));
        assert!(err.to_string().contains("Hint:"));
    }

    #[test]
    fn attach_returns_inner_exit_status() {
        let runner = MockDockerRunner::default();
        runner.push_err(3, "");
        let docker = Docker::new(&runner, false);
        assert_eq!(docker.attach(&args(["exec", "box", "false"])).unwrap(), 3);

        runner.push_err(125, "");
        assert!(docker.attach(&args(["exec", "box", "false"])).is_err());
        assert!(!runner.calls()[0].capture_output);
    }

    #[test]
    fn classify_daemon_unreachable() {
        let (code, hint) = classify_docker_command_failure(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
        );
        assert_eq!(code, "docker_daemon_unreachable");
        assert!(hint.is_some());
    }

    #[test]
    fn classify_unknown_failure_has_no_hint() {
        let (code, hint) = classify_docker_command_failure("something odd");
        assert_eq!(code, "process_command_failed");
        assert!(hint.is_none());
    }
}
