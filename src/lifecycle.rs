//! Container lifecycle controller.
//!
//! Every invocation rediscovers the container from the runtime; nothing is
//! cached locally. The container runs a keepalive main process and all work
//! happens through `docker exec` of the in-image exec wrapper.

use crate::build_context::{EXEC_WRAPPER_PATH, RUNTIME_DIR};
use crate::config::SessionConfig;
use crate::docker::{args, query_failure, Docker, DockerRunner};
use crate::error::BoxError;
use crate::mounts::RunParameters;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MANAGED_LABEL: &str = "agentbox.managed";
pub const WORKSPACE_LABEL: &str = "agentbox.workspace";
pub const CREATED_LABEL: &str = "agentbox.created";
pub const VERSION_LABEL: &str = "agentbox.version";
pub const USER_LABEL: &str = "agentbox.user";
pub const MANAGED_FILTER: &str = "label=agentbox.managed=true";
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");
const KEEPALIVE: [&str; 2] = ["sleep", "infinity"];
const SHM_SIZE: &str = "2g";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Missing,
    Stopped,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub state: ContainerState,
    pub auto_remove: bool,
    pub labels: BTreeMap<String, String>,
}

impl ContainerRecord {
    fn missing() -> Self {
        Self {
            state: ContainerState::Missing,
            auto_remove: false,
            labels: BTreeMap::new(),
        }
    }

    pub fn exists(&self) -> bool {
        self.state != ContainerState::Missing
    }
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "Config", default)]
    config: InspectConfig,
    #[serde(rename = "HostConfig", default)]
    host_config: InspectHostConfig,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectHostConfig {
    #[serde(rename = "AutoRemove", default)]
    auto_remove: bool,
}

fn is_missing_object(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

/// Current state of the named container; exactly one of the three states.
pub fn observe<R: DockerRunner>(docker: &Docker<'_, R>, name: &str) -> Result<ContainerRecord, BoxError> {
    let inspect = args(["container", "inspect", name]);
    let output = docker.query(&inspect)?;
    if !output.success() {
        if is_missing_object(&output.stderr_text()) {
            return Ok(ContainerRecord::missing());
        }
        return Err(query_failure(&inspect, &output));
    }
    let entries: Vec<InspectEntry> = serde_json::from_slice(&output.stdout)?;
    let Some(entry) = entries.into_iter().next() else {
        return Ok(ContainerRecord::missing());
    };
    let state = match entry.state.status.as_str() {
        "running" | "restarting" => ContainerState::Running,
        _ => ContainerState::Stopped,
    };
    Ok(ContainerRecord {
        state,
        auto_remove: entry.host_config.auto_remove,
        labels: entry.config.labels.unwrap_or_default(),
    })
}

pub fn create_args(session: &SessionConfig, params: &RunParameters, now: DateTime<Utc>) -> Vec<String> {
    let mut out = args(["container", "create", "--name", session.container_name.as_str()]);
    for (key, value) in [
        (MANAGED_LABEL, "true".to_string()),
        (WORKSPACE_LABEL, session.workspace.display().to_string()),
        (CREATED_LABEL, now.to_rfc3339_opts(SecondsFormat::Secs, true)),
        (VERSION_LABEL, TOOL_VERSION.to_string()),
        (USER_LABEL, session.identity.username.clone()),
    ] {
        out.push("--label".to_string());
        out.push(format!("{key}={value}"));
    }
    out.extend(args(["--network", "host"]));
    if session.privileged {
        out.push("--privileged".to_string());
    } else {
        out.extend(args([
            "--cap-add",
            "SYS_ADMIN",
            "--security-opt",
            "seccomp=unconfined",
            "--shm-size",
            SHM_SIZE,
        ]));
    }
    out.extend(args(["--tmpfs", RUNTIME_DIR]));
    if session.ephemeral {
        out.push("--rm".to_string());
    }
    out.push("-w".to_string());
    out.push(params.workdir.clone());
    out.extend(params.mount_args());
    out.extend(params.env_args());
    out.push(session.image.clone());
    out.extend(args(KEEPALIVE));
    out
}

pub fn exec_args(session: &SessionConfig, params: &RunParameters) -> Vec<String> {
    let mut out = vec!["exec".to_string()];
    if session.interactive {
        out.push("-it".to_string());
    }
    out.push("-w".to_string());
    out.push(params.workdir.clone());
    out.extend(params.env_args());
    out.push(session.container_name.clone());
    out.push(EXEC_WRAPPER_PATH.to_string());
    out.extend(session.command.iter().cloned());
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Created,
    Started,
    Reused,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchOutcome {
    pub container: String,
    pub transition: Transition,
    pub exit_code: i32,
}

pub struct Lifecycle<'d, 'a, R: DockerRunner> {
    docker: &'d Docker<'a, R>,
    session: &'d SessionConfig,
}

impl<'d, 'a, R: DockerRunner> Lifecycle<'d, 'a, R> {
    pub fn new(docker: &'d Docker<'a, R>, session: &'d SessionConfig) -> Self {
        Self { docker, session }
    }

    pub fn observe(&self) -> Result<ContainerRecord, BoxError> {
        observe(self.docker, &self.session.container_name)
    }

    /// Brings the container to `running` and runs the session command in it.
    pub fn launch(&self, params: &RunParameters, recreate: bool) -> Result<LaunchOutcome, BoxError> {
        let name = self.session.container_name.as_str();
        let mut record = self.observe()?;
        tracing::debug!(container = name, state = ?record.state, "observed container");

        if record.exists() && self.session.ephemeral && !record.auto_remove && !recreate {
            return Err(BoxError::Config(format!(
                "container {name} already exists as a persistent session; drop --ephemeral, pass --recreate, or choose another --name"
            )));
        }
        if record.exists() {
            self.warn_on_version_skew(&record);
        }
        if recreate && record.exists() {
            self.recreate()?;
            record = ContainerRecord::missing();
        }

        let transition = match record.state {
            ContainerState::Missing => {
                self.docker
                    .mutate(&create_args(self.session, params, Utc::now()))?;
                self.start()?;
                tracing::info!(container = name, "created session container");
                Transition::Created
            }
            ContainerState::Stopped => {
                self.start()?;
                tracing::info!(container = name, "started session container");
                Transition::Started
            }
            ContainerState::Running => Transition::Reused,
        };

        let attached = self.docker.attach(&exec_args(self.session, params));
        // Stop even when the exec itself failed, so --rm can remove the container.
        if self.session.ephemeral {
            if let Err(err) = self.docker.mutate(&args(["container", "stop", name])) {
                tracing::debug!(container = name, %err, "stopping ephemeral container failed");
            }
        }
        let exit_code = attached?;
        Ok(LaunchOutcome {
            container: name.to_string(),
            transition,
            exit_code,
        })
    }

    fn start(&self) -> Result<(), BoxError> {
        self.docker.mutate(&args([
            "container",
            "start",
            self.session.container_name.as_str(),
        ]))?;
        Ok(())
    }

    fn recreate(&self) -> Result<(), BoxError> {
        let name = self.session.container_name.as_str();
        if let Err(err) = self.docker.mutate(&args(["container", "stop", name])) {
            tracing::debug!(container = name, %err, "stop before recreate failed");
        }
        self.docker.mutate(&args(["container", "rm", name]))?;
        tracing::info!(container = name, "removed container for recreate");
        Ok(())
    }

    fn warn_on_version_skew(&self, record: &ContainerRecord) {
        match record.labels.get(VERSION_LABEL) {
            Some(version) if version == TOOL_VERSION => {}
            Some(version) => tracing::warn!(
                container = %self.session.container_name,
                container_version = %version,
                current = TOOL_VERSION,
                "container was created by a different agentbox version; pass --recreate to refresh it"
            ),
            None => tracing::warn!(
                container = %self.session.container_name,
                "container has no agentbox version label"
            ),
        }
    }
}

/// Names of managed containers, optionally restricted to the given statuses.
pub fn managed_containers<R: DockerRunner>(
    docker: &Docker<'_, R>,
    statuses: &[&str],
) -> Result<Vec<String>, BoxError> {
    let mut ps = args(["ps", "-a", "--filter", MANAGED_FILTER]);
    for status in statuses {
        ps.push("--filter".to_string());
        ps.push(format!("status={status}"));
    }
    ps.extend(args(["--format", "{{.Names}}"]));
    let output = docker.query(&ps)?;
    if !output.success() {
        return Err(query_failure(&ps, &output));
    }
    Ok(output
        .stdout_text()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn remove_stopped<R: DockerRunner>(docker: &Docker<'_, R>) -> Result<Vec<String>, BoxError> {
    let names = managed_containers(docker, &["exited", "created"])?;
    for name in &names {
        docker.mutate(&args(["container", "rm", name.as_str()]))?;
    }
    Ok(names)
}

/// Removes every managed container once `confirm` agrees. `None` means the
/// removal was declined and nothing was touched.
pub fn force_remove_all<R, F>(docker: &Docker<'_, R>, confirm: F) -> Result<Option<Vec<String>>, BoxError>
where
    R: DockerRunner,
    F: FnOnce(&[String]) -> Result<bool, BoxError>,
{
    let names = managed_containers(docker, &[])?;
    if names.is_empty() {
        return Ok(Some(names));
    }
    if !confirm(&names)? {
        return Ok(None);
    }
    for name in &names {
        docker.mutate(&args(["container", "rm", "-f", name.as_str()]))?;
    }
    Ok(Some(names))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::session_for;
    use crate::docker::testing::MockDockerRunner;
    use crate::mounts::{EnvSpec, EnvValue, MountMode, MountSpec};
    use chrono::TimeZone;
    use std::path::{Path, PathBuf};

    fn inspect_json(status: &str, auto_remove: bool, version: &str) -> String {
        serde_json::json!([{
            "Name": "/agentbox-proj",
            "State": { "Status": status, "Running": status == "running" },
            "Config": { "Labels": { MANAGED_LABEL: "true", VERSION_LABEL: version } },
            "HostConfig": { "AutoRemove": auto_remove }
        }])
        .to_string()
    }

    fn session() -> SessionConfig {
        let mut session = session_for(Path::new("/work/proj"), Path::new("/home/dev"));
        session.container_name = "agentbox-work-proj-0000abcd".to_string();
        session
    }

    fn params() -> RunParameters {
        RunParameters {
            mounts: vec![MountSpec {
                host: PathBuf::from("/work/proj"),
                container: "/home/dev/proj".to_string(),
                mode: MountMode::ReadWrite,
            }],
            env: vec![EnvSpec {
                name: "AGENTBOX_WORKSPACE".to_string(),
                value: EnvValue::Literal("/home/dev/proj".to_string()),
            }],
            workdir: "/home/dev/proj".to_string(),
        }
    }

    const MISSING: &str = "Error: No such container: agentbox-work-proj-0000abcd";

    #[test]
    fn observe_maps_all_three_states() {
        let runner = MockDockerRunner::default();
        runner.push_err(1, MISSING);
        runner.push_ok(&inspect_json("exited", false, TOOL_VERSION));
        runner.push_ok(&inspect_json("created", false, TOOL_VERSION));
        runner.push_ok(&inspect_json("running", true, TOOL_VERSION));
        let docker = Docker::new(&runner, false);

        assert_eq!(observe(&docker, "x").unwrap().state, ContainerState::Missing);
        assert_eq!(observe(&docker, "x").unwrap().state, ContainerState::Stopped);
        assert_eq!(observe(&docker, "x").unwrap().state, ContainerState::Stopped);
        let running = observe(&docker, "x").unwrap();
        assert_eq!(running.state, ContainerState::Running);
        assert!(running.auto_remove);
        assert_eq!(running.labels[MANAGED_LABEL], "true");
    }

    #[test]
    fn observe_surfaces_runtime_failures() {
        let runner = MockDockerRunner::default();
        runner.push_err(1, "Cannot connect to the Docker daemon at unix:///var/run/docker.sock");
        let docker = Docker::new(&runner, false);
        let err = observe(&docker, "x").expect_err("daemon down");
        assert_eq!(err.error_code(), Some("docker_daemon_unreachable"));
    }

    #[test]
    fn missing_container_is_created_started_and_exec_ed() {
        let runner = MockDockerRunner::default();
        runner.push_err(1, MISSING);
        let docker = Docker::new(&runner, false);
        let session = session();

        let outcome = Lifecycle::new(&docker, &session).launch(&params(), false).unwrap();

        assert_eq!(outcome.transition, Transition::Created);
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(runner.verbs(), vec!["inspect", "create", "start", "exec"]);
        let create = &runner.calls()[1];
        assert_eq!(create.value_after("--network").as_deref(), Some("host"));
        assert_eq!(create.value_after("--tmpfs").as_deref(), Some(RUNTIME_DIR));
        assert!(create.values_after("--label").contains(&"agentbox.managed=true".to_string()));
        assert!(create.values_after("--label").contains(&"agentbox.user=dev".to_string()));
        assert!(!create.has("--rm"));
        assert!(!create.has("--privileged"));
        assert_eq!(create.value_after("--cap-add").as_deref(), Some("SYS_ADMIN"));
        assert_eq!(create.value_after("--shm-size").as_deref(), Some("2g"));
        assert_eq!(&create.args[create.args.len() - 3..], ["agentbox:latest", "sleep", "infinity"]);
    }

    #[test]
    fn running_container_is_reused_without_create() {
        let runner = MockDockerRunner::default();
        runner.push_ok(&inspect_json("running", false, TOOL_VERSION));
        let docker = Docker::new(&runner, false);
        let mut session = session();
        session.command = vec!["make".to_string(), "test".to_string()];

        let outcome = Lifecycle::new(&docker, &session).launch(&params(), false).unwrap();

        assert_eq!(outcome.transition, Transition::Reused);
        assert_eq!(runner.verbs(), vec!["inspect", "exec"]);
        let exec = &runner.calls()[1];
        assert!(!exec.has("-it"));
        assert_eq!(
            &exec.args[exec.args.len() - 4..],
            ["agentbox-work-proj-0000abcd", EXEC_WRAPPER_PATH, "make", "test"]
        );
    }

    #[test]
    fn stopped_container_is_started_not_replaced() {
        let runner = MockDockerRunner::default();
        runner.push_ok(&inspect_json("exited", false, TOOL_VERSION));
        let docker = Docker::new(&runner, false);
        let session = session();

        let outcome = Lifecycle::new(&docker, &session).launch(&params(), false).unwrap();

        assert_eq!(outcome.transition, Transition::Started);
        assert_eq!(runner.verbs(), vec!["inspect", "start", "exec"]);
    }

    #[test]
    fn ephemeral_request_against_persistent_container_mutates_nothing() {
        let runner = MockDockerRunner::default();
        runner.push_ok(&inspect_json("exited", false, TOOL_VERSION));
        let docker = Docker::new(&runner, false);
        let mut session = session();
        session.ephemeral = true;

        let err = Lifecycle::new(&docker, &session)
            .launch(&params(), false)
            .expect_err("conflict");

        assert!(matches!(err, BoxError::Config(_)));
        assert_eq!(runner.verbs(), vec!["inspect"]);
    }

    #[test]
    fn ephemeral_session_uses_auto_remove_and_stops_after_exec() {
        let runner = MockDockerRunner::default();
        runner.push_err(1, MISSING);
        let docker = Docker::new(&runner, false);
        let mut session = session();
        session.ephemeral = true;

        Lifecycle::new(&docker, &session).launch(&params(), false).unwrap();

        assert_eq!(runner.verbs(), vec!["inspect", "create", "start", "exec", "stop"]);
        assert!(runner.calls()[1].has("--rm"));
    }

    #[test]
    fn ephemeral_container_is_stopped_when_exec_fails() {
        let runner = MockDockerRunner::default();
        runner.push_err(1, MISSING);
        runner.push_ok("");
        runner.push_ok("");
        runner.push_err(125, "Error response from daemon: container is restarting");
        let docker = Docker::new(&runner, false);
        let mut session = session();
        session.ephemeral = true;

        let err = Lifecycle::new(&docker, &session)
            .launch(&params(), false)
            .expect_err("exec failure");

        assert!(matches!(err, BoxError::ProcessDetailed { .. }));
        assert_eq!(runner.verbs(), vec!["inspect", "create", "start", "exec", "stop"]);
    }

    #[test]
    fn recreate_ignores_stop_failure() {
        let runner = MockDockerRunner::default();
        runner.push_ok(&inspect_json("exited", false, TOOL_VERSION));
        runner.push_err(1, "container is not running");
        let docker = Docker::new(&runner, false);
        let session = session();

        let outcome = Lifecycle::new(&docker, &session).launch(&params(), true).unwrap();

        assert_eq!(outcome.transition, Transition::Created);
        assert_eq!(
            runner.verbs(),
            vec!["inspect", "stop", "rm", "create", "start", "exec"]
        );
    }

    #[test]
    fn version_skew_does_not_block() {
        let runner = MockDockerRunner::default();
        runner.push_ok(&inspect_json("running", false, "0.0.1"));
        let docker = Docker::new(&runner, false);
        let session = session();

        let outcome = Lifecycle::new(&docker, &session).launch(&params(), false).unwrap();
        assert_eq!(outcome.transition, Transition::Reused);
    }

    #[test]
    fn create_name_conflict_is_fatal() {
        let runner = MockDockerRunner::default();
        runner.push_err(1, MISSING);
        runner.push_err(
            125,
            "Error response from daemon: Conflict. The container name \"/agentbox-work-proj-0000abcd\" is already in use by container \"f00\".",
        );
        let docker = Docker::new(&runner, false);
        let session = session();

        let err = Lifecycle::new(&docker, &session)
            .launch(&params(), false)
            .expect_err("race");
        assert_eq!(err.error_code(), Some("container_name_conflict"));
        assert_eq!(runner.verbs(), vec!["inspect", "create"]);
    }

    #[test]
    fn exec_exit_status_is_returned() {
        let runner = MockDockerRunner::default();
        runner.push_ok(&inspect_json("running", false, TOOL_VERSION));
        runner.push_err(42, "");
        let docker = Docker::new(&runner, false);
        let session = session();

        let outcome = Lifecycle::new(&docker, &session).launch(&params(), false).unwrap();
        assert_eq!(outcome.exit_code, 42);
    }

    #[test]
    fn create_args_are_deterministic_for_a_given_time() {
        let mut session = session();
        session.privileged = true;
        session.interactive = true;
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let create = create_args(&session, &params(), now);
        assert!(create.contains(&"--privileged".to_string()));
        assert!(!create.contains(&"--cap-add".to_string()));
        assert!(create.contains(&"agentbox.created=2025-06-01T12:00:00Z".to_string()));
        assert!(create.contains(&"agentbox.workspace=/work/proj".to_string()));
        assert_eq!(create, create_args(&session, &params(), now));
        assert!(exec_args(&session, &params()).contains(&"-it".to_string()));
    }

    #[test]
    fn remove_stopped_only_touches_exited_and_created() {
        let runner = MockDockerRunner::default();
        runner.push_ok("agentbox-a\nagentbox-b\n");
        let docker = Docker::new(&runner, false);

        let removed = remove_stopped(&docker).unwrap();

        assert_eq!(removed, vec!["agentbox-a", "agentbox-b"]);
        let calls = runner.calls();
        assert_eq!(
            calls[0].values_after("--filter"),
            vec![MANAGED_FILTER, "status=exited", "status=created"]
        );
        assert_eq!(runner.verbs(), vec!["ps", "rm", "rm"]);
    }

    #[test]
    fn declined_force_remove_is_a_noop() {
        let runner = MockDockerRunner::default();
        runner.push_ok("agentbox-a\n");
        let docker = Docker::new(&runner, false);

        let result = force_remove_all(&docker, |names| {
            assert_eq!(names, ["agentbox-a".to_string()]);
            Ok(false)
        })
        .unwrap();

        assert!(result.is_none());
        assert_eq!(runner.verbs(), vec!["ps"]);
    }

    #[test]
    fn confirmed_force_remove_removes_everything() {
        let runner = MockDockerRunner::default();
        runner.push_ok("agentbox-a\nagentbox-b\n");
        let docker = Docker::new(&runner, false);

        let removed = force_remove_all(&docker, |_| Ok(true)).unwrap().unwrap();

        assert_eq!(removed.len(), 2);
        assert!(runner.calls()[1].has("-f"));
    }
}
