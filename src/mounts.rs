//! Mount and environment composition.
//!
//! Every host resource that may reach the container is described by one
//! [`Rule`]. Rules only probe the host filesystem and environment; they never
//! depend on each other, so the full set can be listed and tested in isolation.
//! Evaluation order only affects the order of the emitted parameters.

use crate::config::{ConfigMountMode, HostOs, Integration, SessionConfig};
use crate::error::BoxError;
use dirs::home_dir;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Directory (under the container home) holding read-only copies of host files.
pub const HOST_SHADOW_DIR: &str = ".agentbox-host";
pub const HOST_SHADOW_CONFIG: &str = "claude.json";
/// Container directory receiving forwarded agent sockets.
pub const SSH_AGENT_SOCKET: &str = "/run/agentbox-host/ssh-auth.sock";
pub const GPG_EXTRA_SOCKET: &str = "/run/agentbox-host/S.gpg-agent.extra";
/// Docker Desktop relays the host agent here; host socket paths cannot be bind-mounted on macOS.
const DOCKER_DESKTOP_SSH_RELAY: &str = "/run/host-services/ssh-auth.sock";

pub const AGENT_CONFIG_DIR: &str = ".claude";
pub const AGENT_IDENTITY_FILE: &str = ".claude.json";

/// Home entries that a workspace basename must not shadow.
const RESERVED_HOME_ENTRIES: &[&str] = &[
    AGENT_CONFIG_DIR,
    AGENT_IDENTITY_FILE,
    HOST_SHADOW_DIR,
    ".ssh",
    ".gnupg",
    ".gitconfig",
    ".config",
    ".aws",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountSpec {
    pub host: PathBuf,
    pub container: String,
    pub mode: MountMode,
}

impl MountSpec {
    fn ro(host: PathBuf, container: impl Into<String>) -> Self {
        Self {
            host,
            container: container.into(),
            mode: MountMode::ReadOnly,
        }
    }

    fn rw(host: PathBuf, container: impl Into<String>) -> Self {
        Self {
            host,
            container: container.into(),
            mode: MountMode::ReadWrite,
        }
    }

    pub fn volume_arg(&self) -> String {
        match self.mode {
            MountMode::ReadOnly => format!("{}:{}:ro", self.host.display(), self.container),
            MountMode::ReadWrite => format!("{}:{}", self.host.display(), self.container),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum EnvValue {
    /// Passed as `-e NAME`, so the runtime reads the value from our environment.
    Inherit,
    Literal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvSpec {
    pub name: String,
    pub value: EnvValue,
}

impl EnvSpec {
    fn literal(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: EnvValue::Literal(value.into()),
        }
    }

    pub fn env_arg(&self) -> String {
        match &self.value {
            EnvValue::Inherit => self.name.clone(),
            EnvValue::Literal(value) => format!("{}={value}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunParameters {
    pub mounts: Vec<MountSpec>,
    pub env: Vec<EnvSpec>,
    pub workdir: String,
}

impl RunParameters {
    pub fn mount_args(&self) -> Vec<String> {
        self.mounts
            .iter()
            .flat_map(|mount| ["-v".to_string(), mount.volume_arg()])
            .collect()
    }

    pub fn env_args(&self) -> Vec<String> {
        self.env
            .iter()
            .flat_map(|spec| ["-e".to_string(), spec.env_arg()])
            .collect()
    }
}

/// Host state the rules look at, captured once per invocation.
#[derive(Debug, Clone)]
pub struct HostFacts {
    pub home: PathBuf,
    pub os: HostOs,
    pub env: BTreeMap<String, String>,
    pub gpg_extra_socket: Option<PathBuf>,
}

impl HostFacts {
    pub fn collect(session: &SessionConfig) -> Result<Self, BoxError> {
        let home = home_dir().ok_or_else(|| {
            BoxError::Config("unable to resolve $HOME; set HOME to an existing directory".to_string())
        })?;
        let gpg_extra_socket = if session.gpg {
            gpgconf_dir("agent-extra-socket")
        } else {
            None
        };
        Ok(Self {
            home,
            os: HostOs::current(),
            env: env::vars().collect(),
            gpg_extra_socket,
        })
    }

    fn non_empty_var(&self, name: &str) -> Option<&str> {
        self.env
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

/// Asks the GnuPG toolchain where one of its sockets lives.
pub fn gpgconf_dir(item: &str) -> Option<PathBuf> {
    let gpgconf = which::which("gpgconf").ok()?;
    let output = Command::new(gpgconf)
        .args(["--list-dirs", item])
        .output()
        .ok()?;
    if !output.status.success() {
        tracing::debug!(item, "gpgconf --list-dirs failed");
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then(|| PathBuf::from(text))
}

pub struct RuleContext<'a> {
    pub session: &'a SessionConfig,
    pub facts: &'a HostFacts,
    container_home: String,
}

impl RuleContext<'_> {
    fn home_path(&self, relative: &str) -> String {
        format!("{}/{relative}", self.container_home)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Contribution {
    Mount(MountSpec),
    Env(EnvSpec),
    /// A variable name to forward if the host has a non-empty value for it.
    Forward(String),
}

pub struct Rule {
    pub name: &'static str,
    evaluate: fn(&RuleContext<'_>) -> Result<Vec<Contribution>, BoxError>,
}

impl Rule {
    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<Vec<Contribution>, BoxError> {
        (self.evaluate)(ctx)
    }
}

pub const RULES: &[Rule] = &[
    Rule {
        name: "workspace",
        evaluate: workspace_rule,
    },
    Rule {
        name: "host-identity",
        evaluate: host_identity_rule,
    },
    Rule {
        name: "config-dir",
        evaluate: config_dir_rule,
    },
    Rule {
        name: "ssh-keys",
        evaluate: ssh_keys_rule,
    },
    Rule {
        name: "gitconfig",
        evaluate: gitconfig_rule,
    },
    Rule {
        name: "ssh-agent",
        evaluate: ssh_agent_rule,
    },
    Rule {
        name: "gpg",
        evaluate: gpg_rule,
    },
    Rule {
        name: "integrations",
        evaluate: integrations_rule,
    },
    Rule {
        name: "forward-env",
        evaluate: forward_env_rule,
    },
    Rule {
        name: "session-env",
        evaluate: session_env_rule,
    },
];

/// Mount point of the workspace inside the container.
pub fn workspace_container_path(session: &SessionConfig) -> String {
    let home = session.identity.container_home();
    let basename = session
        .workspace
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "workspace".to_string());
    if RESERVED_HOME_ENTRIES.contains(&basename.as_str()) {
        format!("{home}/workspace/{basename}")
    } else {
        format!("{home}/{basename}")
    }
}

pub fn evaluate(session: &SessionConfig, facts: &HostFacts) -> Result<RunParameters, BoxError> {
    let ctx = RuleContext {
        session,
        facts,
        container_home: session.identity.container_home(),
    };

    let mut mounts: Vec<MountSpec> = Vec::new();
    let mut env: Vec<EnvSpec> = Vec::new();
    let mut seen_targets = BTreeSet::new();
    let mut seen_env = BTreeSet::new();
    let mut forwarded: Vec<String> = Vec::new();

    for rule in RULES {
        for contribution in rule.evaluate(&ctx)? {
            match contribution {
                Contribution::Mount(mount) => {
                    if seen_targets.insert(mount.container.clone()) {
                        mounts.push(mount);
                    } else {
                        tracing::debug!(rule = rule.name, target = %mount.container, "duplicate mount target skipped");
                    }
                }
                Contribution::Env(spec) => {
                    if seen_env.insert(spec.name.clone()) {
                        env.push(spec);
                    }
                }
                Contribution::Forward(name) => forwarded.push(name),
            }
        }
    }

    for name in forwarded {
        if facts.non_empty_var(&name).is_none() {
            continue;
        }
        if seen_env.insert(name.clone()) {
            env.push(EnvSpec {
                name,
                value: EnvValue::Inherit,
            });
        }
    }

    Ok(RunParameters {
        mounts,
        env,
        workdir: workspace_container_path(session),
    })
}

fn workspace_rule(ctx: &RuleContext<'_>) -> Result<Vec<Contribution>, BoxError> {
    let workspace = &ctx.session.workspace;
    if !workspace.is_dir() {
        return Err(BoxError::Config(format!(
            "workspace directory does not exist: {}",
            workspace.display()
        )));
    }
    Ok(vec![Contribution::Mount(MountSpec::rw(
        workspace.clone(),
        workspace_container_path(ctx.session),
    ))])
}

fn host_identity_rule(ctx: &RuleContext<'_>) -> Result<Vec<Contribution>, BoxError> {
    let host_file = ctx.facts.home.join(AGENT_IDENTITY_FILE);
    if !host_file.is_file() {
        tracing::debug!(path = %host_file.display(), "no host identity file");
        return Ok(Vec::new());
    }
    Ok(vec![Contribution::Mount(MountSpec::ro(
        host_file,
        ctx.home_path(&format!("{HOST_SHADOW_DIR}/{HOST_SHADOW_CONFIG}")),
    ))])
}

fn config_dir_rule(ctx: &RuleContext<'_>) -> Result<Vec<Contribution>, BoxError> {
    let config_dir = &ctx.session.config_dir;
    if !config_dir.is_dir() {
        tracing::debug!(path = %config_dir.display(), "no agent config directory");
        return Ok(Vec::new());
    }
    let target = ctx.home_path(AGENT_CONFIG_DIR);
    match ctx.session.config_mount {
        ConfigMountMode::Full => Ok(vec![Contribution::Mount(MountSpec::rw(
            config_dir.clone(),
            target,
        ))]),
        ConfigMountMode::Selective => {
            let mut out = Vec::new();
            let settings = config_dir.join("settings.json");
            if settings.is_file() {
                out.push(Contribution::Mount(MountSpec::ro(
                    settings,
                    format!("{target}/settings.json"),
                )));
            }
            let rules = config_dir.join("rules");
            if rules.is_dir() {
                out.push(Contribution::Mount(MountSpec::ro(rules, format!("{target}/rules"))));
            }
            Ok(out)
        }
    }
}

fn ssh_keys_rule(ctx: &RuleContext<'_>) -> Result<Vec<Contribution>, BoxError> {
    let ssh_dir = ctx.facts.home.join(".ssh");
    if !ssh_dir.is_dir() {
        return Ok(Vec::new());
    }
    Ok(vec![Contribution::Mount(MountSpec::ro(ssh_dir, ctx.home_path(".ssh")))])
}

fn gitconfig_rule(ctx: &RuleContext<'_>) -> Result<Vec<Contribution>, BoxError> {
    let gitconfig = ctx.facts.home.join(".gitconfig");
    if !gitconfig.is_file() {
        return Ok(Vec::new());
    }
    Ok(vec![Contribution::Mount(MountSpec::ro(
        gitconfig,
        ctx.home_path(".gitconfig"),
    ))])
}

fn ssh_agent_rule(ctx: &RuleContext<'_>) -> Result<Vec<Contribution>, BoxError> {
    let Some(raw) = ctx.facts.non_empty_var("SSH_AUTH_SOCK") else {
        return Ok(Vec::new());
    };
    let source = if ctx.facts.os == HostOs::MacOs {
        PathBuf::from(DOCKER_DESKTOP_SSH_RELAY)
    } else {
        // Agent sockets are frequently symlinks (e.g. launchd or forwarding helpers).
        let canonical = match fs::canonicalize(raw) {
            Ok(path) => path,
            Err(err) => {
                tracing::debug!(socket = raw, %err, "SSH agent socket not resolvable");
                return Ok(Vec::new());
            }
        };
        if !is_live_socket(&canonical) {
            tracing::debug!(socket = %canonical.display(), "SSH agent socket is not live");
            return Ok(Vec::new());
        }
        canonical
    };
    Ok(vec![
        Contribution::Mount(MountSpec::rw(source, SSH_AGENT_SOCKET)),
        Contribution::Env(EnvSpec::literal("SSH_AUTH_SOCK", SSH_AGENT_SOCKET)),
    ])
}

#[cfg(unix)]
fn is_live_socket(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    use std::os::unix::net::UnixStream;

    let is_socket = fs::metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false);
    is_socket && UnixStream::connect(path).is_ok()
}

#[cfg(not(unix))]
fn is_live_socket(_path: &Path) -> bool {
    false
}

fn gpg_rule(ctx: &RuleContext<'_>) -> Result<Vec<Contribution>, BoxError> {
    if !ctx.session.gpg {
        return Ok(Vec::new());
    }
    let gnupg = ctx.facts.home.join(".gnupg");
    if !gnupg.is_dir() {
        tracing::debug!(path = %gnupg.display(), "GPG forwarding requested but no GnuPG home");
        return Ok(Vec::new());
    }
    // Read-write: the agent keeps its IPC state here.
    let mut out = vec![Contribution::Mount(MountSpec::rw(gnupg, ctx.home_path(".gnupg")))];
    match &ctx.facts.gpg_extra_socket {
        Some(extra) if extra.exists() => {
            out.push(Contribution::Mount(MountSpec::rw(extra.clone(), GPG_EXTRA_SOCKET)));
        }
        Some(extra) => {
            tracing::debug!(socket = %extra.display(), "GPG extra socket missing; is gpg-agent running?");
        }
        None => tracing::debug!("GPG extra socket not discoverable"),
    }
    Ok(out)
}

pub struct IntegrationBatch {
    /// Host path relative to the home directory; also used below the container home.
    pub home_relative_dir: &'static str,
    pub env: &'static [&'static str],
}

pub fn integration_batch(integration: Integration) -> IntegrationBatch {
    match integration {
        Integration::Aws => IntegrationBatch {
            home_relative_dir: ".aws",
            env: &[
                "AWS_PROFILE",
                "AWS_REGION",
                "AWS_DEFAULT_REGION",
                "AWS_ACCESS_KEY_ID",
                "AWS_SECRET_ACCESS_KEY",
                "AWS_SESSION_TOKEN",
                "CLAUDE_CODE_USE_BEDROCK",
            ],
        },
        Integration::Gcloud => IntegrationBatch {
            home_relative_dir: ".config/gcloud",
            env: &[
                "CLOUDSDK_CORE_PROJECT",
                "GOOGLE_CLOUD_PROJECT",
                "CLOUD_ML_REGION",
                "ANTHROPIC_VERTEX_PROJECT_ID",
                "CLAUDE_CODE_USE_VERTEX",
            ],
        },
    }
}

fn integrations_rule(ctx: &RuleContext<'_>) -> Result<Vec<Contribution>, BoxError> {
    let mut out = Vec::new();
    for integration in &ctx.session.integrations {
        let batch = integration_batch(*integration);
        let host_dir = ctx.facts.home.join(batch.home_relative_dir);
        if !host_dir.is_dir() {
            tracing::debug!(?integration, path = %host_dir.display(), "integration credentials missing");
            continue;
        }
        out.push(Contribution::Mount(MountSpec::ro(
            host_dir,
            ctx.home_path(batch.home_relative_dir),
        )));
        out.extend(batch.env.iter().map(|name| Contribution::Forward(name.to_string())));
    }
    Ok(out)
}

fn forward_env_rule(ctx: &RuleContext<'_>) -> Result<Vec<Contribution>, BoxError> {
    Ok(ctx
        .session
        .forward_env
        .iter()
        .map(|name| Contribution::Forward(name.clone()))
        .collect())
}

fn session_env_rule(ctx: &RuleContext<'_>) -> Result<Vec<Contribution>, BoxError> {
    let session = ctx.session;
    let mut out = vec![
        Contribution::Env(EnvSpec::literal(
            "AGENTBOX_WORKSPACE",
            workspace_container_path(session),
        )),
        Contribution::Env(EnvSpec::literal(
            "AGENTBOX_AUX_PORT",
            session.aux_port.to_string(),
        )),
        Contribution::Env(EnvSpec::literal(
            "AGENTBOX_DANGEROUS",
            if session.dangerous { "1" } else { "0" },
        )),
    ];
    if session.verbose {
        out.push(Contribution::Env(EnvSpec::literal("AGENTBOX_VERBOSE", "1")));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::session_for;
    use tempfile::tempdir;

    fn facts(home: &Path, os: HostOs) -> HostFacts {
        HostFacts {
            home: home.to_path_buf(),
            os,
            env: BTreeMap::new(),
            gpg_extra_socket: None,
        }
    }

    fn targets(params: &RunParameters) -> Vec<String> {
        params.mounts.iter().map(|m| m.container.clone()).collect()
    }

    #[test]
    fn minimal_host_only_mounts_workspace() {
        let home = tempdir().unwrap();
        let ws = tempdir().unwrap();
        let session = session_for(ws.path(), home.path());
        let params = evaluate(&session, &facts(home.path(), HostOs::Linux)).unwrap();

        assert_eq!(params.mounts.len(), 1);
        assert_eq!(params.mounts[0].mode, MountMode::ReadWrite);
        assert_eq!(params.workdir, workspace_container_path(&session));
        assert!(params.workdir.starts_with("/home/dev/"));
        let names: Vec<&str> = params.env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["AGENTBOX_WORKSPACE", "AGENTBOX_AUX_PORT", "AGENTBOX_DANGEROUS"]
        );
    }

    #[test]
    fn missing_workspace_is_fatal() {
        let home = tempdir().unwrap();
        let ws = tempdir().unwrap();
        let mut session = session_for(ws.path(), home.path());
        session.workspace = ws.path().join("gone");
        let err = evaluate(&session, &facts(home.path(), HostOs::Linux)).unwrap_err();
        assert!(matches!(err, BoxError::Config(_)));
    }

    #[test]
    fn workspace_named_like_config_dir_does_not_collide() {
        let home = tempdir().unwrap();
        let parent = tempdir().unwrap();
        let ws = parent.path().join(".claude");
        fs::create_dir_all(&ws).unwrap();
        fs::create_dir_all(home.path().join(".claude")).unwrap();
        let session = session_for(&ws, home.path());

        let params = evaluate(&session, &facts(home.path(), HostOs::Linux)).unwrap();
        let all = targets(&params);
        assert!(all.contains(&"/home/dev/workspace/.claude".to_string()));
        assert!(all.contains(&"/home/dev/.claude".to_string()));
    }

    #[test]
    fn selective_mode_mounts_only_settings_and_rules() {
        let home = tempdir().unwrap();
        let ws = tempdir().unwrap();
        let config_dir = home.path().join(".claude");
        fs::create_dir_all(config_dir.join("rules")).unwrap();
        fs::create_dir_all(config_dir.join("projects")).unwrap();
        fs::write(config_dir.join("settings.json"), "{}").unwrap();
        fs::write(config_dir.join("history.jsonl"), "").unwrap();

        let mut session = session_for(ws.path(), home.path());
        session.config_mount = ConfigMountMode::Selective;
        let params = evaluate(&session, &facts(home.path(), HostOs::MacOs)).unwrap();
        let config_mounts: Vec<&MountSpec> = params
            .mounts
            .iter()
            .filter(|m| m.container.starts_with("/home/dev/.claude"))
            .collect();
        assert_eq!(config_mounts.len(), 2);
        assert!(config_mounts.iter().all(|m| m.mode == MountMode::ReadOnly));
        assert_eq!(config_mounts[0].container, "/home/dev/.claude/settings.json");
        assert_eq!(config_mounts[1].container, "/home/dev/.claude/rules");

        session.config_mount = ConfigMountMode::Full;
        let params = evaluate(&session, &facts(home.path(), HostOs::MacOs)).unwrap();
        let full: Vec<&MountSpec> = params
            .mounts
            .iter()
            .filter(|m| m.container.starts_with("/home/dev/.claude"))
            .collect();
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].host, config_dir);
        assert_eq!(full[0].mode, MountMode::ReadWrite);
    }

    #[test]
    fn optional_host_files_are_mounted_read_only_when_present() {
        let home = tempdir().unwrap();
        let ws = tempdir().unwrap();
        fs::create_dir_all(home.path().join(".ssh")).unwrap();
        fs::write(home.path().join(".gitconfig"), "[user]\n").unwrap();
        fs::write(home.path().join(".claude.json"), "{}").unwrap();
        let session = session_for(ws.path(), home.path());

        let params = evaluate(&session, &facts(home.path(), HostOs::Linux)).unwrap();
        let shadow = params
            .mounts
            .iter()
            .find(|m| m.container == "/home/dev/.agentbox-host/claude.json")
            .expect("host shadow mount");
        assert_eq!(shadow.mode, MountMode::ReadOnly);
        assert!(params
            .mounts
            .iter()
            .any(|m| m.container == "/home/dev/.ssh" && m.mode == MountMode::ReadOnly));
        assert!(params
            .mounts
            .iter()
            .any(|m| m.volume_arg().ends_with("/home/dev/.gitconfig:ro")));
    }

    #[test]
    fn forwarded_env_requires_non_empty_host_value() {
        let home = tempdir().unwrap();
        let ws = tempdir().unwrap();
        let mut session = session_for(ws.path(), home.path());
        session.forward_env = vec!["A".into(), "B".into(), "A".into(), "C".into()];
        let mut host = facts(home.path(), HostOs::Linux);
        host.env.insert("A".into(), "1".into());
        host.env.insert("B".into(), String::new());
        host.env.insert("C".into(), "x".into());

        let params = evaluate(&session, &host).unwrap();
        let forwarded: Vec<String> = params
            .env
            .iter()
            .filter(|e| e.value == EnvValue::Inherit)
            .map(|e| e.name.clone())
            .collect();
        assert_eq!(forwarded, vec!["A", "C"]);
        assert!(params.env_args().contains(&"A".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn ssh_agent_forwarded_only_for_live_socket() {
        use std::os::unix::fs::symlink;
        use std::os::unix::net::UnixListener;

        let home = tempdir().unwrap();
        let ws = tempdir().unwrap();
        let session = session_for(ws.path(), home.path());
        let sock = home.path().join("agent.sock");
        let _listener = UnixListener::bind(&sock).unwrap();
        let alias = home.path().join("alias.sock");
        symlink(&sock, &alias).unwrap();

        let mut host = facts(home.path(), HostOs::Linux);
        host.env
            .insert("SSH_AUTH_SOCK".into(), alias.to_string_lossy().to_string());
        let params = evaluate(&session, &host).unwrap();
        let agent = params
            .mounts
            .iter()
            .find(|m| m.container == SSH_AGENT_SOCKET)
            .expect("agent mount");
        assert_eq!(agent.host, fs::canonicalize(&sock).unwrap());
        assert!(params
            .env
            .contains(&EnvSpec::literal("SSH_AUTH_SOCK", SSH_AGENT_SOCKET)));

        let plain = home.path().join("not-a-socket");
        fs::write(&plain, "").unwrap();
        host.env
            .insert("SSH_AUTH_SOCK".into(), plain.to_string_lossy().to_string());
        let params = evaluate(&session, &host).unwrap();
        assert!(!targets(&params).contains(&SSH_AGENT_SOCKET.to_string()));
    }

    #[test]
    fn gpg_mounts_home_and_extra_socket_best_effort() {
        let home = tempdir().unwrap();
        let ws = tempdir().unwrap();
        let mut session = session_for(ws.path(), home.path());
        session.gpg = true;

        let params = evaluate(&session, &facts(home.path(), HostOs::Linux)).unwrap();
        assert!(!targets(&params).contains(&"/home/dev/.gnupg".to_string()));

        fs::create_dir_all(home.path().join(".gnupg")).unwrap();
        let extra = home.path().join("S.gpg-agent.extra");
        fs::write(&extra, "").unwrap();
        let mut host = facts(home.path(), HostOs::Linux);
        host.gpg_extra_socket = Some(extra.clone());
        let params = evaluate(&session, &host).unwrap();
        let all = targets(&params);
        assert!(all.contains(&"/home/dev/.gnupg".to_string()));
        assert!(all.contains(&GPG_EXTRA_SOCKET.to_string()));

        host.gpg_extra_socket = Some(home.path().join("missing"));
        let params = evaluate(&session, &host).unwrap();
        assert!(!targets(&params).contains(&GPG_EXTRA_SOCKET.to_string()));
    }

    #[test]
    fn integration_adds_mount_and_env_batch_when_present() {
        let home = tempdir().unwrap();
        let ws = tempdir().unwrap();
        let mut session = session_for(ws.path(), home.path());
        session.integrations = vec![Integration::Aws];
        let mut host = facts(home.path(), HostOs::Linux);
        host.env.insert("AWS_PROFILE".into(), "dev".into());

        let params = evaluate(&session, &host).unwrap();
        assert!(!params.env.iter().any(|e| e.name == "AWS_PROFILE"));

        fs::create_dir_all(home.path().join(".aws")).unwrap();
        let params = evaluate(&session, &host).unwrap();
        assert!(params
            .mounts
            .iter()
            .any(|m| m.container == "/home/dev/.aws" && m.mode == MountMode::ReadOnly));
        assert!(params.env.iter().any(|e| e.name == "AWS_PROFILE"));
    }

    #[test]
    fn evaluation_is_idempotent() {
        let home = tempdir().unwrap();
        let ws = tempdir().unwrap();
        fs::create_dir_all(home.path().join(".ssh")).unwrap();
        fs::create_dir_all(home.path().join(".claude/rules")).unwrap();
        let mut session = session_for(ws.path(), home.path());
        session.verbose = true;
        let host = facts(home.path(), HostOs::Linux);

        let first = evaluate(&session, &host).unwrap();
        let second = evaluate(&session, &host).unwrap();
        assert_eq!(first, second);
        assert!(first
            .env
            .contains(&EnvSpec::literal("AGENTBOX_VERBOSE", "1")));
    }
}
