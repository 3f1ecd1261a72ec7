//! Start-of-container reconciliation, run by the entrypoint through
//! `agentbox --container-init` before the main process takes over.

use crate::build_context::READY_MARKER;
use crate::config::{AUX_PORT_ENV, DEFAULT_AUX_PORT};
use crate::error::BoxError;
use crate::mounts::{self, AGENT_IDENTITY_FILE, GPG_EXTRA_SOCKET, HOST_SHADOW_CONFIG, HOST_SHADOW_DIR};
use serde_json::{json, Map, Value};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Host identity fields copied into the container's agent config.
pub const MERGE_ALLOW_LIST: &[&str] = &[
    "oauthAccount",
    "userID",
    "hasCompletedOnboarding",
    "lastOnboardingVersion",
    "lastReleaseNotesSeen",
    "hasAvailableSubscription",
    "subscriptionNoticeCount",
    "s1mAccessCache",
];
pub const BYPASS_ACCEPTED_KEY: &str = "bypassPermissionsModeAccepted";
pub const AUX_SERVICE_NAME: &str = "serena";
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ContainerPaths {
    pub home: PathBuf,
    pub shadow: PathBuf,
    pub target: PathBuf,
    pub gpg_extra_socket: PathBuf,
    pub ready_marker: PathBuf,
}

impl ContainerPaths {
    pub fn for_home(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
            shadow: home.join(HOST_SHADOW_DIR).join(HOST_SHADOW_CONFIG),
            target: home.join(AGENT_IDENTITY_FILE),
            gpg_extra_socket: PathBuf::from(GPG_EXTRA_SOCKET),
            ready_marker: PathBuf::from(READY_MARKER),
        }
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            tracing::debug!(path = %path.display(), %err, "config not readable");
            return None;
        }
    };
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            tracing::debug!(path = %path.display(), "config is not a JSON object");
            None
        }
        Err(err) => {
            tracing::debug!(path = %path.display(), %err, "config is not valid JSON");
            None
        }
    }
}

pub fn extract_allowed(shadow: &Map<String, Value>) -> Map<String, Value> {
    MERGE_ALLOW_LIST
        .iter()
        .filter_map(|key| {
            shadow
                .get(*key)
                .filter(|value| !value.is_null())
                .map(|value| (key.to_string(), value.clone()))
        })
        .collect()
}

/// Shallow merge of the extracted fields over `target`; extracted values win.
pub fn merge_into(target: &mut Map<String, Value>, extracted: &Map<String, Value>) {
    for (key, value) in extracted {
        target.insert(key.clone(), value.clone());
    }
    target.insert(BYPASS_ACCEPTED_KEY.to_string(), Value::Bool(true));
}

/// Returns whether the target file was written.
pub fn merge_host_config(shadow_path: &Path, target_path: &Path) -> Result<bool, BoxError> {
    let Some(shadow) = read_json_object(shadow_path) else {
        return Ok(false);
    };
    let extracted = extract_allowed(&shadow);
    if extracted.is_empty() {
        tracing::debug!("host config has no fields to merge");
        return Ok(false);
    }

    let existing = if target_path.exists() {
        match read_json_object(target_path) {
            Some(map) => map,
            None => {
                tracing::warn!(path = %target_path.display(), "leaving unparsable agent config untouched");
                return Ok(false);
            }
        }
    } else {
        Map::new()
    };

    let mut merged = existing.clone();
    merge_into(&mut merged, &extracted);
    if merged == existing && target_path.exists() {
        return Ok(false);
    }
    write_json_object(target_path, &merged)?;
    Ok(true)
}

fn write_json_object(path: &Path, map: &Map<String, Value>) -> Result<(), BoxError> {
    let mut text = serde_json::to_string_pretty(map)?;
    text.push('\n');
    write_atomic_text_file(path, &text, Some(0o600))
}

fn write_atomic_text_file(path: &Path, content: &str, mode: Option<u32>) -> Result<(), BoxError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "agentbox".to_string()),
        std::process::id(),
        ts
    ));
    fs::write(&tmp_path, content)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn force_symlink(target: &Path, link_path: &Path) -> Result<(), BoxError> {
    match fs::symlink_metadata(link_path) {
        Ok(meta) => {
            if meta.file_type().is_dir() {
                return Err(BoxError::Process(format!(
                    "refusing to replace directory with symlink: {}",
                    link_path.display()
                )));
            }
            fs::remove_file(link_path)?;
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(BoxError::Io(err)),
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(target, link_path)?;
    #[cfg(not(unix))]
    let _ = target;
    Ok(())
}

/// Links the forwarded GPG extra socket where the in-container agent expects
/// its socket. `resolve` reports that location; `None` falls back to
/// `~/.gnupg/S.gpg-agent`.
pub fn link_gpg_socket<F>(extra_socket: &Path, home: &Path, resolve: F) -> Result<Option<PathBuf>, BoxError>
where
    F: FnOnce() -> Option<PathBuf>,
{
    if fs::symlink_metadata(extra_socket).is_err() {
        return Ok(None);
    }
    let socket = resolve().unwrap_or_else(|| home.join(".gnupg").join("S.gpg-agent"));
    if socket == extra_socket {
        return Ok(Some(socket));
    }
    if let Some(parent) = socket.parent() {
        fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
        }
    }
    force_symlink(extra_socket, &socket)?;
    Ok(Some(socket))
}

/// Any HTTP response within the timeout counts as reachable.
pub fn aux_service_reachable(port: u16) -> bool {
    let client = match reqwest::blocking::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .no_proxy()
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::debug!(%err, "unable to build probe client");
            return false;
        }
    };
    match client.get(format!("http://127.0.0.1:{port}/")).send() {
        Ok(response) => {
            tracing::debug!(port, status = %response.status(), "auxiliary service answered");
            true
        }
        Err(err) => {
            tracing::debug!(port, %err, "auxiliary service unreachable");
            false
        }
    }
}

pub fn http_registration(port: u16) -> Value {
    json!({ "type": "http", "url": format!("http://localhost:{port}/mcp") })
}

pub fn stdio_registration() -> Value {
    json!({
        "type": "stdio",
        "command": AUX_SERVICE_NAME,
        "args": ["start-mcp-server", "--context", "ide-assistant"],
        "env": {}
    })
}

/// Points the auxiliary service registration at the HTTP endpoint when it is
/// reachable, and back at the spawned default when an HTTP entry we wrote no
/// longer answers. Returns whether `config` changed.
pub fn apply_aux_registration(config: &mut Map<String, Value>, port: u16, reachable: bool) -> bool {
    let http = http_registration(port);
    let current = config
        .get("mcpServers")
        .and_then(|servers| servers.get(AUX_SERVICE_NAME));
    let desired = if reachable {
        http
    } else if current == Some(&http) {
        stdio_registration()
    } else {
        return false;
    };
    if current == Some(&desired) {
        return false;
    }
    let servers = config
        .entry("mcpServers")
        .or_insert_with(|| Value::Object(Map::new()));
    if !servers.is_object() {
        *servers = Value::Object(Map::new());
    }
    if let Value::Object(servers) = servers {
        servers.insert(AUX_SERVICE_NAME.to_string(), desired);
    }
    true
}

pub fn register_aux_service(target_path: &Path, port: u16, reachable: bool) -> Result<bool, BoxError> {
    let mut config = if target_path.exists() {
        match read_json_object(target_path) {
            Some(map) => map,
            None => return Ok(false),
        }
    } else if reachable {
        Map::new()
    } else {
        return Ok(false);
    };
    if !apply_aux_registration(&mut config, port, reachable) {
        return Ok(false);
    }
    write_json_object(target_path, &config)?;
    Ok(true)
}

pub fn aux_port_from_env() -> u16 {
    env::var(AUX_PORT_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(DEFAULT_AUX_PORT)
}

/// Every step degrades to a logged no-op; a container start never fails here.
pub fn run(paths: &ContainerPaths, port: u16) {
    match merge_host_config(&paths.shadow, &paths.target) {
        Ok(true) => tracing::info!("merged host identity into agent config"),
        Ok(false) => {}
        Err(err) => tracing::warn!(%err, "host config merge failed"),
    }
    match link_gpg_socket(&paths.gpg_extra_socket, &paths.home, || {
        mounts::gpgconf_dir("agent-socket")
    }) {
        Ok(Some(socket)) => tracing::debug!(socket = %socket.display(), "linked gpg agent socket"),
        Ok(None) => {}
        Err(err) => tracing::warn!(%err, "gpg socket link failed"),
    }
    let reachable = aux_service_reachable(port);
    if let Err(err) = register_aux_service(&paths.target, port, reachable) {
        tracing::warn!(%err, "auxiliary service registration failed");
    }
    if let Some(parent) = paths.ready_marker.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let Err(err) = fs::write(&paths.ready_marker, b"") {
        tracing::debug!(%err, "unable to write readiness marker");
    }
}

/// Replaces the current process with `command` (or a login shell) in `workspace`.
#[cfg(unix)]
pub fn exec_session(workspace: Option<&Path>, command: &[String]) -> BoxError {
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    if let Some(dir) = workspace.filter(|dir| dir.is_dir()) {
        if let Err(err) = env::set_current_dir(dir) {
            tracing::debug!(dir = %dir.display(), %err, "unable to enter workspace");
        }
    }
    let mut cmd = match command.split_first() {
        Some((program, rest)) => {
            let mut cmd = Command::new(program);
            cmd.args(rest);
            cmd
        }
        None => {
            let mut cmd = Command::new("/bin/zsh");
            cmd.arg("-l");
            cmd
        }
    };
    BoxError::Io(cmd.exec())
}

#[cfg(not(unix))]
pub fn exec_session(_workspace: Option<&Path>, _command: &[String]) -> BoxError {
    BoxError::Process("container init is only supported inside Linux containers".to_string())
}
