use crate::error::BoxError;
use clap::ValueEnum;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

pub const DEFAULT_IMAGE: &str = "agentbox:latest";
pub const DEFAULT_REMOTE_IMAGE: &str = "ghcr.io/agentbox-dev/agentbox:latest";
pub const DEFAULT_AUX_PORT: u16 = 8765;
pub const CONTAINER_NAME_PREFIX: &str = "agentbox";

pub const REMOTE_IMAGE_ENV: &str = "AGENTBOX_IMAGE";
pub const PACKAGES_ENV: &str = "AGENTBOX_PACKAGES";
pub const FORWARD_ENV_ENV: &str = "AGENTBOX_ENV";
pub const VERBOSE_ENV: &str = "AGENTBOX_VERBOSE";
pub const AUX_PORT_ENV: &str = "AGENTBOX_AUX_PORT";

/// Installed in the base layer of every image.
pub const BASE_PACKAGES: &[&str] = &[
    "build-essential",
    "ca-certificates",
    "chromium",
    "curl",
    "fd-find",
    "git",
    "gnupg",
    "jq",
    "less",
    "locales",
    "openssh-client",
    "procps",
    "python3",
    "ripgrep",
    "sudo",
    "tmux",
    "unzip",
    "wget",
    "xz-utils",
    "zsh",
];

/// Host variables forwarded into the container unless excluded with `!NAME`.
pub const BASE_FORWARD_ENV: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "ANTHROPIC_AUTH_TOKEN",
    "ANTHROPIC_BASE_URL",
    "ANTHROPIC_MODEL",
    "ANTHROPIC_SMALL_FAST_MODEL",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "OPENAI_API_KEY",
    "TERM",
    "COLORTERM",
    "TZ",
];

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ConfigMountMode {
    /// Only `settings.json` and `rules/`, read-only.
    Selective,
    /// The whole config directory, read-write.
    Full,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Integration {
    Aws,
    Gcloud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Linux,
    MacOs,
    Other,
}

impl HostOs {
    pub fn current() -> Self {
        Self::from_name(env::consts::OS)
    }

    pub fn from_name(os: &str) -> Self {
        match os {
            "linux" => Self::Linux,
            "macos" => Self::MacOs,
            _ => Self::Other,
        }
    }

    /// Host paths on this OS are meaningless inside the Linux container.
    pub fn path_incompatible(self) -> bool {
        self == Self::MacOs
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub version: u32,
    pub image: String,
    pub remote_image: String,
    pub packages: Vec<String>,
    pub env: Vec<String>,
    pub gpg: bool,
    pub privileged: bool,
    pub dangerous: bool,
    pub config_mount: Option<ConfigMountMode>,
    pub aux_port: u16,
    pub marketplace: MarketplaceConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MarketplaceConfig {
    pub name: String,
    pub repo: String,
    pub url: String,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            version: 1,
            image: DEFAULT_IMAGE.to_string(),
            remote_image: DEFAULT_REMOTE_IMAGE.to_string(),
            packages: Vec::new(),
            env: Vec::new(),
            gpg: false,
            privileged: false,
            dangerous: true,
            config_mount: None,
            aux_port: DEFAULT_AUX_PORT,
            marketplace: MarketplaceConfig::default(),
        }
    }
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            name: "claude-plugins-official".to_string(),
            repo: "anthropics/claude-plugins-official".to_string(),
            url: "https://github.com/anthropics/claude-plugins-official.git".to_string(),
        }
    }
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("AGENTBOX_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("agentbox");
    base
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("AGENTBOX_CONFIG") {
        return PathBuf::from(path);
    }
    default_config_dir().join("config.yaml")
}

pub fn read_config_from_str(content: &str) -> Result<FileConfig, BoxError> {
    let cfg: FileConfig = serde_yaml::from_str(content)?;
    if cfg.version != 1 {
        return Err(BoxError::Config(format!(
            "unsupported config version {} (expected 1)",
            cfg.version
        )));
    }
    if cfg.image.trim().is_empty() {
        return Err(BoxError::Config("image must not be empty".to_string()));
    }
    Ok(cfg)
}

/// A missing config file is not an error: every field has a default.
pub fn read_config(path: &Path) -> Result<FileConfig, BoxError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(FileConfig::default());
    }
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content).map_err(|err| match err {
        BoxError::Yaml(inner) => {
            BoxError::Config(format!("invalid config file {}: {inner}", path.display()))
        }
        other => other,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    pub fn detect(username_override: Option<&str>) -> Result<Self, BoxError> {
        let username = match username_override {
            Some(name) => name.to_string(),
            None => env::var("USER")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .or_else(|| id_output("-un"))
                .ok_or_else(|| {
                    BoxError::Config(
                        "unable to determine the current username; pass --user".to_string(),
                    )
                })?,
        };
        validate_username(&username)?;
        Ok(Self {
            username,
            uid: id_output("-u").and_then(|v| v.parse().ok()).unwrap_or(1000),
            gid: id_output("-g").and_then(|v| v.parse().ok()).unwrap_or(1000),
        })
    }

    pub fn container_home(&self) -> String {
        format!("/home/{}", self.username)
    }
}

fn id_output(flag: &str) -> Option<String> {
    let output = Command::new("id").arg(flag).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

pub fn validate_username(name: &str) -> Result<(), BoxError> {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid_first || !valid_rest || name.len() > 32 {
        return Err(BoxError::Config(format!(
            "invalid username '{name}': expected [a-z_][a-z0-9_-]* (override with --user)"
        )));
    }
    Ok(())
}

fn stable_path_hash(path: &Path) -> u64 {
    // FNV-1a, stable across runs and platforms.
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for byte in path.to_string_lossy().as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn sanitize_name_segment(segment: &str) -> String {
    let mut out = String::new();
    let mut last_dash = false;
    for c in segment.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed: String = out.trim_matches(|c| c == '-' || c == '.').chars().take(24).collect();
    trimmed
        .trim_end_matches(|c| c == '-' || c == '.')
        .to_string()
}

/// Name of the persistent container for a workspace: the last two path
/// segments plus a hash of the whole path, so `/a/proj` and `/b/proj` differ.
pub fn container_name_for(workspace: &Path) -> String {
    let segments: Vec<String> = workspace
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(sanitize_name_segment(&part.to_string_lossy())),
            _ => None,
        })
        .filter(|segment| !segment.is_empty())
        .collect();
    let tail_start = segments.len().saturating_sub(2);
    let mut parts = vec![CONTAINER_NAME_PREFIX.to_string()];
    parts.extend(segments[tail_start..].iter().cloned());
    parts.push(format!("{:08x}", stable_path_hash(workspace) & 0xffff_ffff));
    parts.join("-")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvDirective {
    Include(String),
    Exclude(String),
}

impl EnvDirective {
    pub fn parse(raw: &str) -> Result<Self, BoxError> {
        let raw = raw.trim();
        let (exclude, name) = match raw.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, raw.strip_prefix('+').unwrap_or(raw)),
        };
        validate_env_name(name)?;
        Ok(if exclude {
            Self::Exclude(name.to_string())
        } else {
            Self::Include(name.to_string())
        })
    }
}

fn validate_env_name(name: &str) -> Result<(), BoxError> {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_first || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BoxError::Config(format!(
            "invalid environment directive '{name}': expected NAME or !NAME"
        )));
    }
    Ok(())
}

/// Applies directives in order to an ordered set of variable names.
pub fn apply_env_directives(mut names: Vec<String>, directives: &[EnvDirective]) -> Vec<String> {
    for directive in directives {
        match directive {
            EnvDirective::Include(name) => {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
            EnvDirective::Exclude(name) => names.retain(|existing| existing != name),
        }
    }
    names
}

fn parse_directives<'a, I>(raw: I) -> Result<Vec<EnvDirective>, BoxError>
where
    I: IntoIterator<Item = &'a str>,
{
    raw.into_iter()
        .filter(|item| !item.trim().is_empty())
        .map(EnvDirective::parse)
        .collect()
}

fn validate_package_name(name: &str) -> Result<(), BoxError> {
    let valid = name.len() >= 2
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '+' | '-'));
    if !valid {
        return Err(BoxError::Config(format!(
            "invalid package name '{name}': expected a Debian package name"
        )));
    }
    Ok(())
}

/// Appends packages that are neither in the base list nor already present.
fn merge_packages(mut packages: Vec<String>, extra: &[String]) -> Result<Vec<String>, BoxError> {
    for package in extra.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        validate_package_name(package)?;
        if BASE_PACKAGES.contains(&package) || packages.iter().any(|p| p == package) {
            continue;
        }
        packages.push(package.to_string());
    }
    Ok(packages)
}

/// Everything the command line contributes to a session.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub workspace: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
    pub name: Option<String>,
    pub image: Option<String>,
    pub ephemeral: Option<bool>,
    pub interactive: Option<bool>,
    pub privileged: Option<bool>,
    pub safe: bool,
    pub gpg: Option<bool>,
    pub selective_config: bool,
    pub full_config: bool,
    pub build_requested: bool,
    pub packages: Vec<String>,
    pub env: Vec<String>,
    pub integrations: Vec<Integration>,
    pub verbose: bool,
    pub command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub workspace: PathBuf,
    pub identity: Identity,
    pub container_name: String,
    pub image: String,
    pub remote_image: String,
    pub interactive: bool,
    pub ephemeral: bool,
    pub privileged: bool,
    pub dangerous: bool,
    pub gpg: bool,
    pub verbose: bool,
    pub config_dir: PathBuf,
    pub config_mount: ConfigMountMode,
    pub packages: Vec<String>,
    pub forward_env: Vec<String>,
    pub integrations: Vec<Integration>,
    pub aux_port: u16,
    pub marketplace: MarketplaceConfig,
    pub command: Vec<String>,
}

/// Defaults, then the config file, then environment directives, then CLI
/// directives; `build` freezes the result into a [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    file: FileConfig,
    remote_image: String,
    packages: Vec<String>,
    forward_env: Vec<String>,
    aux_port: u16,
    verbose: bool,
}

impl SessionBuilder {
    pub fn from_file(file: FileConfig) -> Result<Self, BoxError> {
        let base: Vec<String> = BASE_FORWARD_ENV.iter().map(|s| s.to_string()).collect();
        let forward_env =
            apply_env_directives(base, &parse_directives(file.env.iter().map(String::as_str))?);
        let packages = merge_packages(Vec::new(), &file.packages)?;
        Ok(Self {
            remote_image: file.remote_image.clone(),
            aux_port: file.aux_port,
            packages,
            forward_env,
            verbose: false,
            file,
        })
    }

    pub fn with_env(mut self, vars: &BTreeMap<String, String>) -> Result<Self, BoxError> {
        if let Some(image) = vars.get(REMOTE_IMAGE_ENV).filter(|v| !v.trim().is_empty()) {
            self.remote_image = image.trim().to_string();
        }
        if let Some(raw) = vars.get(PACKAGES_ENV) {
            let extra: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
            self.packages = merge_packages(self.packages, &extra)?;
        }
        if let Some(raw) = vars.get(FORWARD_ENV_ENV) {
            let directives = parse_directives(raw.split_whitespace())?;
            self.forward_env = apply_env_directives(self.forward_env, &directives);
        }
        if let Some(raw) = vars.get(VERBOSE_ENV) {
            self.verbose = matches!(raw.trim(), "1" | "true" | "yes");
        }
        if let Some(raw) = vars.get(AUX_PORT_ENV).filter(|v| !v.trim().is_empty()) {
            self.aux_port = raw.trim().parse().map_err(|_| {
                BoxError::Config(format!("{AUX_PORT_ENV} must be a port number, got '{raw}'"))
            })?;
        }
        Ok(self)
    }

    pub fn build(
        self,
        cli: &CliOverrides,
        identity: Identity,
        os: HostOs,
        home: &Path,
        stdin_is_terminal: bool,
    ) -> Result<SessionConfig, BoxError> {
        if cli.selective_config && cli.full_config {
            return Err(BoxError::Config(
                "--selective-config and --full-config cannot be combined".to_string(),
            ));
        }
        if !cli.packages.is_empty() && !cli.build_requested {
            return Err(BoxError::Config(
                "--package only applies when building; add --build or --force-rebuild".to_string(),
            ));
        }

        let raw_workspace = match &cli.workspace {
            Some(path) => path.clone(),
            None => env::current_dir()?,
        };
        if !raw_workspace.is_dir() {
            return Err(BoxError::Config(format!(
                "workspace directory does not exist: {}",
                raw_workspace.display()
            )));
        }
        let workspace = fs::canonicalize(&raw_workspace)?;

        let packages = merge_packages(self.packages, &cli.packages)?;
        let forward_env = apply_env_directives(
            self.forward_env,
            &parse_directives(cli.env.iter().map(String::as_str))?,
        );

        let config_mount = if cli.selective_config {
            ConfigMountMode::Selective
        } else if cli.full_config {
            ConfigMountMode::Full
        } else if let Some(mode) = self.file.config_mount {
            mode
        } else if os.path_incompatible() {
            ConfigMountMode::Selective
        } else {
            ConfigMountMode::Full
        };

        let mut integrations = cli.integrations.clone();
        integrations.sort();
        integrations.dedup();

        let container_name = match &cli.name {
            Some(name) => name.clone(),
            None => container_name_for(&workspace),
        };

        Ok(SessionConfig {
            container_name,
            identity,
            image: cli.image.clone().unwrap_or(self.file.image),
            remote_image: self.remote_image,
            interactive: cli.interactive.unwrap_or(stdin_is_terminal),
            ephemeral: cli.ephemeral.unwrap_or(false),
            privileged: cli.privileged.unwrap_or(self.file.privileged),
            dangerous: self.file.dangerous && !cli.safe,
            gpg: cli.gpg.unwrap_or(self.file.gpg),
            verbose: self.verbose || cli.verbose,
            config_dir: cli
                .config_dir
                .clone()
                .unwrap_or_else(|| home.join(".claude")),
            config_mount,
            packages,
            forward_env,
            integrations,
            aux_port: self.aux_port,
            marketplace: self.file.marketplace,
            command: cli.command.clone(),
            workspace,
        })
    }
}
