use crate::config::{Identity, MarketplaceConfig, BASE_PACKAGES};
use crate::docker::{args, Docker, DockerRunner};
use crate::error::BoxError;
use crate::plugins::{self, PluginEnablementSnapshot};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

pub const GO_VERSION: &str = "1.23.4";
pub const NEOVIM_VERSION: &str = "v0.10.4";
const BASE_IMAGE: &str = "debian:bookworm-slim";
const NVM_INSTALLER: &str = "https://raw.githubusercontent.com/nvm-sh/nvm/v0.40.1/install.sh";
const OH_MY_ZSH_INSTALLER: &str =
    "https://raw.githubusercontent.com/ohmyzsh/ohmyzsh/master/tools/install.sh";
const UV_INSTALLER: &str = "https://astral.sh/uv/install.sh";
const AGENT_NPM_PACKAGE: &str = "@anthropic-ai/claude-code";
const AUX_SERVICE_SOURCE: &str = "git+https://github.com/oraios/serena";

pub const ENTRYPOINT_SCRIPT: &str = include_str!("../assets/entrypoint.sh");
pub const EXEC_WRAPPER_SCRIPT: &str = include_str!("../assets/agentbox-exec.sh");
pub const PROFILE_SCRIPT: &str = include_str!("../assets/profile.sh");

pub const ENTRYPOINT_PATH: &str = "/usr/local/bin/agentbox-entrypoint";
pub const EXEC_WRAPPER_PATH: &str = "/usr/local/bin/agentbox-exec";
pub const PROFILE_PATH: &str = "/etc/profile.d/agentbox.sh";
pub const RUNTIME_DIR: &str = "/run/agentbox";
pub const READY_MARKER: &str = "/run/agentbox/ready";

/// Context-relative locations of generated content.
const SCRIPTS_DIR: &str = "scripts";
const BAKE_HOME_DIR: &str = "bake/home";
const BIN_DIR: &str = "bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" => Some(Self::Amd64),
            "aarch64" | "arm64" => Some(Self::Arm64),
            _ => None,
        }
    }

    /// Architecture the image builder reports, falling back to the host's.
    pub fn detect<R: DockerRunner>(docker: &Docker<'_, R>) -> Self {
        let reported = docker
            .query(&args(["info", "--format", "{{.Architecture}}"]))
            .ok()
            .filter(|output| output.success())
            .and_then(|output| Self::parse(&output.stdout_text()));
        if let Some(arch) = reported {
            return arch;
        }
        tracing::debug!(host = std::env::consts::ARCH, "docker did not report an architecture");
        Self::host().unwrap_or(Self::Amd64)
    }

    pub fn host() -> Option<Self> {
        Self::parse(std::env::consts::ARCH)
    }

    fn go_arch(self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
        }
    }

    fn neovim_arch(self) -> &'static str {
        match self {
            Self::Amd64 => "x86_64",
            Self::Arm64 => "arm64",
        }
    }

    pub fn go_url(self) -> String {
        format!(
            "https://go.dev/dl/go{GO_VERSION}.linux-{}.tar.gz",
            self.go_arch()
        )
    }

    pub fn neovim_url(self) -> String {
        format!(
            "https://github.com/neovim/neovim/releases/download/{NEOVIM_VERSION}/nvim-linux-{}.tar.gz",
            self.neovim_arch()
        )
    }
}

fn continued(lines: &[String]) -> String {
    lines.join(" \\\n    ")
}

/// Renders the multi-stage Dockerfile. Output depends only on the
/// architecture and the extra package list.
pub fn render_dockerfile(arch: Arch, extra_packages: &[String]) -> String {
    let mut packages: Vec<String> = BASE_PACKAGES.iter().map(|p| p.to_string()).collect();
    packages.extend(extra_packages.iter().cloned());
    let package_lines: Vec<String> = packages.iter().map(|p| format!("    {p}")).collect();

    let mut out = String::new();
    let _ = writeln!(out, "# Generated by agentbox {}.", env!("CARGO_PKG_VERSION"));
    let _ = writeln!(out, "FROM {BASE_IMAGE} AS base");
    let _ = writeln!(out, "ENV DEBIAN_FRONTEND=noninteractive LANG=C.UTF-8");
    let _ = writeln!(
        out,
        "RUN apt-get update \\\n    && apt-get install -y --no-install-recommends \\\n{} \\\n    && rm -rf /var/lib/apt/lists/*",
        package_lines.join(" \\\n")
    );
    out.push('\n');

    let _ = writeln!(out, "FROM base AS toolchain");
    let _ = writeln!(
        out,
        "RUN {}",
        continued(&[
            format!("curl -fsSL {} | tar -C /usr/local -xz", arch.go_url()),
            "&& ln -s /usr/local/go/bin/go /usr/local/bin/go".to_string(),
        ])
    );
    let _ = writeln!(
        out,
        "RUN {}",
        continued(&[
            format!("curl -fsSL {} | tar -C /opt -xz", arch.neovim_url()),
            format!(
                "&& ln -s /opt/nvim-linux-{}/bin/nvim /usr/local/bin/nvim",
                arch.neovim_arch()
            ),
        ])
    );
    out.push('\n');

    let _ = writeln!(out, "FROM toolchain AS userenv");
    let _ = writeln!(out, "ARG USERNAME=agent");
    let _ = writeln!(out, "ARG USER_UID=1000");
    let _ = writeln!(out, "ARG USER_GID=1000");
    let _ = writeln!(
        out,
        "RUN {}",
        continued(&[
            "(getent group ${USER_GID} >/dev/null || groupadd --gid ${USER_GID} ${USERNAME})".to_string(),
            "&& useradd --non-unique --uid ${USER_UID} --gid ${USER_GID} --create-home --shell /bin/zsh ${USERNAME}".to_string(),
            "&& echo \"${USERNAME} ALL=(ALL) NOPASSWD:ALL\" > /etc/sudoers.d/${USERNAME}".to_string(),
            "&& chmod 0440 /etc/sudoers.d/${USERNAME}".to_string(),
        ])
    );
    let _ = writeln!(out, "USER ${{USERNAME}}");
    let _ = writeln!(out, "WORKDIR /home/${{USERNAME}}");
    let _ = writeln!(out, "ENV NVM_DIR=/home/${{USERNAME}}/.nvm");
    let _ = writeln!(
        out,
        "RUN sh -c \"$(curl -fsSL {OH_MY_ZSH_INSTALLER})\" \"\" --unattended"
    );
    let _ = writeln!(
        out,
        "RUN {}",
        continued(&[
            format!("curl -fsSL {NVM_INSTALLER} | bash"),
            "&& . \"$NVM_DIR/nvm.sh\"".to_string(),
            "&& nvm install --lts".to_string(),
            "&& ln -s \"$NVM_DIR/versions/node/$(nvm version default)\" \"$NVM_DIR/current\"".to_string(),
        ])
    );
    let _ = writeln!(out, "RUN curl -LsSf {UV_INSTALLER} | sh");
    let _ = writeln!(
        out,
        "ENV PATH=/home/${{USERNAME}}/.nvm/current/bin:/home/${{USERNAME}}/.local/bin:/usr/local/go/bin:$PATH"
    );
    out.push('\n');

    let _ = writeln!(out, "FROM userenv AS agent");
    let _ = writeln!(out, "ARG USERNAME=agent");
    let _ = writeln!(out, "RUN npm install -g {AGENT_NPM_PACKAGE}");
    let _ = writeln!(
        out,
        "RUN {}",
        continued(&[
            format!("uv tool install --from {AUX_SERVICE_SOURCE} serena"),
            "&& claude mcp add --scope user serena -- serena start-mcp-server --context ide-assistant".to_string(),
        ])
    );
    let _ = writeln!(
        out,
        "COPY --chown=${{USERNAME}} {BAKE_HOME_DIR}/ /home/${{USERNAME}}/"
    );
    let _ = writeln!(out, "USER root");
    let _ = writeln!(out, "COPY {BIN_DIR}/ /usr/local/bin/");
    let _ = writeln!(out, "COPY {SCRIPTS_DIR}/entrypoint.sh {ENTRYPOINT_PATH}");
    let _ = writeln!(out, "COPY {SCRIPTS_DIR}/agentbox-exec.sh {EXEC_WRAPPER_PATH}");
    let _ = writeln!(out, "COPY {SCRIPTS_DIR}/profile.sh {PROFILE_PATH}");
    let _ = writeln!(
        out,
        "RUN {}",
        continued(&[
            format!("chmod 0755 {ENTRYPOINT_PATH} {EXEC_WRAPPER_PATH}"),
            format!("&& echo \"emulate sh -c 'source {PROFILE_PATH}'\" >> /etc/zsh/zshrc"),
        ])
    );
    let _ = writeln!(out, "USER ${{USERNAME}}");
    let _ = writeln!(out, "ENTRYPOINT [\"{ENTRYPOINT_PATH}\"]");
    let _ = writeln!(out, "CMD [\"/bin/zsh\", \"-l\"]");
    out
}

/// Everything the build context depends on besides the Dockerfile inputs.
pub struct ContextInputs<'a> {
    pub arch: Arch,
    pub packages: &'a [String],
    pub identity: &'a Identity,
    pub config_dir: &'a Path,
    pub marketplace: &'a MarketplaceConfig,
    /// Host binary copied into the image so the entrypoint can run
    /// `agentbox --container-init`.
    pub bundled_binary: Option<PathBuf>,
}

/// Host binary that can run inside an image of `arch`, if any.
pub fn bundleable_binary(arch: Arch) -> Option<PathBuf> {
    if !cfg!(target_os = "linux") || Arch::host() != Some(arch) {
        return None;
    }
    std::env::current_exe().ok().filter(|path| path.is_file())
}

pub fn write_build_context(dir: &Path, inputs: &ContextInputs<'_>) -> Result<(), BoxError> {
    fs::create_dir_all(dir)?;
    fs::write(
        dir.join("Dockerfile"),
        render_dockerfile(inputs.arch, inputs.packages),
    )?;

    let scripts = dir.join(SCRIPTS_DIR);
    fs::create_dir_all(&scripts)?;
    for (name, content) in [
        ("entrypoint.sh", ENTRYPOINT_SCRIPT),
        ("agentbox-exec.sh", EXEC_WRAPPER_SCRIPT),
        ("profile.sh", PROFILE_SCRIPT),
    ] {
        write_script(&scripts.join(name), content)?;
    }

    let bin = dir.join(BIN_DIR);
    fs::create_dir_all(&bin)?;
    if let Some(binary) = &inputs.bundled_binary {
        fs::copy(binary, bin.join("agentbox"))?;
    }

    let stage_home = dir.join(BAKE_HOME_DIR);
    fs::create_dir_all(&stage_home)?;
    bake_plugins(inputs, &stage_home);
    Ok(())
}

fn write_script(path: &Path, content: &str) -> Result<(), BoxError> {
    fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Plugin bake-in never blocks the build; failures leave the overlay empty.
fn bake_plugins(inputs: &ContextInputs<'_>, stage_home: &Path) {
    let snapshot = PluginEnablementSnapshot::read(&inputs.config_dir.join("settings.json"));
    if !snapshot.has_enabled() {
        tracing::debug!("no enabled plugins to bake");
        return;
    }
    let result = tempfile::tempdir()
        .map_err(BoxError::from)
        .and_then(|clone_dir| {
            let root = clone_dir.path().join(&inputs.marketplace.name);
            let marketplace = plugins::clone_marketplace(inputs.marketplace, &root)?;
            let plan = plugins::plan_bake(
                &snapshot,
                &marketplace,
                &inputs.identity.container_home(),
                chrono::Utc::now(),
            );
            plugins::write_bake(&plan, &marketplace, stage_home)?;
            Ok((plan.copies.len(), plan.skipped.len()))
        });
    match result {
        Ok((count, skipped)) => tracing::info!(count, skipped, "baked plugins into build context"),
        Err(err) => tracing::warn!(%err, "skipping plugin bake-in"),
    }
}
