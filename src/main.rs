mod build_context;
mod config;
mod docker;
mod error;
mod image;
mod lifecycle;
mod mounts;
mod plugins;
mod reconcile;

use crate::build_context::{render_dockerfile, Arch};
use crate::config::{
    read_config, resolve_config_path, CliOverrides, HostOs, Identity, Integration,
    SessionBuilder, SessionConfig, VERBOSE_ENV,
};
use crate::docker::{Docker, RealDockerRunner};
use crate::error::{BoxError, ProcessErrorDetails};
use crate::image::{ImageRequest, ImageResolver, ImageState};
use crate::lifecycle::{Lifecycle, LaunchOutcome};
use crate::mounts::HostFacts;
use clap::{CommandFactory, Parser};
use clap_complete::Shell;
use dialoguer::console::style;
use dialoguer::Confirm;
use dirs::home_dir;
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "agentbox",
    version,
    about = "Run an AI coding agent in a persistent per-workspace container"
)]
struct Cli {
    /// Workspace directory to mount (defaults to the current directory).
    #[arg(short = 'w', long)]
    workspace: Option<PathBuf>,
    /// Host agent config directory (defaults to ~/.claude).
    #[arg(long = "config-dir")]
    config_dir: Option<PathBuf>,
    /// agentbox config file.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    image: Option<String>,
    /// Username inside the container.
    #[arg(long)]
    user: Option<String>,
    /// Remove the container when the session ends.
    #[arg(long, overrides_with = "no_ephemeral")]
    ephemeral: bool,
    #[arg(long = "no-ephemeral", overrides_with = "ephemeral")]
    no_ephemeral: bool,
    #[arg(short = 'i', long, overrides_with = "no_interactive")]
    interactive: bool,
    #[arg(long = "no-interactive", overrides_with = "interactive")]
    no_interactive: bool,
    #[arg(long, overrides_with = "no_privileged")]
    privileged: bool,
    #[arg(long = "no-privileged", overrides_with = "privileged")]
    no_privileged: bool,
    /// Keep the agent's permission prompts.
    #[arg(long)]
    safe: bool,
    /// Forward the GnuPG home and agent socket.
    #[arg(long, overrides_with = "no_gpg")]
    gpg: bool,
    #[arg(long = "no-gpg", overrides_with = "gpg")]
    no_gpg: bool,
    /// Build the image locally.
    #[arg(long)]
    build: bool,
    #[arg(long = "force-pull")]
    force_pull: bool,
    /// Remove stopped sessions and the image, then build.
    #[arg(long = "force-rebuild")]
    force_rebuild: bool,
    /// Replace the existing session container.
    #[arg(long)]
    recreate: bool,
    #[arg(short = 'v', long)]
    verbose: bool,
    /// Print runtime mutations instead of running them.
    #[arg(long = "dry-run")]
    dry_run: bool,
    #[arg(long = "remove-stopped")]
    remove_stopped: bool,
    #[arg(long = "force-remove-all")]
    force_remove_all: bool,
    #[arg(long = "export-dockerfile", value_name = "PATH")]
    export_dockerfile: Option<PathBuf>,
    #[arg(long, value_name = "REPOSITORY")]
    push: Option<String>,
    #[arg(long, value_name = "SHELL")]
    completions: Option<Shell>,
    /// Extra Debian package for the image (repeatable, requires --build or --force-rebuild).
    #[arg(long = "package", value_name = "PKG")]
    packages: Vec<String>,
    /// Forward a host variable (`NAME`), or stop forwarding one (`!NAME`).
    #[arg(short = 'E', long = "env", value_name = "DIRECTIVE")]
    env: Vec<String>,
    #[arg(long = "with", value_enum, value_name = "INTEGRATION")]
    with: Vec<Integration>,
    #[arg(long = "selective-config", conflicts_with = "full_config")]
    selective_config: bool,
    #[arg(long = "full-config")]
    full_config: bool,
    #[arg(long)]
    json: bool,
    #[arg(long = "container-init", hide = true)]
    container_init: bool,
    /// Command to run in the session (defaults to a login shell).
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn flag_pair(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            workspace: self.workspace.clone(),
            config_dir: self.config_dir.clone(),
            name: self.name.clone(),
            image: self.image.clone(),
            ephemeral: flag_pair(self.ephemeral, self.no_ephemeral),
            interactive: flag_pair(self.interactive, self.no_interactive),
            privileged: flag_pair(self.privileged, self.no_privileged),
            safe: self.safe,
            gpg: flag_pair(self.gpg, self.no_gpg),
            selective_config: self.selective_config,
            full_config: self.full_config,
            build_requested: self.build || self.force_rebuild,
            packages: self.packages.clone(),
            env: self.env.clone(),
            integrations: self.with.clone(),
            verbose: self.verbose,
            command: self.command.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Serialize)]
struct SessionReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<ImageState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    launch: Option<LaunchOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    removed: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exported: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pushed: Option<String>,
    dry_run: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    planned: Vec<String>,
}

impl SessionReport {
    fn new(dry_run: bool) -> Self {
        Self {
            image: None,
            launch: None,
            removed: None,
            exported: None,
            pushed: None,
            dry_run,
            planned: Vec::new(),
        }
    }

    fn exit_code(&self) -> i32 {
        self.launch.as_ref().map_or(0, |launch| launch.exit_code)
    }
}

fn env_verbose() -> bool {
    env::var(VERBOSE_ENV)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .try_init();
}

fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose || env_verbose());

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "agentbox", &mut io::stdout());
        return Ok(());
    }
    if cli.container_init {
        return Err(container_init(&cli.command));
    }

    let json = cli.json;
    match run(&cli) {
        Ok(report) => {
            if json {
                print_json(&JsonResult {
                    ok: true,
                    result: Some(&report),
                    error: None,
                    error_details: None,
                })?;
            } else if report.dry_run {
                print_plan(&report.planned);
            }
            std::process::exit(report.exit_code());
        }
        Err(err) => {
            if let Some(code) = err.error_code() {
                tracing::debug!(error_code = code, "runtime failure");
            }
            if json {
                let payload = JsonResult::<serde_json::Value> {
                    ok: false,
                    result: None,
                    error: Some(err.to_string()),
                    error_details: err.details().cloned(),
                };
                print_json(&payload)?;
            } else {
                eprintln!("{} {err}", style("error:").red().bold());
            }
            std::process::exit(1);
        }
    }
}

fn container_init(command: &[String]) -> BoxError {
    let Some(home) = home_dir() else {
        return BoxError::Config("unable to resolve $HOME inside the container".to_string());
    };
    reconcile::run(
        &reconcile::ContainerPaths::for_home(&home),
        reconcile::aux_port_from_env(),
    );
    let workspace = env::var_os("AGENTBOX_WORKSPACE").map(PathBuf::from);
    reconcile::exec_session(workspace.as_deref(), command)
}

fn assemble_session(cli: &Cli) -> Result<SessionConfig, BoxError> {
    let file = read_config(&resolve_config_path(cli.config.as_ref()))?;
    let vars: BTreeMap<String, String> = env::vars().collect();
    let home = home_dir().ok_or_else(|| {
        BoxError::Config("unable to resolve $HOME; set HOME to an existing directory".to_string())
    })?;
    let identity = Identity::detect(cli.user.as_deref())?;
    SessionBuilder::from_file(file)?
        .with_env(&vars)?
        .build(
            &cli.overrides(),
            identity,
            HostOs::current(),
            &home,
            io::stdin().is_terminal(),
        )
}

fn run(cli: &Cli) -> Result<SessionReport, BoxError> {
    // All user input is validated here, before the runtime is touched.
    let session = assemble_session(cli)?;
    let runner = RealDockerRunner::detect();
    tracing::debug!(program = %runner.program().display(), container = %session.container_name, "session assembled");
    let docker = Docker::new(&runner, cli.dry_run);
    let mut report = SessionReport::new(docker.dry_run());

    if let Some(path) = &cli.export_dockerfile {
        let arch = Arch::detect(&docker);
        fs::write(path, render_dockerfile(arch, &session.packages))?;
        if !cli.json {
            println!("{} {}", style("Wrote").green(), path.display());
        }
        report.exported = Some(path.clone());
    } else if cli.remove_stopped {
        let removed = lifecycle::remove_stopped(&docker)?;
        if !cli.json {
            println!("Removed {} stopped container(s)", removed.len());
        }
        report.removed = Some(removed);
    } else if cli.force_remove_all {
        let interactive = io::stdin().is_terminal() && !cli.json;
        let removed = lifecycle::force_remove_all(&docker, |names| confirm_removal(names, interactive))?;
        match &removed {
            Some(names) if !cli.json => println!("Removed {} container(s)", names.len()),
            None if !cli.json => println!("Nothing removed"),
            _ => {}
        }
        report.removed = Some(removed.unwrap_or_default());
    } else {
        let request = ImageRequest::from_flags(cli.build, cli.force_pull, cli.force_rebuild);
        let resolver = ImageResolver::new(&docker, &session).bundle_binary(true);
        report.image = Some(resolver.resolve(request)?);
        if let Some(repository) = &cli.push {
            resolver.push(repository)?;
            report.pushed = Some(repository.clone());
        } else {
            let facts = HostFacts::collect(&session)?;
            let params = mounts::evaluate(&session, &facts)?;
            report.launch = Some(Lifecycle::new(&docker, &session).launch(&params, cli.recreate)?);
        }
    }

    report.planned = docker.planned();
    Ok(report)
}

fn confirm_removal(names: &[String], interactive: bool) -> Result<bool, BoxError> {
    if !interactive {
        eprintln!(
            "{} --force-remove-all needs an interactive confirmation; nothing removed",
            style("warning:").yellow().bold()
        );
        return Ok(false);
    }
    eprintln!("Managed containers:");
    for name in names {
        eprintln!("  {name}");
    }
    let confirmed = Confirm::new()
        .with_prompt(format!("Remove all {} agentbox container(s)?", names.len()))
        .default(false)
        .interact()?;
    Ok(confirmed)
}

fn print_plan(planned: &[String]) {
    if planned.is_empty() {
        println!("Dry run: no changes needed");
        return;
    }
    println!("{}", style("Dry run, planned commands:").bold());
    for command in planned {
        println!("  {command}");
    }
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), BoxError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
