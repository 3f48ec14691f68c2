//! `swarm` CLI
//!
//! Manage containers on a remote daemon and attach the local terminal to
//! their processes.

use std::path::Path;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use swarm_cli::api_cmd::{self, ApiAction};
use swarm_cli::container_cmd::{self, ContainerAction};
use swarm_cli::engine::EngineClient;
use swarm_cli::session_cmd::{self, AttachArgs, ExecArgs, RunArgs};
use swarm_core::ApiRegistry;
use swarm_core::tracing_init::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "swarm")]
#[command(version, about = "Remote container manager with interactive session relay", long_about = None)]
struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command in a running container
    Exec(ExecArgs),
    /// Attach the terminal to a running container
    Attach(AttachArgs),
    /// Create and start a container
    Run(RunArgs),
    /// Start one or more containers
    Start {
        #[arg(required = true)]
        containers: Vec<String>,
    },
    /// Stop one or more containers
    Stop {
        /// Seconds to wait before killing
        #[arg(short, long, default_value_t = 10)]
        time: u32,
        #[arg(required = true)]
        containers: Vec<String>,
    },
    /// Restart one or more containers
    Restart {
        /// Seconds to wait before killing
        #[arg(short, long, default_value_t = 10)]
        time: u32,
        #[arg(required = true)]
        containers: Vec<String>,
    },
    /// Remove one or more containers
    Rm {
        /// Kill a running container first
        #[arg(short, long)]
        force: bool,
        /// Remove the container's anonymous volumes
        #[arg(long)]
        volumes: bool,
        #[arg(required = true)]
        containers: Vec<String>,
    },
    /// Send a signal to one or more containers
    Kill {
        /// Signal to send
        #[arg(short, long, default_value = "KILL")]
        signal: String,
        #[arg(required = true)]
        containers: Vec<String>,
    },
    /// Manage the registry of remote APIs
    Api {
        #[command(subcommand)]
        action: ApiAction,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = if cli.verbose { "swarm=debug" } else { "swarm=warn" };
    init_tracing(filter, cli.log_json);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting swarm CLI");

    let path = ApiRegistry::default_path().context("Cannot determine home directory")?;
    match cli.command {
        Commands::Api { action } => api_cmd::run(action, &path),
        Commands::Exec(args) => session_cmd::exec(&connect(&path)?, args),
        Commands::Attach(args) => session_cmd::attach(&connect(&path)?, &args),
        Commands::Run(args) => session_cmd::run(&connect(&path)?, args),
        Commands::Start { containers } => lifecycle(&path, &ContainerAction::Start, &containers),
        Commands::Stop { time, containers } => lifecycle(
            &path,
            &ContainerAction::Stop { timeout_secs: time },
            &containers,
        ),
        Commands::Restart { time, containers } => lifecycle(
            &path,
            &ContainerAction::Restart { timeout_secs: time },
            &containers,
        ),
        Commands::Rm {
            force,
            volumes,
            containers,
        } => lifecycle(
            &path,
            &ContainerAction::Remove { force, volumes },
            &containers,
        ),
        Commands::Kill { signal, containers } => {
            lifecycle(&path, &ContainerAction::Kill { signal }, &containers)
        }
    }
}

fn lifecycle(path: &Path, action: &ContainerAction, containers: &[String]) -> anyhow::Result<()> {
    container_cmd::run(&connect(path)?, action, containers)
}

fn connect(path: &Path) -> anyhow::Result<EngineClient> {
    let registry = ApiRegistry::load_from(path)?.with_env_overrides();
    EngineClient::from_registry(&registry)
}
