//! API registry subcommands: ls, add, use, unset, version.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};
use std::path::Path;

use clap::Subcommand;
use swarm_core::ApiRegistry;

/// API subcommand actions.
#[derive(Subcommand, Debug)]
pub enum ApiAction {
    /// List registered remote APIs
    Ls,
    /// Register a remote API
    Add {
        /// Name to refer to the API by
        name: String,
        /// Endpoint, e.g. tcp://10.0.0.5:2375
        url: String,
    },
    /// Make a registered API the active one
    Use {
        /// Registered API name
        name: String,
    },
    /// Remove a registered API, or `all`
    Unset {
        /// Registered API name or `all`
        name: String,
    },
    /// Show or pin the remote API version (`auto` for none)
    Version {
        /// Version such as 1.24, or `auto`
        version: Option<String>,
    },
}

/// Execute an api subcommand against the registry file at `path`.
pub fn run(action: ApiAction, path: &Path) -> anyhow::Result<()> {
    run_with(action, path, &mut io::stdout())
}

fn run_with<W: Write>(action: ApiAction, path: &Path, out: &mut W) -> anyhow::Result<()> {
    let mut registry = ApiRegistry::load_from(path)?;
    match action {
        ApiAction::Ls => {
            if registry.apis.is_empty() {
                writeln!(out, "No remote APIs registered. Run: swarm api add <name> <url>")?;
                return Ok(());
            }
            let current = registry.current();
            for (name, url) in &registry.apis {
                let marker = if Some(name.as_str()) == current { "*" } else { " " };
                writeln!(out, "{marker} {name:<16} {url}")?;
            }
            return Ok(());
        }
        ApiAction::Add { name, url } => {
            registry.add(&name, &url)?;
            writeln!(out, "Added {name}: {url}")?;
        }
        ApiAction::Use { name } => {
            registry.use_api(&name)?;
            writeln!(out, "Using {name}")?;
        }
        ApiAction::Unset { name } => {
            registry.unset(&name)?;
            writeln!(out, "Removed {name}")?;
        }
        ApiAction::Version { version: None } => {
            let version = registry.version.as_deref().unwrap_or("auto");
            writeln!(out, "{version}")?;
            return Ok(());
        }
        ApiAction::Version {
            version: Some(version),
        } => {
            registry.set_version(&version)?;
            writeln!(out, "API version: {version}")?;
        }
    }
    registry.save_to(path)?;
    Ok(())
}
