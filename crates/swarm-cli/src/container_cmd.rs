//! Container lifecycle commands: start, stop, restart, rm, kill.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};

use glob::Pattern;
use swarm_relay::DaemonError;
use tracing::debug;

use crate::engine::EngineClient;

/// A lifecycle operation applied to each named container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerAction {
    Start,
    Stop { timeout_secs: u32 },
    Restart { timeout_secs: u32 },
    Remove { force: bool, volumes: bool },
    Kill { signal: String },
}

impl ContainerAction {
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop { .. } => "stop",
            Self::Restart { .. } => "restart",
            Self::Remove { .. } => "remove",
            Self::Kill { .. } => "kill",
        }
    }

    fn apply(&self, client: &EngineClient, container: &str) -> Result<(), DaemonError> {
        match self {
            Self::Start => client.start_container(container),
            Self::Stop { timeout_secs } => client.stop_container(container, *timeout_secs),
            Self::Restart { timeout_secs } => client.restart_container(container, *timeout_secs),
            Self::Remove { force, volumes } => client.remove_container(container, *force, *volumes),
            Self::Kill { signal } => client.kill_container(container, signal),
        }
    }
}

/// Whether `name` should be matched against existing containers.
fn is_pattern(name: &str) -> bool {
    name.contains(['*', '?', '['])
}

/// Replace wildcard arguments with the container names they match. The
/// container list is fetched at most once, and only if a pattern is present.
pub fn expand_names<F>(names: &[String], list: F) -> anyhow::Result<Vec<String>>
where
    F: FnOnce() -> Result<Vec<String>, DaemonError>,
{
    let mut list = Some(list);
    let mut known: Vec<String> = Vec::new();
    let mut expanded = Vec::with_capacity(names.len());
    for name in names {
        if !is_pattern(name) {
            expanded.push(name.clone());
            continue;
        }
        if let Some(fetch) = list.take() {
            known = fetch()?;
        }
        let pattern = Pattern::new(name)
            .map_err(|e| anyhow::anyhow!("Invalid container pattern `{name}`: {e}"))?;
        let before = expanded.len();
        expanded.extend(known.iter().filter(|c| pattern.matches(c)).cloned());
        debug!(%name, matched = expanded.len() - before, "Expanded container pattern");
    }
    Ok(expanded)
}

/// Apply `action` to every container in `names`, reporting each result.
/// Failures do not stop the batch; the command fails afterwards if any did.
pub fn run(client: &EngineClient, action: &ContainerAction, names: &[String]) -> anyhow::Result<()> {
    let targets = expand_names(names, || {
        let containers = client.list_containers(true)?;
        Ok(containers
            .iter()
            .flat_map(|c| c.short_names().map(str::to_string))
            .collect())
    })?;

    let mut out = io::stdout();
    let mut err = io::stderr();
    let mut failed = 0usize;
    for name in &targets {
        match action.apply(client, name) {
            Ok(()) => writeln!(out, "{name}")?,
            Err(e) => {
                writeln!(err, "Error: failed to {} {name}: {e}", action.verb())?;
                failed += 1;
            }
        }
    }
    if failed > 0 {
        anyhow::bail!(
            "Failed to {} {failed} of {} containers",
            action.verb(),
            targets.len()
        );
    }
    Ok(())
}
