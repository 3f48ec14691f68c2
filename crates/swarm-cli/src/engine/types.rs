//! Engine API request and response types.
//!
//! Field names follow the daemon's `PascalCase` JSON; only the fields the
//! CLI reads are declared.

use serde::{Deserialize, Serialize};
use swarm_relay::SessionInfo;

/// `GET /exec/{id}/json` (subset of fields).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecInspect {
    #[serde(default)]
    pub open_stdin: bool,
    #[serde(default)]
    pub open_stdout: bool,
    #[serde(default)]
    pub open_stderr: bool,
    #[serde(default)]
    pub process_config: ProcessConfig,
}

/// Process settings of an exec instance. These keys are lowercase on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessConfig {
    #[serde(default)]
    pub tty: bool,
}

impl From<&ExecInspect> for SessionInfo {
    fn from(exec: &ExecInspect) -> Self {
        Self {
            tty: exec.process_config.tty,
            stdin: exec.open_stdin,
            stdout: exec.open_stdout,
            stderr: exec.open_stderr,
        }
    }
}

/// `GET /containers/{id}/json` (subset of fields).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    #[serde(default)]
    pub config: ContainerConfigInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfigInfo {
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub attach_stdin: bool,
    #[serde(default)]
    pub attach_stdout: bool,
    #[serde(default)]
    pub attach_stderr: bool,
}

impl From<&ContainerInspect> for SessionInfo {
    fn from(container: &ContainerInspect) -> Self {
        let config = &container.config;
        Self {
            tty: config.tty,
            stdin: config.attach_stdin,
            stdout: config.attach_stdout,
            stderr: config.attach_stderr,
        }
    }
}

/// Entry of `GET /containers/json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
}

impl ContainerSummary {
    /// Container names without the leading path (`/node/web` → `web`).
    pub fn short_names(&self) -> impl Iterator<Item = &str> {
        self.names
            .iter()
            .filter_map(|name| name.rsplit('/').next())
            .filter(|name| !name.is_empty())
    }
}

/// `POST /containers/{id}/exec` body.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecConfig {
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
    pub cmd: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// `POST /containers/create` body.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub stdin_once: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

/// `POST /exec/{id}/start` body.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecStart {
    pub detach: bool,
    pub tty: bool,
}

/// Response carrying a newly created object's id.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Created {
    pub id: String,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

/// `POST /containers/{id}/wait` response.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitStatus {
    pub status_code: i64,
}

/// Error body the daemon sends with non-success statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}
