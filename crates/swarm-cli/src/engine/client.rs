//! Engine API client.
//!
//! JSON endpoints go through a blocking reqwest client. Attaching hands the
//! relay a raw socket obtained by [`super::upgrade`].

use std::net::TcpStream;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use swarm_core::{ApiRegistry, Endpoint};
use swarm_relay::{Daemon, DaemonError, SessionInfo, SessionTarget, WindowSize};
use tracing::debug;

use super::types::{
    ContainerConfig, ContainerInspect, ContainerSummary, Created, ErrorBody, ExecConfig,
    ExecInspect, ExecStart, WaitStatus,
};
use super::upgrade;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Map a non-success status to a daemon error. `404` and `409` mean the
/// object (or its process) is gone or not running.
pub(crate) fn status_error(status: u16, message: String) -> DaemonError {
    match status {
        404 | 409 => DaemonError::Unavailable(message),
        _ => DaemonError::Api { status, message },
    }
}

/// The daemon's `{"message": ...}` body, or the raw text when it is not JSON.
pub(crate) fn error_message(body: &str) -> Option<String> {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        return Some(parsed.message);
    }
    let trimmed = body.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn transport(e: reqwest::Error) -> DaemonError {
    DaemonError::Transport(e.to_string())
}

/// Client for a Docker Engine-compatible remote daemon over plain HTTP.
#[derive(Debug, Clone)]
pub struct EngineClient {
    http: Client,
    endpoint: Endpoint,
    version: Option<String>,
    attach_logs: bool,
}

impl EngineClient {
    /// Create a client for `endpoint`, prefixing paths with `/v{version}`
    /// when a version is given.
    pub fn new(endpoint: Endpoint, version: Option<String>) -> Result<Self, DaemonError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None::<Duration>)
            .user_agent(concat!("swarm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(transport)?;
        Ok(Self {
            http,
            endpoint,
            version,
            attach_logs: false,
        })
    }

    /// Client for the registry's resolved endpoint and version.
    pub fn from_registry(registry: &ApiRegistry) -> anyhow::Result<Self> {
        let endpoint = registry.endpoint()?;
        let version = registry.api_version().map(str::to_string);
        debug!(%endpoint, version = version.as_deref().unwrap_or("auto"), "Using remote API");
        Ok(Self::new(endpoint, version)?)
    }

    /// Replay the container's earlier output when attaching.
    #[must_use]
    pub const fn with_attach_logs(mut self, logs: bool) -> Self {
        self.attach_logs = logs;
        self
    }

    /// Request path including the version prefix.
    pub(crate) fn api_path(&self, path: &str) -> String {
        match &self.version {
            Some(v) => format!("/v{v}{path}"),
            None => path.to_string(),
        }
    }

    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.base_url(), self.api_path(path))
    }

    /// Return the response for success statuses, or the mapped error.
    fn check_status(resp: Response) -> Result<Response, DaemonError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let reason = status.canonical_reason().unwrap_or("Unknown").to_string();
        let body = resp.text().unwrap_or_default();
        Err(status_error(
            status.as_u16(),
            error_message(&body).unwrap_or(reason),
        ))
    }

    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, DaemonError> {
        let resp = self.http.get(self.api_url(path)).send().map_err(transport)?;
        Self::check_status(resp)?.json().map_err(transport)
    }

    fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, DaemonError> {
        let resp = self
            .http
            .post(self.api_url(path))
            .json(body)
            .send()
            .map_err(transport)?;
        Self::check_status(resp)?.json().map_err(transport)
    }

    /// POST with no body; `304 Not Modified` (already in that state) counts
    /// as success.
    fn post_action(&self, path: &str) -> Result<(), DaemonError> {
        let resp = self.http.post(self.api_url(path)).send().map_err(transport)?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            debug!(%path, "Already in requested state");
            return Ok(());
        }
        Self::check_status(resp).map(drop)
    }

    // =========================================================================
    // Exec instances
    // =========================================================================

    pub fn inspect_exec(&self, id: &str) -> Result<ExecInspect, DaemonError> {
        self.get(&format!("/exec/{id}/json"))
    }

    /// Create an exec instance in `container`; returns its id.
    pub fn create_exec(&self, container: &str, config: &ExecConfig) -> Result<String, DaemonError> {
        let created: Created = self.post_json(&format!("/containers/{container}/exec"), config)?;
        Ok(created.id)
    }

    /// Start an exec instance without attaching to it.
    pub fn start_exec_detached(&self, id: &str) -> Result<(), DaemonError> {
        let resp = self
            .http
            .post(self.api_url(&format!("/exec/{id}/start")))
            .json(&ExecStart {
                detach: true,
                tty: false,
            })
            .send()
            .map_err(transport)?;
        Self::check_status(resp).map(drop)
    }

    /// Start an exec instance and return its (multiplexed) output stream.
    pub fn exec_output(&self, id: &str) -> Result<Response, DaemonError> {
        let resp = self
            .http
            .post(self.api_url(&format!("/exec/{id}/start")))
            .json(&ExecStart {
                detach: false,
                tty: false,
            })
            .send()
            .map_err(transport)?;
        Self::check_status(resp)
    }

    // =========================================================================
    // Containers
    // =========================================================================

    pub fn inspect_container(&self, id: &str) -> Result<ContainerInspect, DaemonError> {
        self.get(&format!("/containers/{id}/json"))
    }

    pub fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, DaemonError> {
        self.get(&format!("/containers/json?all={}", u8::from(all)))
    }

    pub fn create_container(
        &self,
        config: &ContainerConfig,
        name: Option<&str>,
    ) -> Result<Created, DaemonError> {
        let path = match name {
            Some(name) => format!("/containers/create?name={name}"),
            None => "/containers/create".to_string(),
        };
        self.post_json(&path, config)
    }

    pub fn start_container(&self, id: &str) -> Result<(), DaemonError> {
        self.post_action(&format!("/containers/{id}/start"))
    }

    pub fn stop_container(&self, id: &str, timeout_secs: u32) -> Result<(), DaemonError> {
        self.post_action(&format!("/containers/{id}/stop?t={timeout_secs}"))
    }

    pub fn restart_container(&self, id: &str, timeout_secs: u32) -> Result<(), DaemonError> {
        self.post_action(&format!("/containers/{id}/restart?t={timeout_secs}"))
    }

    pub fn kill_container(&self, id: &str, signal: &str) -> Result<(), DaemonError> {
        self.post_action(&format!("/containers/{id}/kill?signal={signal}"))
    }

    /// Block until the container stops; returns its exit code.
    pub fn wait_container(&self, id: &str) -> Result<i64, DaemonError> {
        let resp = self
            .http
            .post(self.api_url(&format!("/containers/{id}/wait")))
            .send()
            .map_err(transport)?;
        let status: WaitStatus = Self::check_status(resp)?.json().map_err(transport)?;
        Ok(status.status_code)
    }

    pub fn remove_container(&self, id: &str, force: bool, volumes: bool) -> Result<(), DaemonError> {
        let path = format!(
            "/containers/{id}?v={}&force={}",
            u8::from(volumes),
            u8::from(force)
        );
        let resp = self.http.delete(self.api_url(&path)).send().map_err(transport)?;
        Self::check_status(resp).map(drop)
    }

    // =========================================================================
    // Session plumbing
    // =========================================================================

    fn resize_path(target: &SessionTarget, size: WindowSize) -> String {
        let (kind, id) = match target {
            SessionTarget::Exec(id) => ("exec", id),
            SessionTarget::Container(id) => ("containers", id),
        };
        format!("/{kind}/{id}/resize?h={}&w={}", size.rows, size.cols)
    }

    fn attach_path(&self, target: &SessionTarget) -> String {
        match target {
            SessionTarget::Exec(id) => self.api_path(&format!("/exec/{id}/start")),
            SessionTarget::Container(id) => {
                let logs = if self.attach_logs { "&logs=1" } else { "" };
                self.api_path(&format!(
                    "/containers/{id}/attach?stream=1&stdin=1&stdout=1&stderr=1{logs}"
                ))
            }
        }
    }
}

impl Daemon for EngineClient {
    type Channel = TcpStream;

    fn session_info(&self, target: &SessionTarget) -> Result<SessionInfo, DaemonError> {
        match target {
            SessionTarget::Exec(id) => Ok((&self.inspect_exec(id)?).into()),
            SessionTarget::Container(id) => Ok((&self.inspect_container(id)?).into()),
        }
    }

    fn attach(&self, target: &SessionTarget) -> Result<TcpStream, DaemonError> {
        let path = self.attach_path(target);
        let body = match target {
            SessionTarget::Exec(id) => {
                let tty = self.inspect_exec(id)?.process_config.tty;
                let start = ExecStart { detach: false, tty };
                let body = serde_json::to_string(&start)
                    .map_err(|e| DaemonError::Transport(e.to_string()))?;
                Some(body)
            }
            SessionTarget::Container(_) => None,
        };
        debug!(session = %target, %path, "Attaching");
        upgrade::open(&self.endpoint, &path, body.as_deref())
    }

    fn resize(&self, target: &SessionTarget, size: WindowSize) -> Result<(), DaemonError> {
        let resp = self
            .http
            .post(self.api_url(&Self::resize_path(target, size)))
            .send()
            .map_err(transport)?;
        Self::check_status(resp).map(drop)
    }
}
