//! Remote API registry for swarm.
//!
//! Persists named daemon endpoints to `~/.swarm/config.json`:
//!
//! ```json
//! { "apis": { "prod": "tcp://10.0.0.5:2375" }, "current": "prod", "version": "1.24" }
//! ```
//!
//! Resolution order for the endpoint actually used:
//! 1. `SWARM_HOST` environment variable
//! 2. The API named by `current`
//!
//! and for the API version: `SWARM_API_VERSION`, then `version`
//! (`"auto"` or absent means no version prefix).

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Default plain-HTTP port of the remote daemon.
pub const DEFAULT_PORT: u16 = 2375;

/// Oldest remote API version the tool accepts.
const MIN_VERSION: (u32, u32) = (1, 10);

/// Persistent registry of remote daemon APIs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiRegistry {
    /// Named endpoints.
    #[serde(default)]
    pub apis: BTreeMap<String, String>,
    /// Name of the active endpoint. Older files store `""` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    /// Remote API version (`"1.24"`) or `"auto"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Keys this tool does not manage (e.g. legacy `tlsconfig`), kept on rewrite.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
    #[serde(skip)]
    host_override: Option<String>,
    #[serde(skip)]
    version_override: Option<String>,
}

impl ApiRegistry {
    /// Path to the registry file: `~/.swarm/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".swarm").join("config.json"))
    }

    /// Load the registry from `path`. A missing file yields an empty registry.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No API registry yet");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Write the registry to `path`, creating the parent directory if needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Apply `SWARM_HOST` and `SWARM_API_VERSION` from the environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            std::env::var("SWARM_HOST").ok(),
            std::env::var("SWARM_API_VERSION").ok(),
        )
    }

    /// Override the resolved endpoint and version without touching the file.
    #[must_use]
    pub fn with_overrides(mut self, host: Option<String>, version: Option<String>) -> Self {
        self.host_override = host.filter(|h| !h.is_empty());
        self.version_override = version.filter(|v| !v.is_empty());
        self
    }

    /// Name of the active API, if one is selected.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref().filter(|c| !c.is_empty())
    }

    /// Register (or replace) a named API.
    pub fn add(&mut self, name: &str, url: &str) -> Result<()> {
        Endpoint::parse(url)?;
        self.apis.insert(name.to_string(), url.to_string());
        Ok(())
    }

    /// Make `name` the active API.
    pub fn use_api(&mut self, name: &str) -> Result<()> {
        if !self.apis.contains_key(name) {
            return Err(self.unknown(name, &[]));
        }
        self.current = Some(name.to_string());
        Ok(())
    }

    /// Remove a named API, or every API with `"all"`.
    pub fn unset(&mut self, name: &str) -> Result<()> {
        if self.apis.remove(name).is_some() {
            if self.current() == Some(name) {
                self.current = None;
            }
            return Ok(());
        }
        if name == "all" {
            self.apis.clear();
            self.current = None;
            return Ok(());
        }
        Err(self.unknown(name, &["all"]))
    }

    /// Pin the remote API version, or `"auto"` to negotiate none.
    pub fn set_version(&mut self, version: &str) -> Result<()> {
        if version != "auto" {
            let parsed = parse_version(version).ok_or_else(|| {
                Error::Config(format!("{version} is not a valid API version"))
            })?;
            if parsed < MIN_VERSION {
                return Err(Error::Config(format!(
                    "{version} is older than the minimum supported version {}.{}",
                    MIN_VERSION.0, MIN_VERSION.1
                )));
            }
        }
        self.version = Some(version.to_string());
        Ok(())
    }

    /// Resolve the endpoint requests should go to.
    pub fn endpoint(&self) -> Result<Endpoint> {
        if let Some(host) = &self.host_override {
            return Endpoint::parse(host);
        }
        let name = self
            .current()
            .ok_or_else(|| Error::Config("No available swarm api. Run: swarm api use <name>".into()))?;
        let url = self
            .apis
            .get(name)
            .ok_or_else(|| Error::Config(format!("Current api `{name}` is not registered")))?;
        Endpoint::parse(url)
    }

    /// Resolved API version, `None` when requests should not be version-prefixed.
    pub fn api_version(&self) -> Option<&str> {
        self.version_override
            .as_deref()
            .or(self.version.as_deref())
            .filter(|v| *v != "auto")
    }

    fn unknown(&self, name: &str, extra: &[&str]) -> Error {
        if self.apis.is_empty() && extra.is_empty() {
            return Error::Config("No available swarm api".into());
        }
        let available: Vec<&str> = self
            .apis
            .keys()
            .map(String::as_str)
            .chain(extra.iter().copied())
            .collect();
        Error::Config(format!(
            "`{name}` is not available. Available arguments: {}",
            available.join(", ")
        ))
    }
}

fn parse_version(version: &str) -> Option<(u32, u32)> {
    let (major, minor) = version.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// A plain-HTTP daemon endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `tcp://host:port`, `http://host:port` or `host:port`.
    pub fn parse(url: &str) -> Result<Self> {
        let rest = if let Some(rest) = url.strip_prefix("tcp://") {
            rest
        } else if let Some(rest) = url.strip_prefix("http://") {
            rest
        } else if let Some((scheme, _)) = url.split_once("://") {
            return Err(Error::Config(format!(
                "Unsupported scheme `{scheme}` in {url}: only tcp:// and http:// are supported"
            )));
        } else {
            url
        };
        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(Error::Config(format!("Missing host in {url}")));
        }

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| Error::Config(format!("Unterminated IPv6 address in {url}")))?;
            (host, tail.strip_prefix(':'))
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };
        let port = match port {
            Some(p) => p
                .parse()
                .map_err(|_| Error::Config(format!("Invalid port `{p}` in {url}")))?,
            None => DEFAULT_PORT,
        };
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// `host:port` form suitable for `TcpStream::connect` and the `Host` header.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Base URL for HTTP requests.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.authority())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}", self.authority())
    }
}
