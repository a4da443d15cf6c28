//! Process configuration.
//!
//! Values come from the environment and can be overridden by a YAML file
//! named in `RELAYLB_CONFIG`. Everything is validated up front so that a bad
//! backend list never reaches the listener.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::proxy::backend::BackendAddress;

pub const BACKENDS_VAR: &str = "RPYC_SERVERS";
pub const HOST_VAR: &str = "SERVER_HOST";
pub const PORT_VAR: &str = "SERVER_PORT";
pub const CONNECT_TIMEOUT_VAR: &str = "CONNECT_TIMEOUT_MS";
pub const IDLE_TIMEOUT_VAR: &str = "IDLE_TIMEOUT_MS";
pub const CONFIG_PATH_VAR: &str = "RELAYLB_CONFIG";

const DEFAULT_BACKENDS: &str = "localhost:18900";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: &str = "18861";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    /// Backend pool in configured order. Never empty.
    pub backends: Vec<BackendAddress>,
    pub connect_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

/// Shape of the optional YAML override file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen_host: Option<String>,
    listen_port: Option<u16>,
    backends: Option<Vec<String>>,
    connect_timeout_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
}

/// Unvalidated settings, before backend entries and numbers are parsed.
struct RawConfig {
    listen_host: String,
    listen_port: String,
    backends: Vec<String>,
    connect_timeout_ms: Option<String>,
    idle_timeout_ms: Option<String>,
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut raw = RawConfig::from_lookup(&lookup);

        if let Some(path) = lookup(CONFIG_PATH_VAR) {
            let text = std::fs::read_to_string(&path)?;
            tracing::debug!(path = %path, "Applying config file");
            raw.overlay(serde_yaml::from_str(&text)?);
        }

        raw.validate()
    }

    /// Load from YAML alone, using defaults for missing keys.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let mut raw = RawConfig::from_lookup(&|_: &str| -> Option<String> { None });
        raw.overlay(serde_yaml::from_str(text)?);
        raw.validate()
    }

    /// Address the listener binds to.
    pub fn listen_addr(&self) -> String {
        if self.listen_host.contains(':') {
            format!("[{}]:{}", self.listen_host, self.listen_port)
        } else {
            format!("{}:{}", self.listen_host, self.listen_port)
        }
    }
}

impl RawConfig {
    fn from_lookup<F>(lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let backends = lookup(BACKENDS_VAR).unwrap_or_else(|| DEFAULT_BACKENDS.to_string());

        Self {
            listen_host: lookup(HOST_VAR).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            listen_port: lookup(PORT_VAR).unwrap_or_else(|| DEFAULT_PORT.to_string()),
            backends: split_backend_list(&backends),
            connect_timeout_ms: lookup(CONNECT_TIMEOUT_VAR),
            idle_timeout_ms: lookup(IDLE_TIMEOUT_VAR),
        }
    }

    fn overlay(&mut self, file: FileConfig) {
        if let Some(host) = file.listen_host {
            self.listen_host = host;
        }
        if let Some(port) = file.listen_port {
            self.listen_port = port.to_string();
        }
        if let Some(backends) = file.backends {
            self.backends = backends;
        }
        if let Some(ms) = file.connect_timeout_ms {
            self.connect_timeout_ms = Some(ms.to_string());
        }
        if let Some(ms) = file.idle_timeout_ms {
            self.idle_timeout_ms = Some(ms.to_string());
        }
    }

    fn validate(self) -> Result<Config, ConfigError> {
        let backends = self
            .backends
            .iter()
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty())
            .map(BackendAddress::parse)
            .collect::<Result<Vec<_>, _>>()?;

        if backends.is_empty() {
            return Err(ConfigError::EmptyBackendList);
        }

        let listen_port = self
            .listen_port
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidListenPort(self.listen_port.clone()))?;

        Ok(Config {
            listen_host: self.listen_host,
            listen_port,
            backends,
            connect_timeout: parse_timeout(CONNECT_TIMEOUT_VAR, self.connect_timeout_ms)?,
            idle_timeout: parse_timeout(IDLE_TIMEOUT_VAR, self.idle_timeout_ms)?,
        })
    }
}

/// Entries are newline separated; commas are accepted too.
fn split_backend_list(value: &str) -> Vec<String> {
    value
        .split(['\n', ','])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_timeout(name: &'static str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    match value {
        None => Ok(None),
        Some(v) if v.trim().is_empty() => Ok(None),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::InvalidTimeout { name, value: v }),
    }
}
