//! Error types shared across the proxy.
//!
//! Only [`ConfigError`] is ever allowed to stop the process. Everything a
//! single client connection can hit is a [`SessionError`] and stays inside
//! that connection's session.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Direction of a forwarding loop, used for logging and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend
    Upstream,
    /// Backend to client
    Downstream,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Upstream => f.write_str("client->backend"),
            Direction::Downstream => f.write_str("backend->client"),
        }
    }
}

/// Startup configuration failures. Fatal before the listener binds.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("backend list is empty")]
    EmptyBackendList,

    #[error("malformed backend entry {entry:?}: {reason}")]
    MalformedBackend { entry: String, reason: String },

    #[error("invalid listen port {0:?}")]
    InvalidListenPort(String),

    #[error("invalid {name} value {value:?}: expected milliseconds")]
    InvalidTimeout { name: &'static str, value: String },

    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Per-connection failures. Never propagated past the session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("backend {backend} unavailable: {source}")]
    BackendUnavailable {
        backend: String,
        #[source]
        source: io::Error,
    },

    #[error("forwarding {direction} failed: {source}")]
    Forwarding {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("no bytes moved in either direction for {idle:?}")]
    IdleTimeout { idle: Duration },
}

impl SessionError {
    pub fn forwarding(direction: Direction, source: io::Error) -> Self {
        SessionError::Forwarding { direction, source }
    }
}
