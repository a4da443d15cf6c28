//! Backend registry
//!
//! The registry is the ordered list of backend servers, resolved once at
//! startup. A backend's identity is its position in that list; the
//! selector's counters are indexed the same way.

use crate::error::ConfigError;
use std::fmt;
use std::sync::Arc;

/// A backend server address as configured (`host:port`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddress {
    /// Hostname or IP literal, without brackets
    pub host: String,

    /// TCP port
    pub port: u16,
}

impl BackendAddress {
    /// Create a backend address from its parts
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` entry. IPv6 literals may be bracketed.
    pub fn parse(entry: &str) -> Result<Self, ConfigError> {
        let malformed = |reason: &str| ConfigError::MalformedBackend {
            entry: entry.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = entry
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| malformed("expected host:port"))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.is_empty() {
            return Err(malformed("missing host"));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| malformed("port must be a number between 0 and 65535"))?;

        Ok(Self::new(host, port))
    }

    /// Tuple form accepted by `TcpStream::connect`
    pub fn as_connect_target(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Immutable, ordered set of backends
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    backends: Arc<[BackendAddress]>,
}

impl BackendRegistry {
    /// Build a registry. Fails if the list is empty.
    pub fn new(backends: Vec<BackendAddress>) -> Result<Self, ConfigError> {
        if backends.is_empty() {
            return Err(ConfigError::EmptyBackendList);
        }

        Ok(Self {
            backends: backends.into(),
        })
    }

    /// Parse every entry in order, failing on the first malformed one
    pub fn parse<I, S>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let backends = entries
            .into_iter()
            .map(|e| BackendAddress::parse(e.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(backends)
    }

    pub fn get(&self, index: usize) -> Option<&BackendAddress> {
        self.backends.get(index)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendAddress> {
        self.backends.iter()
    }
}
