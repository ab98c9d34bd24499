//! Connection String Parsing
//!
//! Decomposes `mongodb://host[:port][,host2[:port2]...][/database][?key=value&...]`
//! into a [`ConnectionConfig`].
//!
//! # Rules
//! - The scheme must be `mongodb` (case-insensitive)
//! - At least one host is required; every comma-separated entry must name a host
//! - Missing ports default to 27017; bracketed IPv6 hosts are accepted
//! - Query options are kept verbatim, unknown keys included
//! - Credentials (`user:pass@`) are rejected: authentication is not supported
//!
//! Parsing is pure and performs no I/O (no DNS, no SRV lookup).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DocpoolError, Result};

/// URI scheme accepted by [`parse`]
pub const SCHEME: &str = "mongodb";

/// Port used when an endpoint omits one
pub const DEFAULT_PORT: u16 = 27017;

/// A single `host:port` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Address string suitable for `TcpStream::connect`
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

/// Parsed connection string
///
/// Immutable once built; shared between the pool and its connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Endpoints in source order
    pub endpoints: Vec<Endpoint>,

    /// Database named in the URI path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_database: Option<String>,

    /// Query options, keys and values verbatim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl ConnectionConfig {
    /// Look up an option by name, ignoring ASCII case
    #[must_use]
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// `maxPoolSize`, if present and numeric
    #[must_use]
    pub fn max_pool_size(&self) -> Option<usize> {
        self.option("maxPoolSize").and_then(|v| v.parse().ok())
    }

    /// `waitQueueTimeoutMS`, if present and numeric
    #[must_use]
    pub fn wait_queue_timeout(&self) -> Option<Duration> {
        self.option("waitQueueTimeoutMS").and_then(|v| v.parse().ok()).map(Duration::from_millis)
    }

    /// `connectTimeoutMS`, if present and numeric
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.option("connectTimeoutMS").and_then(|v| v.parse().ok()).map(Duration::from_millis)
    }

    /// `appName`, sent with the handshake
    #[must_use]
    pub fn app_name(&self) -> Option<&str> {
        self.option("appName")
    }
}

impl FromStr for ConnectionConfig {
    type Err = DocpoolError;

    fn from_str(s: &str) -> Result<Self> {
        parse(s)
    }
}

impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}://")?;
        let hosts: Vec<String> = self.endpoints.iter().map(Endpoint::address).collect();
        f.write_str(&hosts.join(","))?;
        if self.default_database.is_some() || !self.options.is_empty() {
            f.write_str("/")?;
        }
        if let Some(db) = &self.default_database {
            f.write_str(db)?;
        }
        if !self.options.is_empty() {
            let pairs: Vec<String> =
                self.options.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "?{}", pairs.join("&"))?;
        }
        Ok(())
    }
}

/// Parse a connection string
pub fn parse(uri: &str) -> Result<ConnectionConfig> {
    let uri = uri.trim();
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| DocpoolError::invalid_uri(format!("missing scheme in '{uri}'")))?;

    if !scheme.eq_ignore_ascii_case(SCHEME) {
        return Err(DocpoolError::invalid_uri(format!(
            "unsupported scheme '{scheme}', expected '{SCHEME}'"
        )));
    }

    // Host list ends at the first '/' or '?'
    let split_at = rest.find(['/', '?']).unwrap_or(rest.len());
    let (hosts, tail) = rest.split_at(split_at);

    if hosts.contains('@') {
        return Err(DocpoolError::invalid_uri("credentials in URI are not supported"));
    }
    if hosts.is_empty() {
        return Err(DocpoolError::invalid_uri(format!("no host in '{uri}'")));
    }

    let endpoints = hosts.split(',').map(parse_endpoint).collect::<Result<Vec<_>>>()?;

    let (path, query) = match tail.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (tail, None),
    };

    let database = path.trim_start_matches('/');
    let default_database = if database.is_empty() {
        None
    } else if database.contains(['/', ' ', '"', '$', '\\']) {
        return Err(DocpoolError::invalid_uri(format!("invalid database name '{database}'")));
    } else {
        Some(database.to_string())
    };

    let mut options = BTreeMap::new();
    for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key.is_empty() {
            return Err(DocpoolError::invalid_uri(format!("option without a name: '{pair}'")));
        }
        options.insert(key.to_string(), value.to_string());
    }

    Ok(ConnectionConfig { endpoints, default_database, options })
}

fn parse_endpoint(entry: &str) -> Result<Endpoint> {
    let entry = entry.trim();
    if entry.is_empty() {
        return Err(DocpoolError::invalid_uri("empty host entry in host list"));
    }

    // [::1]:27017
    if let Some(bracketed) = entry.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| DocpoolError::invalid_uri(format!("unterminated IPv6 host '{entry}'")))?;
        if host.is_empty() {
            return Err(DocpoolError::invalid_uri(format!("empty IPv6 host in '{entry}'")));
        }
        let port = match after.strip_prefix(':') {
            Some(port) => parse_port(port, entry)?,
            None if after.is_empty() => DEFAULT_PORT,
            None => {
                return Err(DocpoolError::invalid_uri(format!(
                    "unexpected text after host '{entry}'"
                )))
            }
        };
        return Ok(Endpoint::new(host, port));
    }

    let (host, port) = match entry.rsplit_once(':') {
        Some((host, port)) => (host, parse_port(port, entry)?),
        None => (entry, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(DocpoolError::invalid_uri(format!("missing host in '{entry}'")));
    }
    if host.contains(':') {
        return Err(DocpoolError::invalid_uri(format!(
            "IPv6 host must be bracketed: '{entry}'"
        )));
    }

    Ok(Endpoint::new(host, port))
}

fn parse_port(port: &str, entry: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(DocpoolError::invalid_uri(format!("invalid port in '{entry}'"))),
        Ok(port) => Ok(port),
    }
}
