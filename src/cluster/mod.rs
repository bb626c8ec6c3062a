// # Cluster Types
//
// Server endpoint identity and the cluster-health snapshot format shared by
// client and server. The snapshot is a canonical string
// `host:port(UP|DOWN);...` in the endpoint order fixed at client startup;
// clients mint it, attach it to every request, and servers parse it to
// count healthy peers.

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A proxy server endpoint. Identity is `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            ProxyError::Configuration(format!("invalid endpoint '{}', expected host:port", s))
        })?;
        if host.is_empty() {
            return Err(ProxyError::Configuration(format!(
                "invalid endpoint '{}', empty host",
                s
            )));
        }
        let port = port.parse::<u16>().map_err(|_| {
            ProxyError::Configuration(format!("invalid port in endpoint '{}'", s))
        })?;
        Ok(Endpoint::new(host, port))
    }
}

/// Serializes endpoints with their UP/DOWN state into the canonical
/// snapshot string. Endpoint order is preserved.
pub fn format_cluster_health(states: &[(Endpoint, bool)]) -> String {
    states
        .iter()
        .map(|(ep, up)| format!("{}({})", ep, if *up { "UP" } else { "DOWN" }))
        .collect::<Vec<_>>()
        .join(";")
}

/// Parses a snapshot string back into endpoint states.
pub fn parse_cluster_health(snapshot: &str) -> Result<Vec<(Endpoint, bool)>> {
    if snapshot.is_empty() {
        return Ok(Vec::new());
    }
    let mut states = Vec::new();
    for token in snapshot.split(';') {
        let (addr, state) = token
            .strip_suffix(')')
            .and_then(|t| t.rsplit_once('('))
            .ok_or_else(|| {
                ProxyError::Configuration(format!(
                    "invalid cluster health token '{}' in '{}'",
                    token, snapshot
                ))
            })?;
        let up = match state {
            "UP" => true,
            "DOWN" => false,
            other => {
                return Err(ProxyError::Configuration(format!(
                    "invalid endpoint state '{}' in '{}'",
                    other, snapshot
                )))
            }
        };
        states.push((addr.parse::<Endpoint>()?, up));
    }
    Ok(states)
}

/// Counts the endpoints marked UP in a snapshot string. Malformed tokens
/// count as DOWN rather than failing the caller's request path.
pub fn count_healthy_servers(snapshot: &str) -> usize {
    if snapshot.is_empty() {
        return 0;
    }
    snapshot
        .split(';')
        .filter(|token| token.ends_with("(UP)"))
        .count()
}
