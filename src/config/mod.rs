// # Configuration
//
// Multinode URL parsing, pool settings, and the connection hash.
//
// The client-visible URL has the form
// `odbp://host1:port1,host2:port2/<dbid>?<key>=<value>&...`. The recognized
// pool keys are enumerated below; unknown keys are ignored with a warning.
// The connection hash is a stable digest of `(url, user, pool settings)` and
// is the key under which pools and allocations are indexed on every server,
// so the same client intent always lands on the same pool.

use crate::cluster::Endpoint;
use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

/// URL scheme accepted by the client.
pub const URL_PREFIX: &str = "odbp://";

/// Pool property keys the proxy recognizes. Everything else is warned about
/// and dropped.
pub const RECOGNIZED_KEYS: [&str; 7] = [
    "maximumPoolSize",
    "minimumIdle",
    "connectionTimeoutMs",
    "idleTimeoutMs",
    "maxLifetime",
    "autoCommit",
    "validationQuery",
];

/// A parsed multinode proxy URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyUrl {
    pub endpoints: Vec<Endpoint>,
    pub db_id: String,
    pub properties: HashMap<String, String>,
}

impl ProxyUrl {
    /// Parses `odbp://host1:port1,host2:port2/<dbid>?<props>`.
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url.strip_prefix(URL_PREFIX).ok_or_else(|| {
            ProxyError::Configuration(format!("URL '{}' does not start with {}", url, URL_PREFIX))
        })?;

        let (authority, path) = rest.split_once('/').ok_or_else(|| {
            ProxyError::Configuration(format!("URL '{}' is missing the /<dbid> segment", url))
        })?;

        let endpoints = authority
            .split(',')
            .map(|ep| ep.trim().parse::<Endpoint>())
            .collect::<Result<Vec<_>>>()?;
        if endpoints.is_empty() {
            return Err(ProxyError::Configuration(format!(
                "URL '{}' lists no server endpoints",
                url
            )));
        }

        let (db_id, query) = match path.split_once('?') {
            Some((db, q)) => (db, Some(q)),
            None => (path, None),
        };
        if db_id.is_empty() {
            return Err(ProxyError::Configuration(format!(
                "URL '{}' has an empty database id",
                url
            )));
        }

        let mut properties = HashMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((k, v)) => {
                        properties.insert(k.to_string(), v.to_string());
                    }
                    None => {
                        return Err(ProxyError::Configuration(format!(
                            "malformed query pair '{}' in URL '{}'",
                            pair, url
                        )))
                    }
                }
            }
        }

        Ok(Self {
            endpoints,
            db_id: db_id.to_string(),
            properties,
        })
    }
}

/// Pool sizing and lifecycle settings for one connection hash.
///
/// Defaults follow common managed-pool practice: a small bounded pool with
/// a thirty second borrow timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub maximum_pool_size: u32,
    pub minimum_idle: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub auto_commit: bool,
    pub validation_query: Option<String>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            maximum_pool_size: 10,
            minimum_idle: 10,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            auto_commit: true,
            validation_query: None,
        }
    }
}

impl PoolSettings {
    /// Builds settings from client-supplied properties. When `xa` is set the
    /// `xa.`-prefixed equivalents take precedence, so an XA pool can be sized
    /// independently of the regular pool for the same URL.
    pub fn from_properties(properties: &HashMap<String, String>, xa: bool) -> Result<Self> {
        let mut settings = PoolSettings::default();
        let mut explicit_min_idle = false;

        for (key, value) in properties {
            let (is_xa_key, base_key) = match key.strip_prefix("xa.") {
                Some(stripped) => (true, stripped),
                None => (false, key.as_str()),
            };
            if is_xa_key != xa {
                continue;
            }
            match base_key {
                "maximumPoolSize" => settings.maximum_pool_size = parse_number(key, value)?,
                "minimumIdle" => {
                    settings.minimum_idle = parse_number(key, value)?;
                    explicit_min_idle = true;
                }
                "connectionTimeoutMs" => {
                    settings.connection_timeout = Duration::from_millis(parse_number(key, value)?)
                }
                "idleTimeoutMs" => {
                    settings.idle_timeout = Duration::from_millis(parse_number(key, value)?)
                }
                "maxLifetime" => {
                    settings.max_lifetime = Duration::from_millis(parse_number(key, value)?)
                }
                "autoCommit" => {
                    settings.auto_commit = value.parse::<bool>().map_err(|_| {
                        ProxyError::Configuration(format!("invalid boolean '{}' for {}", value, key))
                    })?
                }
                "validationQuery" => settings.validation_query = Some(value.clone()),
                unknown => {
                    tracing::warn!("Ignoring unrecognized pool property '{}'", unknown);
                }
            }
        }

        if !explicit_min_idle {
            settings.minimum_idle = settings.maximum_pool_size;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.maximum_pool_size == 0 {
            return Err(ProxyError::Configuration(
                "maximumPoolSize must be at least 1".to_string(),
            ));
        }
        if self.minimum_idle > self.maximum_pool_size {
            return Err(ProxyError::Configuration(format!(
                "minimumIdle ({}) > maximumPoolSize ({})",
                self.minimum_idle, self.maximum_pool_size
            )));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| {
        ProxyError::Configuration(format!("invalid numeric value '{}' for {}", value, key))
    })
}

/// Computes the stable connection hash for `(url, user, xa, pool settings)`.
///
/// Every server derives the identical hash for the same client intent, which
/// is what lets pool allocations be coordinated cluster-wide without any
/// server-to-server traffic. XA intent is part of the hash: it selects the
/// `xa.`-prefixed property set and an XA pool must never be shared with a
/// regular one.
pub fn connection_hash(url: &str, user: &str, xa: bool, settings: &PoolSettings) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        url,
        user,
        xa,
        settings.maximum_pool_size,
        settings.minimum_idle,
        settings.connection_timeout.as_millis(),
        settings.idle_timeout.as_millis(),
        settings.max_lifetime.as_millis(),
        settings.auto_commit,
        settings.validation_query.as_deref().unwrap_or(""),
    );
    let digest = Sha256::digest(canonical.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multinode_url() {
        let url = ProxyUrl::parse(
            "odbp://server1:1059,server2:1059/orders?maximumPoolSize=22&minimumIdle=20",
        )
        .unwrap();
        assert_eq!(url.endpoints.len(), 2);
        assert_eq!(url.endpoints[0], Endpoint::new("server1", 1059));
        assert_eq!(url.db_id, "orders");
        assert_eq!(url.properties.get("maximumPoolSize").unwrap(), "22");
    }

    #[test]
    fn test_parse_rejects_bad_urls() {
        assert!(ProxyUrl::parse("jdbc://server1:1059/db").is_err());
        assert!(ProxyUrl::parse("odbp://server1:1059").is_err());
        assert!(ProxyUrl::parse("odbp://server1:1059/").is_err());
        assert!(ProxyUrl::parse("odbp://server1:1059/db?novalue").is_err());
    }

    #[test]
    fn test_pool_settings_from_properties() {
        let mut props = HashMap::new();
        props.insert("maximumPoolSize".to_string(), "22".to_string());
        props.insert("minimumIdle".to_string(), "20".to_string());
        props.insert("connectionTimeoutMs".to_string(), "5000".to_string());
        props.insert("somethingElse".to_string(), "ignored".to_string());

        let settings = PoolSettings::from_properties(&props, false).unwrap();
        assert_eq!(settings.maximum_pool_size, 22);
        assert_eq!(settings.minimum_idle, 20);
        assert_eq!(settings.connection_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_xa_prefixed_keys_select_xa_pool() {
        let mut props = HashMap::new();
        props.insert("maximumPoolSize".to_string(), "40".to_string());
        props.insert("xa.maximumPoolSize".to_string(), "6".to_string());

        let regular = PoolSettings::from_properties(&props, false).unwrap();
        let xa = PoolSettings::from_properties(&props, true).unwrap();
        assert_eq!(regular.maximum_pool_size, 40);
        assert_eq!(xa.maximum_pool_size, 6);
    }

    #[test]
    fn test_min_idle_defaults_to_max() {
        let mut props = HashMap::new();
        props.insert("maximumPoolSize".to_string(), "7".to_string());
        let settings = PoolSettings::from_properties(&props, false).unwrap();
        assert_eq!(settings.minimum_idle, 7);
    }

    #[test]
    fn test_settings_validation() {
        let mut props = HashMap::new();
        props.insert("maximumPoolSize".to_string(), "2".to_string());
        props.insert("minimumIdle".to_string(), "5".to_string());
        assert!(PoolSettings::from_properties(&props, false).is_err());

        props.insert("maximumPoolSize".to_string(), "0".to_string());
        props.insert("minimumIdle".to_string(), "0".to_string());
        assert!(PoolSettings::from_properties(&props, false).is_err());
    }

    #[test]
    fn test_connection_hash_is_stable_and_distinguishes_intent() {
        let settings = PoolSettings::default();
        let a = connection_hash("odbp://s1:1059/db", "app", false, &settings);
        let b = connection_hash("odbp://s1:1059/db", "app", false, &settings);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = connection_hash("odbp://s1:1059/db", "other_user", false, &settings);
        assert_ne!(a, c);

        let xa = connection_hash("odbp://s1:1059/db", "app", true, &settings);
        assert_ne!(a, xa);

        let mut bigger = PoolSettings::default();
        bigger.maximum_pool_size = 50;
        bigger.minimum_idle = 50;
        let d = connection_hash("odbp://s1:1059/db", "app", false, &bigger);
        assert_ne!(a, d);
    }
}
