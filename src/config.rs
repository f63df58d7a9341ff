//! Cache configuration

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::CacheError;

/// Endpoint used when no servers are configured.
pub const DEFAULT_SERVER: &str = "127.0.0.1:6379";

/// Configuration for the namespaced cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Prefix prepended to every physical key
    pub key_prefix: String,
    /// How long a write waits for the advisory lock on its hash
    pub lock_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            lock_timeout: Duration::from_secs(2),
        }
    }
}

/// A single `host:port` backing server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServerEndpoint {
    /// Connection URL understood by the redis client.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerEndpoint {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| CacheError::Configuration(format!("expected host:port, got '{}'", s)))?;

        if host.is_empty() {
            return Err(CacheError::Configuration(format!("missing host in '{}'", s)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| CacheError::Configuration(format!("invalid port in '{}': {}", s, e)))?;

        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }
}

/// Ordered list of backing servers, as persisted by the host settings.
///
/// The host stores the list as a JSON array of `host:port` strings; the
/// settings form edits it as one endpoint per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerDetails(Vec<String>);

impl Default for ServerDetails {
    fn default() -> Self {
        Self(vec![DEFAULT_SERVER.to_owned()])
    }
}

impl ServerDetails {
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(servers.into_iter().map(Into::into).collect())
    }

    /// Parse the persisted JSON array. A blank setting means the default server.
    pub fn from_json(raw: &str) -> Result<Self, CacheError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(raw)?)
    }

    /// Parse the one-endpoint-per-line form, skipping blank lines.
    pub fn from_lines(raw: &str) -> Self {
        Self(
            raw.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }

    pub fn to_json(&self) -> Result<String, CacheError> {
        Ok(serde_json::to_string(&self.0)?)
    }

    /// Render for the settings form; lines are joined with CRLF like the form posts them.
    pub fn to_lines(&self) -> String {
        self.0.join("\r\n")
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|s| s.trim().is_empty())
    }

    /// Parse every entry into an endpoint. An empty list is a configuration error.
    pub fn endpoints(&self) -> Result<Vec<ServerEndpoint>, CacheError> {
        let endpoints = self
            .0
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse())
            .collect::<Result<Vec<ServerEndpoint>, _>>()?;

        if endpoints.is_empty() {
            return Err(CacheError::Configuration(
                "no cache servers configured".to_owned(),
            ));
        }
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_json_defaults_to_local_server() {
        let details = ServerDetails::from_json("   ").unwrap();
        assert_eq!(
            details.endpoints().unwrap(),
            vec![ServerEndpoint {
                host: "127.0.0.1".to_owned(),
                port: 6379
            }]
        );
    }

    #[test]
    fn test_json_list_keeps_order() {
        let details = ServerDetails::from_json(r#"["10.0.0.1:6379","cache-b:6380"]"#).unwrap();
        let endpoints = details.endpoints().unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].to_string(), "10.0.0.1:6379");
        assert_eq!(endpoints[1].host, "cache-b");
        assert_eq!(endpoints[1].port, 6380);
        assert_eq!(endpoints[1].url(), "redis://cache-b:6380/");
    }

    #[test]
    fn test_invalid_json_is_serialization_error() {
        assert!(matches!(
            ServerDetails::from_json("not json"),
            Err(CacheError::Serialization(_))
        ));
    }

    #[test]
    fn test_form_lines_round_trip_through_json() {
        let details = ServerDetails::from_lines("10.0.0.1:6379\r\n\r\n10.0.0.2:6379\n");
        assert_eq!(details.to_lines(), "10.0.0.1:6379\r\n10.0.0.2:6379");

        let json = details.to_json().unwrap();
        assert_eq!(json, r#"["10.0.0.1:6379","10.0.0.2:6379"]"#);
        assert_eq!(ServerDetails::from_json(&json).unwrap(), details);
    }

    #[test]
    fn test_empty_list_is_configuration_error() {
        let details = ServerDetails::from_json("[]").unwrap();
        assert!(details.is_empty());
        assert!(matches!(
            details.endpoints(),
            Err(CacheError::Configuration(_))
        ));
    }

    #[test]
    fn test_malformed_endpoints() {
        assert!("localhost".parse::<ServerEndpoint>().is_err());
        assert!(":6379".parse::<ServerEndpoint>().is_err());
        assert!("localhost:notaport".parse::<ServerEndpoint>().is_err());
        assert!("localhost:70000".parse::<ServerEndpoint>().is_err());
    }
}
