//! Companion-service endpoint discovery
//!
//! The service writes a small state file on startup describing where it is
//! listening. The discovered endpoint is cached in memory and invalidated
//! whenever a socket closes, so the next `start()` rediscovers it; the
//! service may have restarted on a different port.

use crate::config::SyncConfig;
use crate::error::{TetherError, TetherResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where the companion service is listening
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl ServiceEndpoint {
    /// Create an endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string
    pub fn parse(s: &str) -> TetherResult<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TetherError::config(format!("invalid endpoint '{}'", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| TetherError::config(format!("invalid port in endpoint '{}'", s)))?;
        if host.is_empty() {
            return Err(TetherError::config(format!("invalid endpoint '{}'", s)));
        }
        Ok(Self::new(host, port))
    }

    /// Base URL for the pull API
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Shape of the state file the companion service writes
#[derive(Debug, Deserialize)]
struct ServiceStateFile {
    host: Option<String>,
    port: u16,
    #[allow(dead_code)]
    pid: Option<u32>,
    #[allow(dead_code)]
    started_at: Option<DateTime<Utc>>,
}

/// Endpoint discovery with in-memory caching
#[derive(Debug)]
pub struct EndpointDiscovery {
    /// Fixed endpoint from config, bypassing the state file
    fixed: Option<ServiceEndpoint>,
    /// State file location
    path: PathBuf,
    /// Last successfully discovered endpoint
    cached: Mutex<Option<ServiceEndpoint>>,
}

impl EndpointDiscovery {
    /// Build discovery from config: honor an endpoint override, otherwise
    /// read the default state file location
    pub fn from_config(config: &SyncConfig) -> TetherResult<Self> {
        let fixed = match &config.endpoint_override {
            Some(s) => Some(ServiceEndpoint::parse(s)?),
            None => None,
        };
        Ok(Self {
            fixed,
            path: Self::default_path(),
            cached: Mutex::new(None),
        })
    }

    /// Discovery against an explicit state file (tests, non-standard setups)
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            fixed: None,
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    /// Default state file location: `{data_dir}/tether/service.json`
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether")
            .join("service.json")
    }

    /// The state file being watched/read
    pub fn state_file(&self) -> &Path {
        &self.path
    }

    /// Discover the endpoint, returning the cached value if present
    pub fn endpoint(&self) -> TetherResult<ServiceEndpoint> {
        if let Some(fixed) = &self.fixed {
            return Ok(fixed.clone());
        }

        if let Some(cached) = self.cached.lock().clone() {
            return Ok(cached);
        }

        let endpoint = self.read_state_file()?;
        debug!(endpoint = %endpoint, "discovered companion service endpoint");
        *self.cached.lock() = Some(endpoint.clone());
        Ok(endpoint)
    }

    /// Drop the cached endpoint so the next lookup re-reads the state file
    pub fn invalidate(&self) {
        let mut cached = self.cached.lock();
        if cached.take().is_some() {
            debug!(path = %self.path.display(), "invalidated cached endpoint");
        }
    }

    fn read_state_file(&self) -> TetherResult<ServiceEndpoint> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| {
            TetherError::discovery(format!(
                "cannot read service state file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let state: ServiceStateFile = serde_json::from_str(&contents).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "malformed service state file");
            TetherError::discovery(format!(
                "malformed service state file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(ServiceEndpoint::new(
            state.host.unwrap_or_else(|| "127.0.0.1".to_string()),
            state.port,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn state_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_parse_endpoint() {
        let ep = ServiceEndpoint::parse("127.0.0.1:7700").unwrap();
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 7700);
        assert_eq!(ep.base_url(), "http://127.0.0.1:7700");

        assert!(ServiceEndpoint::parse("no-port").is_err());
        assert!(ServiceEndpoint::parse(":7700").is_err());
        assert!(ServiceEndpoint::parse("host:notaport").is_err());
    }

    #[test]
    fn test_discover_from_state_file() {
        let file = state_file(r#"{"host": "127.0.0.1", "port": 7711, "pid": 4242}"#);
        let discovery = EndpointDiscovery::with_path(file.path());
        let ep = discovery.endpoint().unwrap();
        assert_eq!(ep, ServiceEndpoint::new("127.0.0.1", 7711));
    }

    #[test]
    fn test_host_defaults_to_loopback() {
        let file = state_file(r#"{"port": 7712}"#);
        let discovery = EndpointDiscovery::with_path(file.path());
        assert_eq!(discovery.endpoint().unwrap().host, "127.0.0.1");
    }

    #[test]
    fn test_cache_and_invalidate() {
        let file = state_file(r#"{"port": 7000}"#);
        let discovery = EndpointDiscovery::with_path(file.path());
        assert_eq!(discovery.endpoint().unwrap().port, 7000);

        // Service restarted on a new port; cached value masks it until
        // invalidated.
        std::fs::write(file.path(), r#"{"port": 7001}"#).unwrap();
        assert_eq!(discovery.endpoint().unwrap().port, 7000);
        discovery.invalidate();
        assert_eq!(discovery.endpoint().unwrap().port, 7001);
    }

    #[test]
    fn test_missing_file_is_discovery_error() {
        let discovery = EndpointDiscovery::with_path("/nonexistent/tether/service.json");
        let err = discovery.endpoint().unwrap_err();
        assert!(matches!(err, TetherError::Discovery(_)));
    }

    #[test]
    fn test_override_bypasses_file() {
        let config = SyncConfig::default().with_endpoint("10.0.0.5:9000");
        let discovery = EndpointDiscovery::from_config(&config).unwrap();
        assert_eq!(
            discovery.endpoint().unwrap(),
            ServiceEndpoint::new("10.0.0.5", 9000)
        );
    }
}
