//! HTTP implementation of the pull contract
//!
//! `GET {base}/api/{kind}/ids` returns the authoritative id list;
//! `GET {base}/api/{kind}/{id}` returns the full entity object. The base URL
//! comes from endpoint discovery on every request, so a reconnect after a
//! service restart transparently switches ports.

use super::RemoteService;
use crate::config::SyncConfig;
use crate::discovery::EndpointDiscovery;
use crate::error::{TetherError, TetherResult};
use crate::types::{EntityId, EntityKind, EntitySnapshot};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::sync::Arc;
use tracing::debug;

/// Blocking HTTP client for the companion service's pull API
pub struct HttpRemoteService {
    client: Client,
    discovery: Arc<EndpointDiscovery>,
}

impl HttpRemoteService {
    /// Build a client from the shared discovery and config
    pub fn new(discovery: Arc<EndpointDiscovery>, config: &SyncConfig) -> TetherResult<Self> {
        let client = Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| TetherError::http(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, discovery })
    }

    fn url(&self, path: &str) -> TetherResult<String> {
        let endpoint = self.discovery.endpoint()?;
        Ok(format!("{}/{}", endpoint.base_url(), path))
    }
}

impl RemoteService for HttpRemoteService {
    fn list_identifiers(&self, kind: EntityKind) -> TetherResult<Vec<EntityId>> {
        let url = self.url(&format!("api/{}/ids", kind.channel_name()))?;
        debug!(%url, "listing identifiers");
        let response = self.client.get(&url).send()?;
        if !response.status().is_success() {
            return Err(TetherError::http(format!(
                "listing {} ids failed: {}",
                kind,
                response.status()
            )));
        }
        let ids: Vec<String> = response.json()?;
        Ok(ids.into_iter().map(EntityId::from).collect())
    }

    fn fetch(&self, kind: EntityKind, id: &EntityId) -> TetherResult<EntitySnapshot> {
        let url = self.url(&format!("api/{}/{}", kind.channel_name(), id))?;
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| TetherError::resolve(id.as_str(), e.to_string()))?;
        match response.status() {
            status if status.is_success() => {
                let value: serde_json::Value = response
                    .json()
                    .map_err(|e| TetherError::resolve(id.as_str(), e.to_string()))?;
                Ok(EntitySnapshot::new(id.clone(), value))
            }
            StatusCode::NOT_FOUND => Err(TetherError::resolve(id.as_str(), "not found")),
            status => Err(TetherError::resolve(
                id.as_str(),
                format!("unexpected status {}", status),
            )),
        }
    }
}
