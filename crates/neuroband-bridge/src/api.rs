use neuroband_types::{BridgeError, BridgeResult};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// Thin client for the backend's local status endpoints. Poll callbacks go
/// through here; a request that fails is a failed tick and nothing more.
pub struct StatusApi {
    client: Client,
    base_url: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub uptime_secs: Option<u64>,
}

impl StatusApi {
    pub fn new(base_url: String, request_timeout: Duration) -> BridgeResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| BridgeError::Http(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    pub async fn fetch_json(&self, endpoint: &str) -> BridgeResult<serde_json::Value> {
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BridgeError::Http(format!("GET {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(BridgeError::Http(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| BridgeError::Http(format!("GET {} bad body: {}", url, e)))
    }

    pub async fn health(&self) -> BridgeResult<HealthResponse> {
        let value = self.fetch_json("/health").await?;
        serde_json::from_value(value)
            .map_err(|e| BridgeError::Serialization(format!("Bad health response: {}", e)))
    }

    pub async fn status(&self) -> BridgeResult<serde_json::Value> {
        self.fetch_json("/status").await
    }
}
