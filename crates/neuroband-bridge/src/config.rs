use neuroband_types::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::polling::PollSpec;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub backend: BackendConfig,
    pub stream: StreamConfig,
    pub polling: PollingConfig,
    pub telemetry: TelemetryConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Explicit backend executable. When unset the supervisor probes the
    /// usual install locations and falls back to the system PATH.
    pub executable: Option<PathBuf>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub port: u16,
    pub ready_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub restart_delay_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            executable: None,
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            port: 8765,
            ready_timeout_secs: 30,
            shutdown_grace_secs: 5,
            restart_delay_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub port: u16,
    pub path: String,
    /// Loopback host variants tried in order. Some resolver setups only
    /// answer on one of `127.0.0.1` / `localhost` / `[::1]`.
    pub hosts: Vec<String>,
    pub connect_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub liveness_interval_secs: u64,
    pub liveness_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            port: 8765,
            path: "/stream".to_string(),
            hosts: vec![
                "127.0.0.1".to_string(),
                "localhost".to_string(),
                "[::1]".to_string(),
            ],
            connect_timeout_secs: 3,
            health_check_interval_secs: 10,
            liveness_interval_secs: 5,
            liveness_timeout_secs: 30,
        }
    }
}

impl StreamConfig {
    pub fn endpoints(&self) -> Vec<String> {
        self.hosts
            .iter()
            .map(|host| format!("ws://{}:{}{}", host, self.port, self.path))
            .collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Base URL of the backend status API; derived from the backend port
    /// when unset.
    pub api_base: Option<String>,
    pub request_timeout_secs: u64,
    pub status_interval_secs: u64,
    pub status_init_interval_secs: u64,
    pub init_window_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            request_timeout_secs: 2,
            status_interval_secs: 5,
            status_init_interval_secs: 1,
            init_window_secs: 30,
        }
    }
}

impl PollingConfig {
    pub fn base_url(&self, backend_port: u16) -> String {
        self.api_base
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", backend_port))
    }

    pub fn status_spec(&self) -> PollSpec {
        PollSpec {
            normal_interval: Duration::from_secs(self.status_interval_secs),
            init_interval: Duration::from_secs(self.status_init_interval_secs),
            init_duration: Duration::from_secs(self.init_window_secs),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl BridgeConfig {
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| BridgeError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> BridgeResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> BridgeResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BridgeError::Config(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        let raw = toml::to_string_pretty(self)
            .map_err(|e| BridgeError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, raw)
            .map_err(|e| BridgeError::Config(format!("Failed to write {}: {}", path.display(), e)))
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("neuroband")
            .join("bridge.toml")
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.backend.port == 0 {
            return Err(BridgeError::Config("backend.port must be non-zero".into()));
        }
        if self.backend.ready_timeout_secs == 0 {
            return Err(BridgeError::Config("backend.ready_timeout_secs must be non-zero".into()));
        }
        if self.backend.shutdown_grace_secs == 0 {
            return Err(BridgeError::Config("backend.shutdown_grace_secs must be non-zero".into()));
        }
        if self.stream.port == 0 {
            return Err(BridgeError::Config("stream.port must be non-zero".into()));
        }
        if self.stream.hosts.is_empty() {
            return Err(BridgeError::Config("stream.hosts must list at least one candidate".into()));
        }
        if !self.stream.path.starts_with('/') {
            return Err(BridgeError::Config("stream.path must start with '/'".into()));
        }
        if self.stream.connect_timeout_secs == 0 {
            return Err(BridgeError::Config("stream.connect_timeout_secs must be non-zero".into()));
        }
        if self.polling.status_interval_secs == 0 || self.polling.status_init_interval_secs == 0 {
            return Err(BridgeError::Config("polling intervals must be non-zero".into()));
        }
        if self.telemetry.capacity == 0 {
            return Err(BridgeError::Config("telemetry.capacity must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_endpoints_follow_host_order() {
        let config = StreamConfig::default();
        let endpoints = config.endpoints();
        assert_eq!(endpoints[0], "ws://127.0.0.1:8765/stream");
        assert_eq!(endpoints[1], "ws://localhost:8765/stream");
        assert_eq!(endpoints[2], "ws://[::1]:8765/stream");
    }

    #[test]
    fn test_invalid_port_rejected() {
        let mut config = BridgeConfig::default();
        config.backend.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_hosts_rejected() {
        let mut config = BridgeConfig::default();
        config.stream.hosts.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = BridgeConfig::default();
        config.backend.port = 9100;
        config.stream.hosts = vec!["127.0.0.1".to_string()];
        let raw = toml::to_string_pretty(&config).unwrap();
        let parsed: BridgeConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.backend.port, 9100);
        assert_eq!(parsed.stream.hosts.len(), 1);
    }

    #[test]
    fn test_base_url_falls_back_to_backend_port() {
        let polling = PollingConfig::default();
        assert_eq!(polling.base_url(8765), "http://127.0.0.1:8765");

        let with_base = PollingConfig {
            api_base: Some("http://127.0.0.1:9000".to_string()),
            ..Default::default()
        };
        assert_eq!(with_base.base_url(8765), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: BridgeConfig = toml::from_str("[backend]\nport = 9200\n").unwrap();
        assert_eq!(parsed.backend.port, 9200);
        assert_eq!(parsed.backend.ready_timeout_secs, 30);
        assert_eq!(parsed.stream.hosts.len(), 3);
    }
}
