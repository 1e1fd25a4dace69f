//! Client configuration

use crate::identity::ParticipantId;
use crate::negotiator::{IceServer, NegotiatorConfig};
use crate::signaling::SignalingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid configuration JSON
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    /// Value out of range or inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything a client needs to place and receive calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Local participant identity
    pub participant: ParticipantId,
    /// WebSocket relay endpoint
    pub relay_url: Url,
    /// Record service REST root
    pub api_base_url: Url,
    /// Bearer token for the record service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Traversal servers
    pub ice_servers: Vec<IceServer>,
    /// Record service request timeout in seconds
    pub request_timeout_secs: u64,
    /// First relay reconnect delay in milliseconds
    pub reconnect_min_ms: u64,
    /// Relay reconnect delay cap in milliseconds
    pub reconnect_max_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            participant: ParticipantId::new(""),
            relay_url: default_url("ws://localhost:8000/"),
            api_base_url: default_url("http://localhost:8000/api"),
            access_token: None,
            ice_servers: NegotiatorConfig::default().ice_servers,
            request_timeout_secs: 10,
            reconnect_min_ms: 250,
            reconnect_max_ms: 10_000,
        }
    }
}

// Only called with literal URLs
#[allow(clippy::expect_used)]
fn default_url(s: &str) -> Url {
    Url::parse(s).expect("default URL is valid")
}

impl ClientConfig {
    /// Load from a JSON file; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        tracing::debug!(path = %path.display(), "Loaded client configuration");
        Ok(config)
    }

    /// Check the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns error naming the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.participant.as_str().trim().is_empty() {
            return Err(ConfigError::Invalid("participant id is required".to_string()));
        }
        if !matches!(self.relay_url.scheme(), "ws" | "wss") {
            return Err(ConfigError::Invalid(format!(
                "relay URL must be ws:// or wss://, got {}",
                self.relay_url
            )));
        }
        if !matches!(self.api_base_url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "API base URL must be http:// or https://, got {}",
                self.api_base_url
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request timeout must be non-zero".to_string()));
        }
        if self.reconnect_min_ms == 0 || self.reconnect_min_ms > self.reconnect_max_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect backoff bounds {}..{} ms are inconsistent",
                self.reconnect_min_ms, self.reconnect_max_ms
            )));
        }
        self.negotiator_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Negotiator settings
    pub fn negotiator_config(&self) -> NegotiatorConfig {
        NegotiatorConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }

    /// Relay channel settings
    pub fn signaling_config(&self) -> SignalingConfig {
        SignalingConfig {
            relay_url: self.relay_url.clone(),
            participant: self.participant.clone(),
            reconnect_min: Duration::from_millis(self.reconnect_min_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
        }
    }

    /// Record service request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
