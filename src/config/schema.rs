use serde::{Deserialize, Serialize};
use std::time::Duration;
use typeshare::typeshare;

use crate::error::{AppError, Result};
use crate::whep::config::default_stun_servers;

/// Main application configuration
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Cameras shown on the wall, one tile each
    pub streams: Vec<StreamDescriptor>,
    /// WHEP connection settings shared by every tile
    pub connection: ConnectionConfig,
    /// Log output settings
    pub log: LogConfig,
}

/// Log output format
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Log configuration
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level used when neither the CLI nor RUST_LOG sets one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    pub format: LogFormat,
}

/// Camera stream identity
///
/// Immutable once a tile is mounted. Changing `camera_key` for a tile
/// is a camera swap and recreates the whole session.
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Tile/stream identifier
    pub id: String,
    /// Display title
    #[serde(default)]
    pub title: String,
    /// Media server path key, used to build `{base_url}/{camera_key}/whep`
    #[serde(alias = "cameraId")]
    pub camera_key: String,
    /// Resolution label, e.g. "1920x1080"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    /// Nominal frame rate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    /// Physical location, e.g. "Block C, corridor 2"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl StreamDescriptor {
    pub fn new(id: impl Into<String>, camera_key: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            camera_key: camera_key.into(),
            resolution: None,
            fps: None,
            location: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Whether `other` points at the same camera (identity used for swaps)
    pub fn same_camera(&self, other: &StreamDescriptor) -> bool {
        self.camera_key == other.camera_key
    }
}

/// When the host error notification fires
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorNotification {
    /// Only once retries are exhausted
    #[default]
    Terminal,
    /// On every hard failure, including ones that will be retried
    EveryFailure,
}

/// WHEP connection configuration
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// WHEP server root, e.g. "http://127.0.0.1:8889"
    pub base_url: String,
    /// Basic-auth credentials as "user:password"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_credentials: Option<String>,
    /// Fixed delay before an automatic reconnect (ms)
    pub reconnect_delay_ms: u64,
    /// Failures tolerated before the tile needs a manual retry
    pub max_reconnect_attempts: u32,
    /// Health check period (ms)
    pub health_check_interval_ms: u64,
    /// No frame progress for this long means the stream is dead (ms)
    pub stream_stall_timeout_ms: u64,
    /// Upper bound for the WHEP offer/answer request (ms)
    pub signaling_timeout_ms: u64,
    /// Upper bound for ICE to reach connected after the answer is applied (ms)
    pub ice_connect_timeout_ms: u64,
    /// Random extra delay added to each reconnect, 0 disables (ms)
    pub reconnect_jitter_ms: u64,
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// When to notify the host about failures
    pub error_notification: ErrorNotification,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            auth_credentials: None,
            reconnect_delay_ms: 5000,
            max_reconnect_attempts: 3,
            health_check_interval_ms: 5000,
            stream_stall_timeout_ms: 12000,
            signaling_timeout_ms: 10000,
            ice_connect_timeout_ms: 15000,
            reconnect_jitter_ms: 0,
            stun_servers: default_stun_servers(),
            error_notification: ErrorNotification::Terminal,
        }
    }
}

impl ConnectionConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Check the values a session cannot start without
    pub fn validate(&self) -> Result<()> {
        let base = self.base_url.trim();
        if base.is_empty() {
            return Err(AppError::Config("base_url is required".to_string()));
        }
        let url = reqwest::Url::parse(base)
            .map_err(|e| AppError::Config(format!("Invalid base_url '{}': {}", base, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::Config(format!(
                "Unsupported base_url scheme: {}",
                url.scheme()
            )));
        }
        if self.health_check_interval_ms == 0 {
            return Err(AppError::Config(
                "health_check_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.signaling_timeout_ms == 0 {
            return Err(AppError::Config(
                "signaling_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn stream_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_stall_timeout_ms)
    }

    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_timeout_ms)
    }

    pub fn ice_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_connect_timeout_ms)
    }
}
