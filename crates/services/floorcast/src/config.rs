//! Configuration for the broadcaster and the relay
//!
//! Configuration can be loaded from a TOML file and/or environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Control-plane credentials and endpoint
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,

    /// Capture devices and chunking
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Relay connection (sender side)
    #[serde(default)]
    pub relay: RelayConfig,

    /// Transcode/publish profile (relay side)
    #[serde(default)]
    pub publish: PublishConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Display-layer HTTP API port (broadcaster)
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// WebSocket relay port (relay)
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,

    /// Browser origins allowed to call the API cross-origin
    ///
    /// Empty means same-origin only. `*` is not accepted.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_relay_port() -> u16 {
    8090
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_port: default_api_port(),
            relay_port: default_relay_port(),
            allowed_origins: Vec::new(),
        }
    }
}

/// Control-plane configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// API base URL
    #[serde(default = "default_control_plane_url")]
    pub base_url: String,

    /// Service account id (sent as a credential header)
    #[serde(default)]
    pub service_account_id: String,

    /// Service account secret (sent as a credential header)
    #[serde(default)]
    pub service_account_secret: String,

    /// Request timeout in seconds
    #[serde(default = "default_control_plane_timeout")]
    pub timeout_seconds: u64,
}

fn default_control_plane_url() -> String {
    "https://api.thetavideoapi.com".to_string()
}

fn default_control_plane_timeout() -> u64 {
    10
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            base_url: default_control_plane_url(),
            service_account_id: String::new(),
            service_account_secret: String::new(),
            timeout_seconds: default_control_plane_timeout(),
        }
    }
}

impl std::fmt::Debug for ControlPlaneConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneConfig")
            .field("base_url", &self.base_url)
            .field("service_account_id", &self.service_account_id)
            .field("service_account_secret", &"<redacted>")
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// ffmpeg executable used for device capture
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: String,

    /// Chunk cadence in milliseconds
    #[serde(default = "default_chunk_interval")]
    pub chunk_interval_ms: u64,

    /// ffmpeg input format for the camera (e.g. `v4l2`, `avfoundation`)
    #[serde(default = "default_video_format")]
    pub video_format: String,

    /// Camera device; capture is video-less when unset
    #[serde(default = "default_video_device")]
    pub video_device: Option<String>,

    /// ffmpeg input format for the microphone (e.g. `pulse`, `alsa`)
    #[serde(default = "default_audio_format")]
    pub audio_format: String,

    /// Microphone device; capture is audio-less when unset
    #[serde(default = "default_audio_device")]
    pub audio_device: Option<String>,

    /// How long a freshly spawned capture process must survive to count as acquired
    #[serde(default = "default_probe_ms")]
    pub acquire_probe_ms: u64,

    /// Capacity of the chunk channel between capture and relay
    #[serde(default = "default_chunk_channel")]
    pub channel_capacity: usize,
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_chunk_interval() -> u64 {
    1000
}

fn default_video_format() -> String {
    "v4l2".to_string()
}

fn default_video_device() -> Option<String> {
    Some("/dev/video0".to_string())
}

fn default_audio_format() -> String {
    "pulse".to_string()
}

fn default_audio_device() -> Option<String> {
    Some("default".to_string())
}

fn default_probe_ms() -> u64 {
    500
}

fn default_chunk_channel() -> usize {
    64
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg(),
            chunk_interval_ms: default_chunk_interval(),
            video_format: default_video_format(),
            video_device: default_video_device(),
            audio_format: default_audio_format(),
            audio_device: default_audio_device(),
            acquire_probe_ms: default_probe_ms(),
            channel_capacity: default_chunk_channel(),
        }
    }
}

impl CaptureConfig {
    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }
}

/// Relay client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// WebSocket URL of the relay
    #[serde(default = "default_relay_url")]
    pub url: String,

    /// Frames buffered for sending before new chunks are dropped
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,

    /// Connection open timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:8090/relay".to_string()
}

fn default_send_buffer() -> usize {
    32
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            send_buffer: default_send_buffer(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

/// Transcode/publish configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// ffmpeg executable used for transcoding and publishing
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: String,

    /// Pending chunks held before the oldest is dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// x264 preset
    #[serde(default = "default_preset")]
    pub video_preset: String,

    /// Target video bitrate (ffmpeg notation)
    #[serde(default = "default_video_bitrate")]
    pub video_bitrate: String,

    /// Target audio bitrate (ffmpeg notation)
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
}

fn default_queue_capacity() -> usize {
    8
}

fn default_preset() -> String {
    "veryfast".to_string()
}

fn default_video_bitrate() -> String {
    "2500k".to_string()
}

fn default_audio_bitrate() -> String {
    "128k".to_string()
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg(),
            queue_capacity: default_queue_capacity(),
            video_preset: default_preset(),
            video_bitrate: default_video_bitrate(),
            audio_bitrate: default_audio_bitrate(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Override fields from `FLOORCAST_*` variables provided by `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Server
        if let Some(host) = lookup("FLOORCAST_HOST") {
            self.server.host = host;
        }
        if let Some(p) = lookup("FLOORCAST_API_PORT").and_then(|v| v.parse().ok()) {
            self.server.api_port = p;
        }
        if let Some(p) = lookup("FLOORCAST_RELAY_PORT").and_then(|v| v.parse().ok()) {
            self.server.relay_port = p;
        }
        if let Some(origins) = lookup("FLOORCAST_ALLOWED_ORIGINS") {
            self.server.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect();
        }

        // Control-plane
        if let Some(url) = lookup("FLOORCAST_CONTROL_PLANE_URL") {
            self.control_plane.base_url = url;
        }
        if let Some(id) = lookup("FLOORCAST_SERVICE_ACCOUNT_ID") {
            self.control_plane.service_account_id = id;
        }
        if let Some(secret) = lookup("FLOORCAST_SERVICE_ACCOUNT_SECRET") {
            self.control_plane.service_account_secret = secret;
        }

        // Capture
        if let Some(path) = lookup("FLOORCAST_FFMPEG") {
            self.capture.ffmpeg_path = path.clone();
            self.publish.ffmpeg_path = path;
        }
        if let Some(ms) = lookup("FLOORCAST_CHUNK_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.capture.chunk_interval_ms = ms;
        }
        if let Some(device) = lookup("FLOORCAST_VIDEO_DEVICE") {
            self.capture.video_device = Some(device).filter(|d| !d.is_empty());
        }
        if let Some(device) = lookup("FLOORCAST_AUDIO_DEVICE") {
            self.capture.audio_device = Some(device).filter(|d| !d.is_empty());
        }

        // Relay
        if let Some(url) = lookup("FLOORCAST_RELAY_URL") {
            self.relay.url = url;
        }

        // Publish
        if let Some(cap) = lookup("FLOORCAST_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
            self.publish.queue_capacity = cap;
        }
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
        }
        Ok(Self::from_env())
    }

    /// Check the settings the broadcaster cannot run without
    pub fn validate_broadcaster(&self) -> Result<(), ConfigError> {
        if self.control_plane.service_account_id.is_empty()
            || self.control_plane.service_account_secret.is_empty()
        {
            return Err(ConfigError::Invalid(
                "control_plane.service_account_id and service_account_secret are required"
                    .to_string(),
            ));
        }
        if self.capture.video_device.is_none() && self.capture.audio_device.is_none() {
            return Err(ConfigError::Invalid(
                "at least one of capture.video_device or capture.audio_device is required"
                    .to_string(),
            ));
        }
        match url::Url::parse(&self.relay.url) {
            Ok(url) if url.scheme() == "ws" || url.scheme() == "wss" => {}
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "relay.url must be a ws:// or wss:// URL, got: {}",
                    self.relay.url
                )))
            }
        }
        if self.capture.chunk_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "capture.chunk_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.api_port, 8080);
        assert_eq!(config.server.relay_port, 8090);
        assert_eq!(config.capture.chunk_interval_ms, 1000);
        assert_eq!(config.publish.queue_capacity, 8);
        assert_eq!(config.control_plane.base_url, "https://api.thetavideoapi.com");
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[server]
api_port = 9090

[control_plane]
service_account_id = "srvacc_1"
service_account_secret = "shh"

[capture]
chunk_interval_ms = 500
audio_device = "hw:1"

[publish]
queue_capacity = 3
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.api_port, 9090);
        assert_eq!(config.server.relay_port, 8090);
        assert_eq!(config.control_plane.service_account_id, "srvacc_1");
        assert_eq!(config.capture.chunk_interval(), Duration::from_millis(500));
        assert_eq!(config.capture.audio_device.as_deref(), Some("hw:1"));
        assert_eq!(config.publish.queue_capacity, 3);
        assert!(config.validate_broadcaster().is_ok());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\nurl = \"ws://relay.internal:9000/relay\"").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.relay.url, "ws://relay.internal:9000/relay");
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\napi_port = ").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FLOORCAST_API_PORT", "7000"),
            ("FLOORCAST_SERVICE_ACCOUNT_SECRET", "from-env"),
            ("FLOORCAST_AUDIO_DEVICE", ""),
            ("FLOORCAST_FFMPEG", "/opt/ffmpeg/bin/ffmpeg"),
            ("FLOORCAST_CHUNK_INTERVAL_MS", "not-a-number"),
            ("FLOORCAST_ALLOWED_ORIGINS", "http://localhost:5173, ,https://display.example.net"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.api_port, 7000);
        assert_eq!(
            config.server.allowed_origins,
            vec!["http://localhost:5173", "https://display.example.net"]
        );
        assert!(Config::default().server.allowed_origins.is_empty());
        assert_eq!(config.control_plane.service_account_secret, "from-env");
        assert_eq!(config.capture.audio_device, None);
        assert_eq!(config.publish.ffmpeg_path, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.capture.chunk_interval_ms, 1000);
    }

    #[test]
    fn test_validate_requires_credentials_and_a_device() {
        let mut config = Config::default();
        assert!(config.validate_broadcaster().is_err());

        config.control_plane.service_account_id = "id".to_string();
        config.control_plane.service_account_secret = "secret".to_string();
        assert!(config.validate_broadcaster().is_ok());

        config.relay.url = "http://relay/relay".to_string();
        assert!(config.validate_broadcaster().is_err());
        config.relay.url = "wss://relay.example.net/relay".to_string();
        assert!(config.validate_broadcaster().is_ok());

        config.capture.video_device = None;
        config.capture.audio_device = None;
        assert!(config.validate_broadcaster().is_err());
    }

    #[test]
    fn test_secret_not_in_debug_output() {
        let mut config = ControlPlaneConfig::default();
        config.service_account_secret = "top-secret".to_string();
        assert!(!format!("{:?}", config).contains("top-secret"));
    }
}
