//! Configuration management for the station recorder service.
//!
//! This module handles loading configuration from environment variables and
//! configuration files.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the recorder service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Camera source configuration
    #[serde(default)]
    pub cameras: CamerasConfig,

    /// Recording and clip-capture configuration
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Upload pipeline configuration
    #[serde(default)]
    pub upload: UploadConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Prometheus metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Configuration for both camera profiles and the selection cache.
#[derive(Debug, Clone, Deserialize)]
pub struct CamerasConfig {
    /// Network-stream camera (preferred when reachable)
    #[serde(default)]
    pub stream: StreamCameraConfig,

    /// Local capture device (fallback)
    #[serde(default)]
    pub device: DeviceCameraConfig,

    /// How long a camera selection stays cached before re-probing, in seconds
    #[serde(default = "default_selection_ttl_secs")]
    pub selection_ttl_secs: u64,
}

/// Network-stream camera profile.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamCameraConfig {
    /// Human-readable camera name
    #[serde(default = "default_stream_name")]
    pub name: String,

    /// Stream host
    #[serde(default = "default_stream_host")]
    pub host: String,

    /// Stream port
    #[serde(default = "default_stream_port")]
    pub port: u16,

    /// Stream path appended to the RTSP URL
    #[serde(default = "default_stream_path")]
    pub path: String,

    /// Reachability probe timeout in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

/// Local capture device profile.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCameraConfig {
    /// Human-readable camera name
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Device node path
    #[serde(default = "default_device_path")]
    pub path: String,

    /// Metadata query timeout in milliseconds
    #[serde(default = "default_device_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

/// Continuous recording and page-clip capture configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    /// Root directory for per-session recording directories
    #[serde(default = "default_recordings_root")]
    pub root: String,

    /// External encoder binary
    #[serde(default = "default_encoder_bin")]
    pub encoder_bin: String,

    /// Media probe binary used for device metadata queries
    #[serde(default = "default_probe_bin")]
    pub probe_bin: String,

    /// Capture frame rate for local devices
    #[serde(default = "default_framerate")]
    pub framerate: u32,

    /// Capture resolution for local devices (WxH)
    #[serde(default = "default_resolution")]
    pub resolution: String,

    /// Encoder preset for the continuous recording (low latency over size)
    #[serde(default = "default_preset")]
    pub preset: String,

    /// Container extension for continuous video files
    #[serde(default = "default_video_ext")]
    pub video_ext: String,

    /// Extension for page-clip artifacts
    #[serde(default = "default_clip_ext")]
    pub clip_ext: String,

    /// Maximum page-clip capture length in seconds
    #[serde(default = "default_clip_cap_secs")]
    pub clip_cap_secs: u64,

    /// Pages viewed shorter than this produce no clip, in seconds
    #[serde(default = "default_min_page_secs")]
    pub min_page_secs: f64,

    /// Downsampled frame rate for page clips
    #[serde(default = "default_clip_framerate")]
    pub clip_framerate: u32,

    /// Reduced width for page clips (height keeps aspect ratio)
    #[serde(default = "default_clip_width")]
    pub clip_width: u32,

    /// Graceful encoder stop budget in milliseconds
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

/// Upload pipeline and object store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Destination bucket for evidence uploads
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Object store region
    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,

    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,

    /// Directory holding the external session-log data files
    #[serde(default = "default_session_data_dir")]
    pub session_data_dir: String,
}

/// API server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,

    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "station-recorder".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_selection_ttl_secs() -> u64 {
    30
}

fn default_stream_name() -> String {
    "ip-camera".to_string()
}

fn default_stream_host() -> String {
    "192.168.1.64".to_string()
}

fn default_stream_port() -> u16 {
    554
}

fn default_stream_path() -> String {
    "/stream1".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_device_name() -> String {
    "usb-camera".to_string()
}

fn default_device_path() -> String {
    "/dev/video0".to_string()
}

fn default_device_probe_timeout_ms() -> u64 {
    3000
}

fn default_recordings_root() -> String {
    "recordings".to_string()
}

fn default_encoder_bin() -> String {
    "ffmpeg".to_string()
}

fn default_probe_bin() -> String {
    "ffprobe".to_string()
}

fn default_framerate() -> u32 {
    30
}

fn default_resolution() -> String {
    "1280x720".to_string()
}

fn default_preset() -> String {
    "ultrafast".to_string()
}

fn default_video_ext() -> String {
    "mp4".to_string()
}

fn default_clip_ext() -> String {
    "gif".to_string()
}

fn default_clip_cap_secs() -> u64 {
    5
}

fn default_min_page_secs() -> f64 {
    1.0
}

fn default_clip_framerate() -> u32 {
    5
}

fn default_clip_width() -> u32 {
    480
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_bucket() -> String {
    "automationstationddata".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_session_data_dir() -> String {
    "session_data".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/recorder").required(false))
            .add_source(config::File::with_name("/etc/station/recorder").required(false))
            // Override with environment variables
            // RECORDER__CAMERAS__STREAM__HOST -> cameras.stream.host
            .add_source(
                config::Environment::with_prefix("RECORDER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl CamerasConfig {
    /// Get the selection cache TTL as Duration
    pub fn selection_ttl(&self) -> Duration {
        Duration::from_secs(self.selection_ttl_secs)
    }
}

impl StreamCameraConfig {
    /// Get the probe timeout as Duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl DeviceCameraConfig {
    /// Get the probe timeout as Duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl RecordingConfig {
    /// Recordings root as a path
    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(&self.root)
    }

    /// Get the graceful stop budget as Duration
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Get the clip capture cap as Duration
    pub fn clip_cap(&self) -> Duration {
        Duration::from_secs(self.clip_cap_secs)
    }
}

impl UploadConfig {
    /// Session-data directory as a path
    pub fn session_data_path(&self) -> PathBuf {
        PathBuf::from(&self.session_data_dir)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for CamerasConfig {
    fn default() -> Self {
        Self {
            stream: StreamCameraConfig::default(),
            device: DeviceCameraConfig::default(),
            selection_ttl_secs: default_selection_ttl_secs(),
        }
    }
}

impl Default for StreamCameraConfig {
    fn default() -> Self {
        Self {
            name: default_stream_name(),
            host: default_stream_host(),
            port: default_stream_port(),
            path: default_stream_path(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for DeviceCameraConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            path: default_device_path(),
            probe_timeout_ms: default_device_probe_timeout_ms(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            root: default_recordings_root(),
            encoder_bin: default_encoder_bin(),
            probe_bin: default_probe_bin(),
            framerate: default_framerate(),
            resolution: default_resolution(),
            preset: default_preset(),
            video_ext: default_video_ext(),
            clip_ext: default_clip_ext(),
            clip_cap_secs: default_clip_cap_secs(),
            min_page_secs: default_min_page_secs(),
            clip_framerate: default_clip_framerate(),
            clip_width: default_clip_width(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            session_data_dir: default_session_data_dir(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let recording = RecordingConfig::default();
        assert_eq!(recording.clip_cap_secs, 5);
        assert_eq!(recording.min_page_secs, 1.0);
        assert_eq!(recording.stop_timeout(), Duration::from_millis(5000));
        assert_eq!(recording.video_ext, "mp4");
        assert_eq!(recording.clip_ext, "gif");
    }

    #[test]
    fn test_camera_defaults() {
        let cameras = CamerasConfig::default();
        assert_eq!(cameras.selection_ttl(), Duration::from_secs(30));
        assert_eq!(cameras.stream.port, 554);
        assert_eq!(cameras.device.path, "/dev/video0");
        assert!(cameras.stream.probe_timeout() < cameras.device.probe_timeout());
    }

    #[test]
    fn test_upload_defaults() {
        let upload = UploadConfig::default();
        assert_eq!(upload.bucket, "automationstationddata");
        assert_eq!(upload.session_data_dir, "session_data");
        assert!(!upload.force_path_style);
    }
}
