use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use crate::errors::Result;
use crate::utils::duration_str;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub arbiter: ArbiterConfig,
    #[serde(default)]
    pub allsky: AllskyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_base_path")]
    pub base_path: String,    // Prefix for every route, e.g. "/indi-allsky"
    pub tls: Option<TlsConfig>,
    pub cors_allow_origin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub index: u32,
    #[serde(default = "default_sensor")]
    pub sensor: String,               // Identifier expected in `--list-cameras` once the camera is free
    #[serde(default = "default_still_command")]
    pub still_command: String,
    #[serde(default = "default_stream_command")]
    pub stream_command: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_stream_quality")]
    pub stream_quality: u8,
    #[serde(default = "default_still_quality")]
    pub still_quality: u8,
    #[serde(default = "default_framerate")]
    pub default_framerate: u32,
    #[serde(default = "default_images_directory")]
    pub images_directory: PathBuf,
    #[serde(default = "default_chunk_read_size")]
    pub chunk_read_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_readiness_timeout", with = "duration_str")]
    pub readiness_timeout: Duration,
    #[serde(default = "default_readiness_poll_interval", with = "duration_str")]
    pub readiness_poll_interval: Duration,
    #[serde(default = "default_stop_grace", with = "duration_str")]
    pub stop_grace: Duration,         // Wait after SIGTERM before escalating
    #[serde(default = "default_kill_grace", with = "duration_str")]
    pub kill_grace: Duration,         // Wait after SIGKILL
    #[serde(default = "default_frame_wait", with = "duration_str")]
    pub frame_wait: Duration,
    #[serde(default = "default_feed_wait", with = "duration_str")]
    pub feed_wait: Duration,
    #[serde(default = "default_client_poll_interval", with = "duration_str")]
    pub client_poll_interval: Duration,
    #[serde(default = "default_still_timeout", with = "duration_str")]
    pub still_timeout: Duration,
    #[serde(default = "default_diagnostic_bytes")]
    pub diagnostic_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_timer")]
    pub timer: String,
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
    #[serde(default = "default_command_timeout", with = "duration_str")]
    pub command_timeout: Duration,
    #[serde(default = "default_release_attempts")]
    pub release_attempts: u32,
    #[serde(default = "default_release_poll_interval", with = "duration_str")]
    pub release_poll_interval: Duration,
    #[serde(default = "default_list_timeout", with = "duration_str")]
    pub list_timeout: Duration,
}

/// Where the always-on capture service keeps its settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllskyConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_base_path() -> String { "/indi-allsky".to_string() }
fn default_sensor() -> String { "imx415".to_string() }
fn default_still_command() -> String { "rpicam-still".to_string() }
fn default_stream_command() -> String { "rpicam-vid".to_string() }
fn default_width() -> u32 { 1920 }
fn default_height() -> u32 { 1080 }
fn default_stream_quality() -> u8 { 75 }
fn default_still_quality() -> u8 { 90 }
fn default_framerate() -> u32 { 10 }
fn default_images_directory() -> PathBuf { PathBuf::from("/var/www/html/allsky/images") }
fn default_chunk_read_size() -> usize { 64 * 1024 }
fn default_readiness_timeout() -> Duration { Duration::from_secs(8) }
fn default_readiness_poll_interval() -> Duration { Duration::from_millis(100) }
fn default_stop_grace() -> Duration { Duration::from_secs(5) }
fn default_kill_grace() -> Duration { Duration::from_secs(2) }
fn default_frame_wait() -> Duration { Duration::from_secs(5) }
fn default_feed_wait() -> Duration { Duration::from_secs(5) }
fn default_client_poll_interval() -> Duration { Duration::from_millis(33) }
fn default_still_timeout() -> Duration { Duration::from_secs(30) }
fn default_diagnostic_bytes() -> usize { 500 }
fn default_true() -> bool { true }
fn default_service() -> String { "indi-allsky".to_string() }
fn default_timer() -> String { "indi-allsky.timer".to_string() }
fn default_lock_file() -> PathBuf { PathBuf::from("/tmp/allsky-stream.lock") }
fn default_command_timeout() -> Duration { Duration::from_secs(10) }
fn default_release_attempts() -> u32 { 10 }
fn default_release_poll_interval() -> Duration { Duration::from_millis(500) }
fn default_list_timeout() -> Duration { Duration::from_secs(5) }
fn default_database_path() -> String { "/var/lib/indi-allsky/indi-allsky.sqlite".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_path: default_base_path(),
            tls: None,
            cors_allow_origin: Some("*".to_string()),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            sensor: default_sensor(),
            still_command: default_still_command(),
            stream_command: default_stream_command(),
            width: default_width(),
            height: default_height(),
            stream_quality: default_stream_quality(),
            still_quality: default_still_quality(),
            default_framerate: default_framerate(),
            images_directory: default_images_directory(),
            chunk_read_size: default_chunk_read_size(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            readiness_timeout: default_readiness_timeout(),
            readiness_poll_interval: default_readiness_poll_interval(),
            stop_grace: default_stop_grace(),
            kill_grace: default_kill_grace(),
            frame_wait: default_frame_wait(),
            feed_wait: default_feed_wait(),
            client_poll_interval: default_client_poll_interval(),
            still_timeout: default_still_timeout(),
            diagnostic_bytes: default_diagnostic_bytes(),
        }
    }
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service: default_service(),
            timer: default_timer(),
            lock_file: default_lock_file(),
            command_timeout: default_command_timeout(),
            release_attempts: default_release_attempts(),
            release_poll_interval: default_release_poll_interval(),
            list_timeout: default_list_timeout(),
        }
    }
}

impl Default for AllskyConfig {
    fn default() -> Self {
        Self { database_path: default_database_path() }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = if path.ends_with(".json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };

        config.server.base_path = normalize_base_path(&config.server.base_path);

        info!("Loaded configuration from {} (camera {} via {}/{})",
              path, config.camera.index, config.camera.stream_command, config.camera.still_command);
        Ok(config)
    }
}

// "" and "/" both mean "mount at the root"; otherwise leading slash, no trailing slash
fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(r#"
            [camera]
            sensor = "imx477"
            default_framerate = 5

            [stream]
            readiness_timeout = "3s"
            client_poll_interval = "50ms"
        "#).unwrap();

        assert_eq!(config.camera.sensor, "imx477");
        assert_eq!(config.camera.default_framerate, 5);
        assert_eq!(config.camera.stream_command, "rpicam-vid");
        assert_eq!(config.stream.readiness_timeout, Duration::from_secs(3));
        assert_eq!(config.stream.client_poll_interval, Duration::from_millis(50));
        assert_eq!(config.stream.stop_grace, Duration::from_secs(5));
        assert_eq!(config.stream.kill_grace, Duration::from_secs(2));
        assert_eq!(config.stream.diagnostic_bytes, 500);
        assert_eq!(config.server.port, 8080);
        assert!(config.arbiter.enabled);
        assert_eq!(config.allsky.database_path, "/var/lib/indi-allsky/indi-allsky.sqlite");
    }

    #[test]
    fn test_bad_duration_is_rejected() {
        let parsed = toml::from_str::<Config>(r#"
            [stream]
            stop_grace = "soon"
        "#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_load_json_and_normalize_base_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"server": {"base_path": "allsky/"}, "arbiter": {"enabled": false}}"#).unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.base_path, "/allsky");
        assert!(!config.arbiter.enabled);
        assert_eq!(normalize_base_path("/"), "");
    }
}
