// Application configuration.
// Logging defaults to on in debug builds and off in release builds; RUST_LOG overrides both.

use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

/// Environment variable pointing at a YAML config file
pub const CONFIG_PATH_ENV: &str = "MESHROOM_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file: {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Capture constraints handed to a [`crate::media::MediaSource`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
}

impl MediaConstraints {
    pub fn camera() -> Self {
        Self {
            video: Some(VideoConstraints {
                width: 1280,
                height: 720,
            }),
            audio: true,
        }
    }

    pub fn display() -> Self {
        Self {
            video: Some(VideoConstraints {
                width: 1920,
                height: 1080,
            }),
            audio: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub discovery_interval_ms: u64,
    /// Stop polling after this long. `None` keeps discovering for the whole session.
    pub discovery_window_ms: Option<u64>,
    /// How long a disconnected peer connection may take to recover before it is closed
    pub grace_period_ms: u64,
    /// How long a call may take to reach a connected state before it is failed
    pub negotiation_timeout_ms: u64,
    pub camera: MediaConstraints,
    pub display: MediaConstraints,
    pub carry_audio_into_screen_share: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            discovery_interval_ms: 2000,
            discovery_window_ms: None,
            grace_period_ms: 10_000,
            negotiation_timeout_ms: 15_000,
            camera: MediaConstraints::camera(),
            display: MediaConstraints::display(),
            carry_audio_into_screen_share: true,
        }
    }
}

impl MeshConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config: Self =
            serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the file named by `MESHROOM_CONFIG`, falling back to defaults when unset
    pub fn load_from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from_file(path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "discovery_interval_ms must be greater than zero".into(),
            ));
        }
        if self.negotiation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "negotiation_timeout_ms must be greater than zero".into(),
            ));
        }
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "ICE server {} has an empty url",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn discovery_window(&self) -> Option<Duration> {
        self.discovery_window_ms.map(Duration::from_millis)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_client() {
        let config = MeshConfig::default();
        assert_eq!(config.discovery_interval(), Duration::from_secs(2));
        assert!(config.discovery_window().is_none());
        assert_eq!(config.negotiation_timeout(), Duration::from_secs(15));
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.camera.video.map(|v| v.width), Some(1280));
        assert!(!config.display.audio);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: MeshConfig =
            serde_yaml::from_str("discovery_interval_ms: 500\ndiscovery_window_ms: 10000\n")
                .expect("parse");
        assert_eq!(config.discovery_interval(), Duration::from_millis(500));
        assert_eq!(config.discovery_window(), Some(Duration::from_secs(10)));
        assert!(config.carry_audio_into_screen_share);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let mut config = MeshConfig::default();
        config.ice_servers.push(ServerConfig {
            id: "relay".into(),
            r#type: "turn".into(),
            url: "turn.example.org:3478".into(),
            username: Some("user".into()),
            credential: None,
        });
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("relay")),
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = MeshConfig {
            discovery_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_missing_file_reports_path() {
        let path = std::env::temp_dir().join(format!("meshroom-{}.yaml", crate::utils::random_id()));
        match MeshConfig::load_from_file(&path) {
            Err(ConfigError::Io { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected io error, got {other:?}"),
        }
    }
}
