use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_CLIENT_FILES_PREFIX: &str = "C:/users/user/My Documents/WeChat Files/";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Local mirror of the chat client's `WeChat Files` directory.
    pub dir: PathBuf,
    /// The same directory as seen by the chat client (a Windows path).
    /// Asked from the client at startup when unset.
    pub base_path: Option<String>,
    pub channel_id: String,
    pub send_timeout_secs: u64,
    pub media_timeout_secs: u64,
    pub tick_millis: u64,
    pub dedup_capacity: usize,
    pub retry_poll_attempts: u32,
    /// Prefix of CDN download paths reported by the client, replaced by `dir`.
    pub client_files_prefix: String,
    pub directory_refresh_ticks: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::new(),
            base_path: None,
            channel_id: "honus.comwechat".to_string(),
            send_timeout_secs: 15,
            media_timeout_secs: 120,
            tick_millis: 1000,
            dedup_capacity: 200,
            retry_poll_attempts: 12,
            client_files_prefix: DEFAULT_CLIENT_FILES_PREFIX.to_string(),
            directory_refresh_ticks: 1800,
        }
    }
}

impl BridgeConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Window for media downloads, duplicate suppression and staged-file cleanup.
    pub fn media_timeout(&self) -> Duration {
        Duration::from_secs(self.media_timeout_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("dir"));
        }
        if self.channel_id.trim().is_empty() {
            return Err(ConfigError::Missing("channel_id"));
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: BridgeConfig =
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}
