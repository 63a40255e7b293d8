use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub twitter: TwitterConfig,
    #[serde(default = "default_media_config")]
    pub media: MediaConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Set by the link handshake; absent until the bot is linked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_user_id: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TwitterConfig {
    /// OAuth2 user-context token with tweet.write, dm.write and
    /// media.write scopes.
    pub access_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MediaConfig {
    /// Scratch directory for downloaded voice notes and converted videos.
    #[serde(default = "default_media_dir")]
    pub directory: PathBuf,
}

fn default_api_base() -> String {
    "https://api.x.com".to_string()
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("media")
}

fn default_media_config() -> MediaConfig {
    MediaConfig {
        directory: default_media_dir(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if !config.media.directory.exists() {
            std::fs::create_dir_all(&config.media.directory).with_context(|| {
                format!(
                    "Failed to create media directory: {}",
                    config.media.directory.display()
                )
            })?;
        }

        Ok(config)
    }

    /// Writes the config back out. Called once, right after the link
    /// handshake fixes `linked_user_id`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}
