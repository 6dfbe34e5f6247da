// Configuration management for the blemesh CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/blemesh/config.json
// - Linux: ~/.config/blemesh/config.json
// - Windows: %APPDATA%\blemesh\config.json

use anyhow::{Context, Result};
use blemesh_core::MeshConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Nickname used by the first simulated node
    pub nickname: String,

    /// Core tunables handed to every `MeshService`
    pub mesh: MeshConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nickname: "anon".to_string(),
            mesh: MeshConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blemesh");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value. Does not save.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mesh = &mut self.mesh;
        match key {
            "nickname" => {
                anyhow::ensure!(!value.is_empty(), "Nickname cannot be empty");
                self.nickname = value.to_string();
            }
            "default_ttl" => mesh.default_ttl = value.parse().context("Invalid ttl (0-255)")?,
            "retry_interval_ms" => {
                mesh.retry_interval_ms = value.parse().context("Invalid number")?
            }
            "max_retries" => mesh.max_retries = value.parse().context("Invalid number")?,
            "max_retry_queue" => mesh.max_retry_queue = value.parse().context("Invalid number")?,
            "seen_cache_capacity" => {
                mesh.seen_cache_capacity = value.parse().context("Invalid number")?
            }
            "fragment_threshold" => {
                mesh.fragment_threshold = value.parse().context("Invalid number")?
            }
            "fragment_size" => {
                let size: usize = value.parse().context("Invalid number")?;
                anyhow::ensure!(size > 0, "Fragment size must be positive");
                mesh.fragment_size = size;
            }
            "fragment_timeout_ms" => {
                mesh.fragment_timeout_ms = value.parse().context("Invalid number")?
            }
            "announce_interval_ms" => {
                mesh.announce_interval_ms = value.parse().context("Invalid number")?
            }
            "peer_timeout_ms" => mesh.peer_timeout_ms = value.parse().context("Invalid number")?,
            "status_cache_capacity" => {
                mesh.status_cache_capacity = value.parse().context("Invalid number")?
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let mesh = &self.mesh;
        vec![
            ("nickname".to_string(), self.nickname.clone()),
            ("default_ttl".to_string(), mesh.default_ttl.to_string()),
            ("retry_interval_ms".to_string(), mesh.retry_interval_ms.to_string()),
            ("max_retries".to_string(), mesh.max_retries.to_string()),
            ("max_retry_queue".to_string(), mesh.max_retry_queue.to_string()),
            ("seen_cache_capacity".to_string(), mesh.seen_cache_capacity.to_string()),
            ("fragment_threshold".to_string(), mesh.fragment_threshold.to_string()),
            ("fragment_size".to_string(), mesh.fragment_size.to_string()),
            ("fragment_timeout_ms".to_string(), mesh.fragment_timeout_ms.to_string()),
            ("announce_interval_ms".to_string(), mesh.announce_interval_ms.to_string()),
            ("peer_timeout_ms".to_string(), mesh.peer_timeout_ms.to_string()),
            ("status_cache_capacity".to_string(), mesh.status_cache_capacity.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.nickname, "anon");
        assert_eq!(config.mesh, MeshConfig::default());
    }

    #[test]
    fn test_load_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_set_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        config.set("nickname", "alice").unwrap();
        config.set("default_ttl", "3").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.nickname, "alice");
        assert_eq!(reloaded.mesh.default_ttl, 3);
        assert_eq!(reloaded.get("default_ttl").as_deref(), Some("3"));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("default_ttl", "300").is_err());
        assert!(config.set("fragment_size", "0").is_err());
        assert!(config.set("listen_port", "1").is_err());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"nickname": "bob"}"#).unwrap();
        assert_eq!(config.nickname, "bob");
        assert_eq!(config.mesh.max_retries, 3);
    }
}
