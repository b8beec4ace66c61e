// ABOUTME: Configuration for the relay factory and the worker pool hosted by `relayd serve`.
// ABOUTME: Loaded from TOML with sensible defaults for every field.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable through which spawned workers learn where to connect.
pub const RELAY_ENV: &str = "RELAYD_RELAY";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub factory: FactoryConfig,

    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FactoryConfig {
    /// Endpoint workers connect back to (e.g., "unix:///tmp/relayd.sock", "tcp://127.0.0.1:6001")
    #[serde(default = "default_relay")]
    pub relay: String,

    /// How long a spawn waits for its worker to connect and handshake
    #[serde(default = "default_relay_timeout_ms")]
    pub relay_timeout_ms: u64,

    /// How long an accepted connection may take to send its pid
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Worker command line. Empty runs this binary in worker mode.
    #[serde(default)]
    pub command: Vec<String>,

    /// Grace period between the stop frame and a forced kill
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Extra environment for every worker
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_relay() -> String {
    "unix:///tmp/relayd.sock".to_string()
}

fn default_relay_timeout_ms() -> u64 {
    60_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_num_workers() -> usize {
    4
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            relay: default_relay(),
            relay_timeout_ms: default_relay_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl FactoryConfig {
    pub fn with_relay(relay: impl Into<String>) -> Self {
        Self {
            relay: relay.into(),
            ..Self::default()
        }
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            command: Vec::new(),
            stop_grace_ms: default_stop_grace_ms(),
            env: HashMap::new(),
        }
    }
}

impl PoolConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path`, or defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Save config to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// Get the default config file path (~/.config/relayd/relayd.toml)
    pub fn default_path() -> PathBuf {
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("relayd")
            .join("relayd.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [factory]
            relay = "tcp://127.0.0.1:6001"
            relay_timeout_ms = 250

            [pool]
            num_workers = 2
            command = ["php", "worker.php"]
            env = {{ APP_ENV = "test" }}
        "#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.factory.relay, "tcp://127.0.0.1:6001");
        assert_eq!(config.factory.relay_timeout(), Duration::from_millis(250));
        assert_eq!(
            config.factory.handshake_timeout(),
            Duration::from_millis(default_handshake_timeout_ms())
        );
        assert_eq!(config.pool.num_workers, 2);
        assert_eq!(config.pool.command, vec!["php", "worker.php"]);
        assert_eq!(config.pool.env.get("APP_ENV").map(String::as_str), Some("test"));
        assert_eq!(config.pool.stop_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = NamedTempFile::new().unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.factory.relay, "unix:///tmp/relayd.sock");
        assert_eq!(config.factory.relay_timeout(), Duration::from_secs(60));
        assert!(config.pool.command.is_empty());
    }

    #[test]
    fn test_save_and_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relayd.toml");

        let mut config = Config::default();
        config.factory = FactoryConfig::with_relay("unix:///run/relayd.sock");
        config.pool.num_workers = 8;

        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[factory\nrelay = ").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_default_path_ends_with_relayd_toml() {
        assert!(Config::default_path().ends_with("relayd/relayd.toml"));
    }
}
