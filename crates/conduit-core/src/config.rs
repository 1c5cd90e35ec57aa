//! Configuration system for conduit.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CONDUIT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/conduit/config.toml
//!   3. ~/.config/conduit/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{CONNECT_TIMEOUT_SECS, DEFAULT_MAX_MESSAGE_SIZE};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConduitConfig {
    pub broker: BrokerConfig,
    pub child: ChildConfig,
    pub sudo: SudoConfig,
    pub ssh: SshConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Bootstrap deadline per connect attempt.
    pub connect_timeout_secs: u64,
    /// How long shutdown waits for streams to flush before force-closing.
    pub shutdown_timeout_secs: u64,
    /// How long a disconnected child may linger before it is killed.
    pub reap_timeout_secs: u64,
    /// Largest accepted payload, in bytes.
    pub max_message_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChildConfig {
    /// Program started on the far end. Empty = this executable's sibling
    /// `conduit-child`.
    pub child_path: String,
    /// Level filter applied to records a child forwards to the master.
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SudoConfig {
    pub sudo_path: String,
    /// Account passed to `sudo -u`.
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub ssh_path: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            shutdown_timeout_secs: 5,
            reap_timeout_secs: 10,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            child_path: String::new(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SudoConfig {
    fn default() -> Self {
        Self {
            sudo_path: "sudo".to_string(),
            username: "root".to_string(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            ssh_path: "ssh".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn reap_timeout(&self) -> Duration {
        Duration::from_secs(self.reap_timeout_secs)
    }
}

impl ChildConfig {
    /// The configured child program, or `conduit-child` next to the
    /// running executable.
    pub fn resolve_child_path(&self) -> PathBuf {
        if !self.child_path.is_empty() {
            return PathBuf::from(&self.child_path);
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("conduit-child")))
            .unwrap_or_else(|| PathBuf::from("conduit-child"))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ConduitConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            ConduitConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        Self::file_path_with(|key| std::env::var_os(key).map(PathBuf::from))
    }

    fn file_path_with(lookup: impl Fn(&str) -> Option<PathBuf>) -> PathBuf {
        if let Some(path) = lookup("CONDUIT_CONFIG") {
            return path;
        }
        lookup("XDG_CONFIG_HOME")
            .or_else(|| lookup("HOME").map(|home| home.join(".config")))
            .unwrap_or_else(std::env::temp_dir)
            .join("conduit")
            .join("config.toml")
    }

    /// Apply CONDUIT_* overrides. `lookup` is the environment in production.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CONDUIT_BROKER__CONNECT_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.broker.connect_timeout_secs = secs;
            }
        }
        if let Some(v) = lookup("CONDUIT_BROKER__MAX_MESSAGE_SIZE") {
            if let Ok(size) = v.parse() {
                self.broker.max_message_size = size;
            }
        }
        if let Some(v) = lookup("CONDUIT_CHILD__CHILD_PATH") {
            self.child.child_path = v;
        }
        if let Some(v) = lookup("CONDUIT_CHILD__LOG_LEVEL") {
            self.child.log_level = v;
        }
        if let Some(v) = lookup("CONDUIT_SUDO__SUDO_PATH") {
            self.sudo.sudo_path = v;
        }
        if let Some(v) = lookup("CONDUIT_SSH__SSH_PATH") {
            self.ssh.ssh_path = v;
        }
    }
}
