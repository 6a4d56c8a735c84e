//! Configuration system for Basecamp agents.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BASECAMP_CONFIG (explicit override)
//!   2. `-c` on the run command line
//!   3. `basecamp.toml` next to the installed executable
//!
//! The file is rewritten in place when the running version changes after an
//! install, so defaults are materialised on first write rather than being
//! purely in-memory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BasecampConfig {
    pub service: ServiceConfig,
    pub releaser: ReleaserConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Version this installation is running. Rewritten by the installer.
    pub version: String,
    /// Default log filter directive (overridden by `-l` and RUST_LOG).
    pub log_level: String,
    /// Update staging directory. Relative paths resolve against the
    /// install root.
    pub update_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaserConfig {
    /// Server-side release catalog root. Relative paths resolve against the
    /// install root.
    pub release_path: PathBuf,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

impl Default for BasecampConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            releaser: ReleaserConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            version: "0.0.0".to_string(),
            log_level: "info".to_string(),
            update_path: PathBuf::from("updates"),
        }
    }
}

impl Default for ReleaserConfig {
    fn default() -> Self {
        Self {
            release_path: PathBuf::from("releases"),
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, #[source] toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, #[source] std::io::Error),
}

// ── Loading ──────────────────────────────────────────────────────────────────

/// Default config file name, placed next to the installed executable.
pub const CONFIG_FILE: &str = "basecamp.toml";

impl BasecampConfig {
    /// Load config from `path`: file → env overrides → defaults.
    /// A missing file yields defaults (with env overrides still applied).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            BasecampConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Rewrite the file at `path`, creating parent directories as needed.
    pub fn store(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
            }
        }
        let text = toml::to_string_pretty(self).expect("config always serializes");
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Write the defaults if no file exists yet. Returns whether a file was
    /// written.
    pub fn write_default_if_missing(path: &Path) -> Result<bool, ConfigError> {
        if path.exists() {
            return Ok(false);
        }
        BasecampConfig::default().store(path)?;
        Ok(true)
    }

    /// Resolve the config file path: $BASECAMP_CONFIG wins, otherwise
    /// `basecamp.toml` under `root`.
    pub fn file_path(root: &Path) -> PathBuf {
        std::env::var("BASECAMP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| root.join(CONFIG_FILE))
    }

    /// Apply BASECAMP_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BASECAMP_SERVICE__LOG_LEVEL") {
            self.service.log_level = v;
        }
        if let Ok(v) = std::env::var("BASECAMP_SERVICE__UPDATE_PATH") {
            self.service.update_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BASECAMP_RELEASER__RELEASE_PATH") {
            self.releaser.release_path = PathBuf::from(v);
        }
    }
}
