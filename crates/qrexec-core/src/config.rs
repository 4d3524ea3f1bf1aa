//! Configuration resolution for the qrexec client.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/qrexec/client.json)
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Directory holding the per-domain daemon sockets.
pub const DEFAULT_SOCKET_DIR: &str = "/var/run/qubes";

/// Interpreter used to run the local command line.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Environment variable through which the local command learns the domain.
pub const REMOTE_DOMAIN_ENV: &str = "QREXEC_REMOTE_DOMAIN";

/// Complete client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket_dir: PathBuf,
    pub shell: PathBuf,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            shell: PathBuf::from(DEFAULT_SHELL),
            log_level: "warn".to_string(),
            log_json: false,
        }
    }
}

impl Config {
    /// Daemon socket for `domain`: `<socket_dir>/qrexec.<domain>`.
    pub fn socket_path(&self, domain: &str) -> PathBuf {
        self.socket_dir.join(format!("qrexec.{domain}"))
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config() -> Result<Config> {
    let mut config = match global_config_path() {
        Some(path) if path.exists() => load_config_file(&path)?,
        _ => Config::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("qrexec").join("client.json"))
}

/// Read a JSON config file; missing keys fall back to defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply `QREXEC_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("QREXEC_SOCKET_DIR") {
        config.socket_dir = PathBuf::from(val);
    }
    if let Some(val) = lookup("QREXEC_SHELL") {
        config.shell = PathBuf::from(val);
    }
    if let Some(val) = lookup("QREXEC_LOG_LEVEL") {
        config.log_level = val;
    }
    if let Some(val) = lookup("QREXEC_LOG_JSON") {
        config.log_json = matches!(val.as_str(), "1" | "true" | "yes");
    }
}
