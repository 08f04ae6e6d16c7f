use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

/// Settings shared by `get` and `put`, read from
/// `<config dir>/zget/config.toml`.  Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZgetConfig {
    /// Port the sender listens on. `0` lets the OS pick one.
    pub port: u16,
    /// Network interface the sender advertises on.
    pub interface: Option<String>,
    /// How often the receiver checks whether a peer was found.
    pub poll_interval_ms: u64,
}

impl Default for ZgetConfig {
    fn default() -> Self {
        Self {
            port: 0,
            interface: None,
            poll_interval_ms: 500,
        }
    }
}

impl ZgetConfig {
    /// Default location of the configuration file, if the platform has a
    /// configuration directory.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("zget").join("config.toml"))
    }

    /// Loads the configuration from the default location, falling back to
    /// defaults when no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Like [`load`](Self::load) but from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed TOML or unknown keys.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse config")
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
