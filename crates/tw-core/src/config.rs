//! Configuration management.
//!
//! Loaded from a TOML file when present; every field has a default so an
//! absent file yields a working configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database path override; defaults under the platform data dir.
    pub db_path: Option<PathBuf>,
    pub recovery: RecoveryConfig,
    pub cleanup: CleanupConfig,
}

/// Tuning for restart detection and recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Total budget for waiting on a normal browser window to appear.
    pub window_wait_timeout_ms: u64,
    /// Interval between orphan garbage-collection sweeps.
    pub gc_interval_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            window_wait_timeout_ms: 5_000,
            gc_interval_secs: 6 * 60 * 60,
        }
    }
}

/// Retention for unresolved orphans.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Orphan windows whose `last_accessed` is older than this are deleted.
    pub orphan_max_age_days: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            orphan_max_age_days: 30,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or defaults when `path` is `None` or
    /// the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Resolve the database path (explicit override or platform default).
    #[must_use]
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tabwarden")
                .join("tabwarden.db")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_missing() {
        let config = Config::load(Some(Path::new("/nonexistent/tw.toml"))).unwrap();
        assert_eq!(config.cleanup.orphan_max_age_days, 30);
        assert_eq!(config.recovery.window_wait_timeout_ms, 5_000);
    }

    #[test]
    fn parses_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tw.toml");
        std::fs::write(&path, "[cleanup]\norphan_max_age_days = 7\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.cleanup.orphan_max_age_days, 7);
        // Untouched sections keep defaults.
        assert_eq!(config.recovery.gc_interval_secs, 6 * 60 * 60);
    }
}
