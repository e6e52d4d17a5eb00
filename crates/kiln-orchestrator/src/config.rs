//! Orchestrator configuration and config-file loading.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Runtime settings for monitor workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Delay between successful polls.
    pub poll_interval: Duration,
    /// Consecutive poll failures tolerated before the job is marked failed.
    pub max_consecutive_failures: u32,
    /// Backoff after the first failure; doubles per further failure.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on monitors polling at once; extra monitors wait for a slot.
    pub max_concurrent_monitors: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_consecutive_failures: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_concurrent_monitors: 32,
        }
    }
}

impl MonitorConfig {
    /// Backoff before retrying after `failures` consecutive failures (1-based).
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1u32 << exponent).min(self.max_backoff)
    }
}

/// Everything the orchestrator needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub monitor: MonitorConfig,
    /// Root of the job-scoped artifact directories.
    pub artifact_root: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { monitor: MonitorConfig::default(), artifact_root: default_kiln_dir().join("artifacts") }
    }
}

/// `~/.kiln`, or `./.kiln` when no home directory is known.
#[must_use]
pub fn default_kiln_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".kiln")
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read configuration file {}: {source}", path.display())]
    Read {
        /// File that could not be read
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration file {}: {source}", path.display())]
    Parse {
        /// File that could not be parsed
        path: PathBuf,
        /// Underlying TOML error
        #[source]
        source: toml::de::Error,
    },
}

/// `[monitor]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub poll_interval_secs: u64,
    pub max_consecutive_failures: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_concurrent_monitors: usize,
}

impl Default for MonitorSection {
    fn default() -> Self {
        let d = MonitorConfig::default();
        Self {
            poll_interval_secs: d.poll_interval.as_secs(),
            max_consecutive_failures: d.max_consecutive_failures,
            initial_backoff_ms: d.initial_backoff.as_millis() as u64,
            max_backoff_ms: d.max_backoff.as_millis() as u64,
            max_concurrent_monitors: d.max_concurrent_monitors,
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Defaults to `~/.kiln/artifacts`.
    pub artifact_root: Option<PathBuf>,
    /// Job records; defaults to `~/.kiln/jobs`.
    pub state_dir: Option<PathBuf>,
}

/// `[local]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSection {
    /// Per-step delay of the built-in dry-run trainer.
    pub step_delay_ms: u64,
}

impl Default for LocalSection {
    fn default() -> Self {
        Self { step_delay_ms: 200 }
    }
}

/// Contents of `config.toml` / `.kilnrc`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    pub log_level: Option<String>,
    pub monitor: MonitorSection,
    pub storage: StorageSection,
    pub local: LocalSection,
}

impl KilnConfig {
    /// Get default global configuration file path.
    #[must_use]
    pub fn default_global_path() -> PathBuf {
        default_kiln_dir().join("config.toml")
    }

    /// Get default local configuration file path.
    #[must_use]
    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".kilnrc")
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let value = read_toml(path)?;
        value.try_into().map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Loads the global config, then the local one on top of it, key by key.
    /// Missing files are skipped.
    pub fn discover_and_load() -> Result<Self, ConfigError> {
        Self::load_layered(&[Self::default_global_path(), Self::default_local_path()])
    }

    /// Merges `paths` in order (later files win) and parses the result.
    pub fn load_layered(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        let mut last_path = PathBuf::new();
        for path in paths {
            if !path.exists() {
                continue;
            }
            merge_toml(&mut merged, read_toml(path)?);
            last_path.clone_from(path);
        }
        merged.try_into().map_err(|source| ConfigError::Parse { path: last_path, source })
    }

    #[must_use]
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_secs(self.monitor.poll_interval_secs.max(1)),
            max_consecutive_failures: self.monitor.max_consecutive_failures.max(1),
            initial_backoff: Duration::from_millis(self.monitor.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.monitor.max_backoff_ms),
            max_concurrent_monitors: self.monitor.max_concurrent_monitors.max(1),
        }
    }

    #[must_use]
    pub fn artifact_root(&self) -> PathBuf {
        self.storage.artifact_root.clone().unwrap_or_else(|| default_kiln_dir().join("artifacts"))
    }

    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.storage.state_dir.clone().unwrap_or_else(|| default_kiln_dir().join("jobs"))
    }

    #[must_use]
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig { monitor: self.monitor_config(), artifact_root: self.artifact_root() }
    }
}

fn read_toml(path: &Path) -> Result<toml::Value, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
}

fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = MonitorConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(4), Duration::from_millis(500));
        assert_eq!(config.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_defaults_match_monitor_defaults() {
        let config = KilnConfig::default();
        assert_eq!(config.monitor_config(), MonitorConfig::default());
    }

    #[test]
    fn test_local_file_overrides_global_per_key() {
        let temp = TempDir::new().unwrap();
        let global = temp.path().join("config.toml");
        let local = temp.path().join(".kilnrc");
        std::fs::write(
            &global,
            "log_level = \"debug\"\n[monitor]\npoll_interval_secs = 30\nmax_consecutive_failures = 8\n",
        )
        .unwrap();
        std::fs::write(&local, "[monitor]\npoll_interval_secs = 5\n").unwrap();

        let config = KilnConfig::load_layered(&[global, local]).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.monitor.poll_interval_secs, 5);
        assert_eq!(config.monitor.max_consecutive_failures, 8);
        assert_eq!(config.local, LocalSection::default());
    }

    #[test]
    fn test_missing_files_are_skipped() {
        let temp = TempDir::new().unwrap();
        let config = KilnConfig::load_layered(&[temp.path().join("absent.toml")]).unwrap();
        assert_eq!(config, KilnConfig::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[monitor\n").unwrap();
        assert!(matches!(KilnConfig::load_from_file(&path), Err(ConfigError::Parse { .. })));
    }
}
