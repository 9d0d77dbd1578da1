//! Configuration loading and config file resolution
//!
//! The configuration is a small TOML key/value file. It is created with
//! defaults on first run and then passed explicitly to every component that
//! needs it.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable that overrides the config file location
pub const CONFIG_ENV_VAR: &str = "AFM_CONFIG";

/// Archive configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Intake directory root (SOURCE)
    pub source: PathBuf,
    /// Managed archive root (REPO)
    pub repo: PathBuf,
    /// Catalog database file; `<repo>/afm.db` when unset
    pub database: Option<PathBuf>,
    /// Maximum gap between a frame and the latest frame of a session it joins
    pub session_window_hours: u32,
    /// Masters scoring below this are registered unvalidated
    pub master_quality_threshold: f64,
    /// Concurrent hashing/ingest workers; 0 means available parallelism
    pub ingest_workers: usize,
    pub verify_timeout_secs: u64,
    pub synthesis_timeout_secs: u64,
    /// Upper bound on retrying a locked SQLite database
    pub max_lock_wait_ms: u64,
    /// External stacking program: `<cmd> <output> <inputs...>`
    pub combine_command: Option<String>,
    /// Directory mirrored as the cloud tier (e.g. a mounted bucket)
    pub cloud_root: Option<PathBuf>,
    pub log_level: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        let base = default_data_dir();
        Self {
            source: base.join("Source"),
            repo: base.join("Repository"),
            database: None,
            session_window_hours: 16,
            master_quality_threshold: 0.5,
            ingest_workers: 0,
            verify_timeout_secs: 120,
            synthesis_timeout_secs: 1800,
            max_lock_wait_ms: 5000,
            combine_command: None,
            cloud_root: None,
            log_level: "info".to_string(),
        }
    }
}

impl ArchiveConfig {
    /// Config rooted at explicit SOURCE/REPO directories, defaults otherwise
    pub fn with_roots(source: impl Into<PathBuf>, repo: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            repo: repo.into(),
            ..Self::default()
        }
    }

    /// Path of the catalog database
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.repo.join("afm.db"))
    }

    /// Session grouping window
    pub fn session_window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.session_window_hours))
    }

    /// Effective ingest worker count
    pub fn worker_count(&self) -> usize {
        if self.ingest_workers > 0 {
            return self.ingest_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    pub fn verify_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn synthesis_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.synthesis_timeout_secs)
    }

    /// Reject values that would make grouping or validation meaningless
    pub fn validate(&self) -> Result<()> {
        if self.session_window_hours == 0 {
            return Err(Error::Config(
                "session_window_hours must be greater than zero".to_string(),
            ));
        }
        if !self.master_quality_threshold.is_finite() || self.master_quality_threshold < 0.0 {
            return Err(Error::Config(format!(
                "master_quality_threshold must be a non-negative number, got {}",
                self.master_quality_threshold
            )));
        }
        if self.source == self.repo {
            return Err(Error::Config(format!(
                "source and repo must differ (both are {})",
                self.source.display()
            )));
        }
        Ok(())
    }
}

/// Config file resolution in priority order:
/// 1. Command-line argument
/// 2. `AFM_CONFIG` environment variable
/// 3. Platform config directory (`<config_dir>/afm/afm.toml`)
pub fn resolve_config_path(cli_arg: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    dirs::config_dir()
        .map(|d| d.join("afm").join("afm.toml"))
        .unwrap_or_else(|| PathBuf::from("./afm.toml"))
}

/// Load the configuration, writing a default file on first run
pub fn load_or_create(path: &Path) -> Result<ArchiveConfig> {
    if !path.exists() {
        let config = ArchiveConfig::default();
        write_config(&config, path)?;
        info!("Created default configuration: {}", path.display());
        return Ok(config);
    }

    let content = std::fs::read_to_string(path)?;
    let config: ArchiveConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;
    config.validate()?;

    info!("Loaded configuration: {}", path.display());
    Ok(config)
}

/// Write the configuration atomically (temp file + rename)
pub fn write_config(config: &ArchiveConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize config failed: {}", e)))?;

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    if let Err(e) = std::fs::rename(&tmp_path, path) {
        warn!("Atomic rename of {} failed: {}", tmp_path.display(), e);
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    Ok(())
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("afm"))
        .unwrap_or_else(|| PathBuf::from("./afm_data"))
}
