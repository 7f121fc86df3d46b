use crate::{FerryError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MANAGEMENT_PORT: u16 = 54321;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FerryConfig {
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Tunables for a single outgoing migration. Times are whole units as the
/// daemon's config file has always expressed them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Target downtime ceiling, milliseconds
    #[serde(default = "default_downtime")]
    pub migration_downtime: u64,
    /// Number of steps to reach the target ceiling
    #[serde(default = "default_downtime_steps")]
    pub migration_downtime_steps: u32,
    /// Seconds between downtime steps (0 applies them back to back)
    #[serde(default = "default_downtime_delay")]
    pub migration_downtime_delay: u64,
    /// Seconds to wait before asking a busy destination again
    #[serde(default = "default_retry_timeout")]
    pub migration_retry_timeout: u64,
    /// Seconds between job stats samples (at least 1)
    #[serde(default = "default_monitor_interval")]
    pub migration_monitor_interval: u64,
    /// Abort if remaining data has not shrunk for this many seconds (0 disables)
    #[serde(default = "default_progress_timeout")]
    pub migration_progress_timeout: u64,
    /// Abort after this many seconds per GiB of guest memory (0 disables)
    #[serde(default = "default_max_time_per_gib_mem")]
    pub migration_max_time_per_gib_mem: u64,
    /// Bandwidth cap in MiB/s (0 leaves the hypervisor default)
    #[serde(default = "default_max_bandwidth")]
    pub migration_max_bandwidth: u64,
    #[serde(default = "default_management_port")]
    pub management_port: u16,
    /// Seconds to wait for background tasks at teardown
    #[serde(default = "default_task_join_timeout")]
    pub task_join_timeout: u64,
    /// Upper bound on start attempts against a busy destination
    #[serde(default)]
    pub max_start_attempts: Option<u32>,
    /// Scheme of the hypervisor connection to the destination
    #[serde(default = "default_uri_scheme")]
    pub migration_uri_scheme: String,
    /// Let the hypervisor switch to post-copy when pre-copy cannot converge
    #[serde(default)]
    pub migration_allow_post_copy: bool,
}

fn default_downtime() -> u64 {
    500
}

fn default_downtime_steps() -> u32 {
    10
}

fn default_downtime_delay() -> u64 {
    75
}

fn default_retry_timeout() -> u64 {
    10
}

fn default_monitor_interval() -> u64 {
    10
}

fn default_progress_timeout() -> u64 {
    240
}

fn default_max_time_per_gib_mem() -> u64 {
    64
}

fn default_max_bandwidth() -> u64 {
    52
}

fn default_management_port() -> u16 {
    DEFAULT_MANAGEMENT_PORT
}

fn default_task_join_timeout() -> u64 {
    5
}

fn default_uri_scheme() -> String {
    "qemu+tls".to_string()
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migration_downtime: default_downtime(),
            migration_downtime_steps: default_downtime_steps(),
            migration_downtime_delay: default_downtime_delay(),
            migration_retry_timeout: default_retry_timeout(),
            migration_monitor_interval: default_monitor_interval(),
            migration_progress_timeout: default_progress_timeout(),
            migration_max_time_per_gib_mem: default_max_time_per_gib_mem(),
            migration_max_bandwidth: default_max_bandwidth(),
            management_port: default_management_port(),
            task_join_timeout: default_task_join_timeout(),
            max_start_attempts: None,
            migration_uri_scheme: default_uri_scheme(),
            migration_allow_post_copy: false,
        }
    }
}

impl MigrationConfig {
    /// Shortest timings the daemon accepts: downtime steps and retries back
    /// to back, job stats sampled every second, no stall limits. Used by
    /// tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            migration_downtime_delay: 0,
            migration_retry_timeout: 0,
            migration_monitor_interval: 1,
            migration_progress_timeout: 0,
            migration_max_time_per_gib_mem: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.migration_downtime == 0 {
            return Err(FerryError::ConfigError(
                "migration_downtime must be positive".to_string(),
            ));
        }
        if self.migration_downtime_steps == 0 {
            return Err(FerryError::ConfigError(
                "migration_downtime_steps must be at least 1".to_string(),
            ));
        }
        if self.migration_monitor_interval == 0 {
            return Err(FerryError::ConfigError(
                "migration_monitor_interval must be at least 1 second".to_string(),
            ));
        }
        if self.management_port == 0 {
            return Err(FerryError::ConfigError(
                "management_port must be non-zero".to_string(),
            ));
        }
        if self.migration_uri_scheme.is_empty() {
            return Err(FerryError::ConfigError(
                "migration_uri_scheme must not be empty".to_string(),
            ));
        }
        if self.max_start_attempts == Some(0) {
            return Err(FerryError::ConfigError(
                "max_start_attempts must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn downtime_delay(&self) -> Duration {
        Duration::from_secs(self.migration_downtime_delay)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.migration_retry_timeout)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.migration_monitor_interval)
    }

    pub fn progress_timeout(&self) -> Option<Duration> {
        (self.migration_progress_timeout > 0)
            .then(|| Duration::from_secs(self.migration_progress_timeout))
    }

    pub fn task_join_timeout(&self) -> Duration {
        Duration::from_secs(self.task_join_timeout)
    }

    /// Total time budget for a guest of `mem_size_mb`, if one applies.
    pub fn max_migration_time(&self, mem_size_mb: u64) -> Option<Duration> {
        if self.migration_max_time_per_gib_mem == 0 {
            return None;
        }
        // Round the guest up to a whole GiB so tiny guests still get a budget.
        let gib = mem_size_mb.div_ceil(1024).max(1);
        Some(Duration::from_secs(gib * self.migration_max_time_per_gib_mem))
    }
}

impl FerryConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: FerryConfig = toml::from_str(contents)?;
        config.migration.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| FerryError::ConfigError(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// `$XDG_CONFIG_HOME/ferry/ferry.toml`, or `/etc/ferry/ferry.toml` without a home.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("ferry").join("ferry.toml"))
            .unwrap_or_else(|| PathBuf::from("/etc/ferry/ferry.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_table_missing() {
        let config = FerryConfig::from_str("").unwrap();
        assert_eq!(config.migration, MigrationConfig::default());
        assert_eq!(config.migration.migration_downtime, 500);
        assert_eq!(config.migration.migration_downtime_steps, 10);
        assert_eq!(config.migration.management_port, 54321);
        assert!(config.migration.max_start_attempts.is_none());
    }

    #[test]
    fn test_config_parsing() {
        let toml_str = r#"
[migration]
migration_downtime = 1000
migration_downtime_steps = 5
migration_downtime_delay = 0
migration_retry_timeout = 3
max_start_attempts = 4
"#;

        let config = FerryConfig::from_str(toml_str).unwrap();
        let migration = &config.migration;
        assert_eq!(migration.migration_downtime, 1000);
        assert_eq!(migration.migration_downtime_steps, 5);
        assert_eq!(migration.downtime_delay(), Duration::ZERO);
        assert_eq!(migration.retry_timeout(), Duration::from_secs(3));
        assert_eq!(migration.max_start_attempts, Some(4));
        // untouched keys keep their defaults
        assert_eq!(migration.migration_monitor_interval, 10);
    }

    #[test]
    fn test_rejects_zero_steps() {
        let toml_str = "[migration]\nmigration_downtime_steps = 0\n";
        assert!(matches!(
            FerryConfig::from_str(toml_str),
            Err(FerryError::ConfigError(_))
        ));
    }

    #[test]
    fn test_rejects_zero_monitor_interval() {
        let toml_str = "[migration]\nmigration_monitor_interval = 0\n";
        assert!(matches!(
            FerryConfig::from_str(toml_str),
            Err(FerryError::ConfigError(_))
        ));
        assert!(MigrationConfig::immediate().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_downtime() {
        let toml_str = "[migration]\nmigration_downtime = 0\n";
        assert!(FerryConfig::from_str(toml_str).is_err());
    }

    #[test]
    fn test_max_migration_time() {
        let config = MigrationConfig::default();
        assert_eq!(
            config.max_migration_time(128),
            Some(Duration::from_secs(64))
        );
        assert_eq!(
            config.max_migration_time(4096),
            Some(Duration::from_secs(256))
        );
        assert_eq!(MigrationConfig::immediate().max_migration_time(4096), None);
        assert_eq!(MigrationConfig::immediate().progress_timeout(), None);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.toml");

        let mut config = FerryConfig::default();
        config.migration.migration_downtime_steps = 3;
        config.save_to_file(&path).unwrap();

        let reloaded = FerryConfig::from_file(&path).unwrap();
        assert_eq!(reloaded.migration, config.migration);
    }
}
