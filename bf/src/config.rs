//! BulkFlow configuration types and loading

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::loader::LoaderSettings;
use crate::pipeline::PipelineSettings;

/// Main BulkFlow configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Partition workers per phase (0 = one per CPU)
    pub workers: usize,

    /// Filesystem layout
    pub paths: PathsConfig,

    /// Bulk loader invocation
    pub loader: LoaderSettings,

    /// Lookup and reference caches
    pub cache: CacheConfig,

    /// Audit event persistence
    pub audit: AuditConfig,

    /// YAML document served by the static lookup/reference provider
    pub reference_data: Option<PathBuf>,

    /// Log level when `--log-level` is not given
    pub log_level: Option<String>,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if self.loader.command.trim().is_empty() {
            return Err(eyre::eyre!("loader.command must name the bulk-load executable"));
        }
        if self.loader.timeout_secs == 0 {
            return Err(eyre::eyre!("loader.timeout-secs must be greater than zero"));
        }
        if let Some(code) = self.loader.exit_codes.overlap() {
            return Err(eyre::eyre!("loader exit code {} is listed in more than one exit-codes set", code));
        }
        if self.cache.ttl_secs == 0 {
            return Err(eyre::eyre!("cache.ttl-secs must be greater than zero"));
        }
        if let Some(path) = &self.reference_data
            && !path.exists()
        {
            return Err(eyre::eyre!("reference data file not found: {}", path.display()));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .bulkflow.yml
        let local_config = PathBuf::from(".bulkflow.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/bulkflow/bulkflow.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("bulkflow").join("bulkflow.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Effective worker count
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            workers: self.worker_count(),
            temp_dir: self.paths.temp_dir.clone(),
            lookup_ttl: Duration::from_secs(self.cache.ttl_secs),
            lookup_max_entries: self.cache.max_entries,
            reference_max_age: Duration::from_secs(self.cache.reference_max_age_secs),
        }
    }
}

/// Filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PathsConfig {
    /// Where input files are discovered
    pub input_dir: PathBuf,

    /// Loader artifacts of successful loads
    pub archive_dir: PathBuf,

    /// Rejected records and artifacts of failed loads
    pub error_dir: PathBuf,

    /// Scratch space for artifacts in flight and job locks
    pub temp_dir: PathBuf,

    /// User control-file templates (`<name>.ctl.hbs`)
    pub template_dir: Option<PathBuf>,

    /// Job configurations (`<job-id>.yml`)
    pub job_dir: PathBuf,

    /// Secondary job configuration directory
    pub job_fallback_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        // Use XDG data directory (~/.local/share/bulkflow on Linux)
        let data = dirs::data_local_dir()
            .map(|d| d.join("bulkflow"))
            .unwrap_or_else(|| PathBuf::from(".bulkflow"));
        let template_dir = dirs::config_dir().map(|d| d.join("bulkflow").join("templates"));
        let job_fallback_dir = dirs::config_dir().map(|d| d.join("bulkflow").join("jobs"));

        Self {
            input_dir: PathBuf::from("input"),
            archive_dir: data.join("archive"),
            error_dir: data.join("error"),
            temp_dir: std::env::temp_dir().join("bulkflow"),
            template_dir,
            job_dir: PathBuf::from("jobs"),
            job_fallback_dir,
        }
    }
}

/// Cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Lookup cache entry lifetime
    pub ttl_secs: u64,

    /// Lookup cache size bound
    pub max_entries: usize,

    /// Reference key sets are reloaded after this age
    pub reference_max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 10_000,
            reference_max_age_secs: 3600,
        }
    }
}

/// Audit event persistence
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AuditConfig {
    /// JSONL run logs; defaults to `<data_local_dir>/bulkflow/runs`
    pub runs_dir: Option<PathBuf>,
}

impl AuditConfig {
    pub fn runs_dir(&self) -> Result<PathBuf> {
        match &self.runs_dir {
            Some(dir) => Ok(dir.clone()),
            None => crate::events::default_runs_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.loader.command, "sqlldr");
        assert_eq!(config.loader.timeout_secs, 3600);
        assert_eq!(config.cache.ttl_secs, 300);
        assert!(config.worker_count() >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
workers: 4
log-level: debug

paths:
  input-dir: /data/in
  archive-dir: /data/archive
  error-dir: /data/error
  temp-dir: /data/tmp
  job-dir: /etc/bulkflow/jobs

loader:
  command: /opt/oracle/bin/sqlldr
  timeout-secs: 600
  exit-codes:
    partial: [2, 4]
  retry:
    max-retries: 5

cache:
  ttl-secs: 60
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.workers, 4);
        assert_eq!(config.worker_count(), 4);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.paths.error_dir, PathBuf::from("/data/error"));
        assert_eq!(config.loader.command, "/opt/oracle/bin/sqlldr");
        assert_eq!(config.loader.exit_codes.partial, vec![2, 4]);
        assert_eq!(config.loader.exit_codes.success, vec![0]);
        assert_eq!(config.loader.retry.max_retries, 5);
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.cache.max_entries, 10_000);

        let settings = config.pipeline_settings();
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.temp_dir, PathBuf::from("/data/tmp"));
        assert_eq!(settings.lookup_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.loader.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overlapping_exit_codes() {
        let mut config = Config::default();
        config.loader.exit_codes.fatal.push(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let mut config = Config::default();
        config.loader.command = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bulkflow.yml");
        fs::write(&path, "workers: 2\naudit:\n  runs-dir: /var/log/bulkflow\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.audit.runs_dir().unwrap(), PathBuf::from("/var/log/bulkflow"));
    }

    #[test]
    fn test_missing_explicit_path_fails() {
        let missing = PathBuf::from("/nonexistent/bulkflow.yml");
        assert!(Config::load(Some(&missing)).is_err());
    }
}
