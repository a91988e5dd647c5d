//! Load/validate `config.yaml`; generate a commented template on first run
//! (spec §6, "Configuration file").

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

const CURRENT_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "defaults::connect_timeout_sec")]
    pub connect_timeout_sec: u64,
    #[serde(default = "defaults::retry_interval_sec")]
    pub retry_interval_sec: u64,
    #[serde(default = "defaults::max_retry_sec")]
    pub max_retry_sec: u64,
    #[serde(default = "defaults::max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            connect_timeout_sec: defaults::connect_timeout_sec(),
            retry_interval_sec: defaults::retry_interval_sec(),
            max_retry_sec: defaults::max_retry_sec(),
            max_concurrent_uploads: defaults::max_concurrent_uploads(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailSafeConfig {
    #[serde(default = "defaults::fail_safe_enable")]
    pub enable: bool,
    #[serde(default = "defaults::disk_min_free_percent")]
    pub disk_min_free_percent: u8,
}

impl Default for FailSafeConfig {
    fn default() -> Self {
        Self {
            enable: defaults::fail_safe_enable(),
            disk_min_free_percent: defaults::disk_min_free_percent(),
        }
    }
}

/// Top-level settings, deserialized from `config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub cache_dir: String,
    #[serde(default = "defaults::cache_size_gb")]
    pub cache_size_gb: f64,
    #[serde(default = "defaults::chunk_mb")]
    pub chunk_mb: u64,
    #[serde(default = "defaults::clean_interval_min")]
    pub clean_interval_min: u64,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub fail_safe: FailSafeConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_CONFIG_VERSION,
            cache_dir: String::new(),
            cache_size_gb: defaults::cache_size_gb(),
            chunk_mb: defaults::chunk_mb(),
            clean_interval_min: defaults::clean_interval_min(),
            upload: UploadConfig::default(),
            fail_safe: FailSafeConfig::default(),
        }
    }
}

mod defaults {
    pub fn cache_size_gb() -> f64 {
        10.0
    }
    pub fn chunk_mb() -> u64 {
        8
    }
    pub fn clean_interval_min() -> u64 {
        30
    }
    pub fn connect_timeout_sec() -> u64 {
        10
    }
    pub fn retry_interval_sec() -> u64 {
        15
    }
    pub fn max_retry_sec() -> u64 {
        300
    }
    pub fn max_concurrent_uploads() -> usize {
        4
    }
    pub fn fail_safe_enable() -> bool {
        true
    }
    pub fn disk_min_free_percent() -> u8 {
        10
    }
}

const TEMPLATE: &str = r#"# tigrisfs-cache configuration.
# See the component documentation for the full option reference.

# Schema version; must be 1.
version: 1

# Root directory for cached objects and the index. Empty string means
# ~/.tigrisfs/cache/<disk_id>.
cache_dir: ""

# Capacity ceiling for the cache, in gigabytes.
cache_size_gb: 10

# Preferred chunk granularity for range caching, in megabytes.
chunk_mb: 8

# Period, in minutes, between background cleaner passes.
clean_interval_min: 30

upload:
  # Per-upload connection timeout, in seconds.
  connect_timeout_sec: 10
  # Base backoff delay for retried uploads, in seconds.
  retry_interval_sec: 15
  # Maximum backoff delay, in seconds.
  max_retry_sec: 300
  # Number of concurrent upload workers.
  max_concurrent_uploads: 4

fail_safe:
  # Enable ENOSPC recovery (pause uploads, run emergency eviction).
  enable: true
  # Free-space floor, as a percentage of the cache filesystem, that
  # emergency eviction tries to restore.
  disk_min_free_percent: 10
"#;

impl Settings {
    /// Load and validate settings from a YAML file.
    ///
    /// Returns `CacheError::ConfigMissing` (after writing the commented
    /// template) if `path` does not exist yet, so the host can direct the
    /// operator to edit it before retrying.
    pub fn from_file(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            Self::write_default_config(path)?;
            return Err(CacheError::ConfigMissing);
        }

        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = serde_yaml::from_str(&raw)
            .map_err(|e| CacheError::ValidationError(vec![format!("yaml: {e}")]))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Write the commented default template to `path`, creating parent
    /// directories as needed. Does not overwrite an existing file.
    pub fn write_default_config(path: impl AsRef<Path>) -> CacheResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, TEMPLATE)?;
        Ok(())
    }

    pub fn validate(&self) -> CacheResult<()> {
        let mut issues = Vec::new();

        if self.version != CURRENT_CONFIG_VERSION {
            issues.push(format!(
                "version must be {CURRENT_CONFIG_VERSION}, got {}",
                self.version
            ));
        }
        if !(self.cache_size_gb > 0.0) {
            issues.push("cache_size_gb must be > 0".to_string());
        }
        if self.chunk_mb == 0 {
            issues.push("chunk_mb must be > 0".to_string());
        }
        if self.clean_interval_min == 0 {
            issues.push("clean_interval_min must be > 0".to_string());
        }
        if self.upload.connect_timeout_sec == 0 {
            issues.push("upload.connect_timeout_sec must be > 0".to_string());
        }
        if self.upload.retry_interval_sec == 0 {
            issues.push("upload.retry_interval_sec must be > 0".to_string());
        }
        if self.upload.max_retry_sec < self.upload.retry_interval_sec {
            issues.push("upload.max_retry_sec must be >= upload.retry_interval_sec".to_string());
        }
        if self.upload.max_concurrent_uploads == 0 {
            issues.push("upload.max_concurrent_uploads must be > 0".to_string());
        }
        if self.fail_safe.disk_min_free_percent == 0 || self.fail_safe.disk_min_free_percent > 100
        {
            issues.push("fail_safe.disk_min_free_percent must be in (0, 100]".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(CacheError::ValidationError(issues))
        }
    }

    /// Resolve `cache_dir`, substituting the default
    /// `~/.tigrisfs/cache/<disk_id>` when empty.
    pub fn resolved_cache_dir(&self, disk_id: &str) -> PathBuf {
        if self.cache_dir.is_empty() {
            let default = format!("~/.tigrisfs/cache/{disk_id}");
            PathBuf::from(shellexpand::tilde(&default).into_owned())
        } else {
            PathBuf::from(shellexpand::tilde(&self.cache_dir).into_owned())
        }
    }

    pub fn cache_size_bytes(&self) -> u64 {
        (self.cache_size_gb * 1_000_000_000.0) as u64
    }

    pub fn chunk_bytes(&self) -> u64 {
        self.chunk_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_writes_template_and_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");

        let err = Settings::from_file(&path).unwrap_err();
        assert!(matches!(err, CacheError::ConfigMissing));
        assert!(path.exists());
    }

    #[test]
    fn template_round_trips_to_valid_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        Settings::write_default_config(&path).unwrap();

        // Second call succeeds since the file now exists.
        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.version, 1);
        assert_eq!(settings.upload.max_concurrent_uploads, 4);
        settings.validate().unwrap();
    }

    #[test]
    fn rejects_bad_version() {
        let mut settings = Settings::default();
        settings.version = 2;
        let err = settings.validate().unwrap_err();
        match err {
            CacheError::ValidationError(issues) => assert_eq!(issues.len(), 1),
            _ => panic!("expected ValidationError"),
        }
    }

    #[test]
    fn rejects_retry_bounds() {
        let mut settings = Settings::default();
        settings.upload.max_retry_sec = 1;
        settings.upload.retry_interval_sec = 15;
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, CacheError::ValidationError(_)));
    }

    #[test]
    fn resolves_default_cache_dir_from_disk_id() {
        let settings = Settings::default();
        let resolved = settings.resolved_cache_dir("disk-1");
        assert!(resolved.to_string_lossy().contains("disk-1"));
        assert!(resolved.to_string_lossy().contains(".tigrisfs"));
    }
}
